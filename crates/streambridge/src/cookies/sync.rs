//! Applies a response's outgoing cookies to the cookie store.
//!
//! Every write is scoped by the request URL, not by the cookie's own
//! `Domain`/`Path`: the store indexes by URL. Cookies are handled
//! independently and failures are reported together once all of them have
//! been attempted.

use std::fmt;

use chrono::{DateTime, Utc};
use url::Url;

use super::parse::{CookieParseError, parse_set_cookie, split_set_cookie};
use super::store::{CookieStore, CookieStoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOp {
    Upsert,
    Remove,
}

impl SyncOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Remove => "remove",
        }
    }
}

/// What a successful (or partially successful) sync did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub upserted: Vec<String>,
    pub removed: Vec<String>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum CookieFailure {
    Parse {
        cookie: String,
        error: CookieParseError,
    },
    Store {
        name: String,
        op: SyncOp,
        error: CookieStoreError,
    },
}

impl fmt::Display for CookieFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse { cookie, error } => write!(f, "'{cookie}' ({error})"),
            Self::Store { name, op, error } => write!(f, "{name} ({} failed: {error})", op.as_str()),
        }
    }
}

/// Aggregated failure of a cookie sync. The cookies that did apply are in
/// `applied`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to sync {} cookie(s) for {url}: {}", .failures.len(), join_failures(.failures))]
pub struct CookieSyncError {
    pub url: String,
    pub failures: Vec<CookieFailure>,
    pub applied: SyncReport,
}

fn join_failures(failures: &[CookieFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Reconcile `set_cookie_values` (raw header values, possibly folded) into
/// `store` for `url`.
pub async fn sync_cookies<'a, I>(
    store: &dyn CookieStore,
    url: &Url,
    set_cookie_values: I,
    now: DateTime<Utc>,
) -> Result<SyncReport, CookieSyncError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut report = SyncReport::default();
    let mut failures = Vec::new();

    for raw in set_cookie_values.into_iter().flat_map(split_set_cookie) {
        let parsed = match parse_set_cookie(&raw) {
            Ok(parsed) => parsed,
            Err(error) => {
                tracing::debug!(cookie = %raw, error = %error, "Skipping unparseable Set-Cookie");
                failures.push(CookieFailure::Parse { cookie: raw, error });
                continue;
            }
        };

        let record = parsed.into_record(now);
        let name = record.name.clone();

        let (op, result) = if record.is_expired(now) {
            (SyncOp::Remove, store.remove(url, &name).await)
        } else {
            (SyncOp::Upsert, store.set(url, record).await)
        };

        match result {
            Ok(()) => {
                tracing::trace!(cookie = %name, op = op.as_str(), url = %url, "Cookie synced");
                match op {
                    SyncOp::Upsert => report.upserted.push(name),
                    SyncOp::Remove => report.removed.push(name),
                }
            }
            Err(error) => failures.push(CookieFailure::Store { name, op, error }),
        }
    }

    if failures.is_empty() {
        Ok(report)
    } else {
        Err(CookieSyncError {
            url: url.to_string(),
            failures,
            applied: report,
        })
    }
}
