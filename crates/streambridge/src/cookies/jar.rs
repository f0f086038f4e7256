//! In-memory cookie store.
//!
//! Cookies are indexed by the host of the URL they were set for, which is
//! how a browser session store scopes writes that come with an explicit URL.
//! Within a host, a cookie is identified by `(name, path)`.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use url::Url;

use super::record::CookieRecord;
use super::store::{CookieStore, CookieStoreError};

#[derive(Debug, Default)]
pub struct CookieJar {
    hosts: DashMap<String, Vec<CookieRecord>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored cookies across all hosts, expired ones included.
    pub fn len(&self) -> usize {
        self.hosts.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored cookie for `host`, without path or expiry filtering.
    pub fn cookies_for_host(&self, host: &str) -> Vec<CookieRecord> {
        self.hosts
            .get(host)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}

fn host_key(url: &Url) -> Result<String, CookieStoreError> {
    url.host_str()
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| CookieStoreError::Unavailable(format!("URL has no host: {url}")))
}

/// RFC 6265 default-path of a request URL.
fn default_path(url: &Url) -> String {
    let path = url.path();
    if !path.starts_with('/') {
        return "/".to_string();
    }
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// RFC 6265 path-match.
fn path_matches(cookie_path: &str, request_path: &str) -> bool {
    if cookie_path == request_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || request_path[cookie_path.len()..].starts_with('/'))
}

#[async_trait]
impl CookieStore for CookieJar {
    async fn get(&self, url: &Url) -> Result<Vec<CookieRecord>, CookieStoreError> {
        let host = host_key(url)?;
        let now = Utc::now();
        let secure_request = url.scheme() == "https";

        let Some(mut entry) = self.hosts.get_mut(&host) else {
            return Ok(Vec::new());
        };
        entry.retain(|c| !c.is_expired(now));

        Ok(entry
            .iter()
            .filter(|c| path_matches(c.path.as_deref().unwrap_or("/"), url.path()))
            .filter(|c| !c.secure || secure_request)
            .cloned()
            .collect())
    }

    async fn set(&self, url: &Url, mut cookie: CookieRecord) -> Result<(), CookieStoreError> {
        if cookie.name.is_empty() {
            return Err(CookieStoreError::Rejected {
                name: cookie.name,
                reason: "empty cookie name".to_string(),
            });
        }

        let host = host_key(url)?;
        if cookie.domain.is_none() {
            cookie.domain = Some(host.clone());
        }
        if cookie.path.is_none() {
            cookie.path = Some(default_path(url));
        }

        let mut entry = self.hosts.entry(host).or_default();
        let existing = entry
            .iter()
            .position(|c| c.name == cookie.name && c.path == cookie.path);
        match existing {
            Some(idx) => entry[idx] = cookie,
            None => entry.push(cookie),
        }
        Ok(())
    }

    async fn remove(&self, url: &Url, name: &str) -> Result<(), CookieStoreError> {
        let host = host_key(url)?;
        if let Some(mut entry) = self.hosts.get_mut(&host) {
            entry.retain(|c| {
                !(c.name == name && path_matches(c.path.as_deref().unwrap_or("/"), url.path()))
            });
        }
        Ok(())
    }
}
