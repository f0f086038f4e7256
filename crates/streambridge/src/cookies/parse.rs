//! `Set-Cookie` parsing.
//!
//! Servers may fold several `Set-Cookie` entries into one header value
//! separated by commas. Commas also appear inside `Expires` dates, so a comma
//! only separates cookies when the text after it looks like `token=`.

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};

use super::record::{CookieRecord, SameSite};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CookieParseError {
    #[error("empty cookie string")]
    Empty,

    #[error("missing '=' in cookie pair '{0}'")]
    MissingPair(String),

    #[error("empty cookie name in '{0}'")]
    EmptyName(String),
}

/// A parsed `Set-Cookie` value, before expiry is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    pub expires: Option<DateTime<Utc>>,
    /// Seconds, as sent. May be zero or negative.
    pub max_age: Option<i64>,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
}

impl SetCookie {
    /// Effective expiry: `Expires` if present, else `now + Max-Age`, else
    /// `None` for a session cookie.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(expires) = self.expires {
            return Some(expires);
        }
        self.max_age.map(|secs| {
            TimeDelta::try_seconds(secs)
                .and_then(|delta| now.checked_add_signed(delta))
                .unwrap_or(if secs > 0 {
                    DateTime::<Utc>::MAX_UTC
                } else {
                    DateTime::<Utc>::MIN_UTC
                })
        })
    }

    pub fn into_record(self, now: DateTime<Utc>) -> CookieRecord {
        let expires_at = self.expires_at(now);
        CookieRecord {
            name: self.name,
            value: self.value,
            domain: self.domain,
            path: self.path,
            secure: self.secure,
            http_only: self.http_only,
            same_site: self.same_site,
            expires_at,
        }
    }
}

/// Split one (possibly folded) `Set-Cookie` header value into cookie strings.
pub fn split_set_cookie(header: &str) -> Vec<String> {
    let bytes = header.as_bytes();
    let len = bytes.len();
    let mut cookies = Vec::new();
    let mut start = 0;
    let mut pos = 0;

    let mut push = |piece: &str| {
        let piece = piece.trim();
        if !piece.is_empty() {
            cookies.push(piece.to_string());
        }
    };

    while pos < len {
        if bytes[pos] != b',' {
            pos += 1;
            continue;
        }

        let comma = pos;
        let mut next = comma + 1;
        while next < len && bytes[next].is_ascii_whitespace() {
            next += 1;
        }
        let token_start = next;
        while next < len && !matches!(bytes[next], b'=' | b';' | b',') {
            next += 1;
        }

        if next < len && bytes[next] == b'=' && next > token_start {
            push(&header[start..comma]);
            start = token_start;
            pos = next;
        } else {
            pos = comma + 1;
        }
    }
    push(&header[start..]);

    cookies
}

/// Parse a single cookie string (already un-folded).
pub fn parse_set_cookie(cookie: &str) -> Result<SetCookie, CookieParseError> {
    let mut parts = cookie.split(';');
    let pair = parts.next().map(str::trim).unwrap_or_default();
    if pair.is_empty() {
        return Err(CookieParseError::Empty);
    }

    let (name, value) = pair
        .split_once('=')
        .ok_or_else(|| CookieParseError::MissingPair(pair.to_string()))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(CookieParseError::EmptyName(pair.to_string()));
    }

    let mut parsed = SetCookie {
        name: name.to_string(),
        value: value.trim().to_string(),
        expires: None,
        max_age: None,
        domain: None,
        path: None,
        secure: false,
        http_only: false,
        same_site: None,
    };

    for attr in parts {
        let (key, val) = match attr.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => (attr.trim(), ""),
        };

        match key.to_ascii_lowercase().as_str() {
            "expires" => {
                if let Some(at) = parse_cookie_date(val) {
                    parsed.expires = Some(at);
                }
            }
            "max-age" => {
                if let Ok(secs) = val.parse::<i64>() {
                    parsed.max_age = Some(secs);
                }
            }
            "domain" if !val.is_empty() => {
                parsed.domain = Some(val.trim_start_matches('.').to_ascii_lowercase());
            }
            "path" if val.starts_with('/') => parsed.path = Some(val.to_string()),
            "secure" => parsed.secure = true,
            "httponly" => parsed.http_only = true,
            "samesite" => parsed.same_site = SameSite::parse(val),
            _ => {}
        }
    }

    Ok(parsed)
}

fn parse_cookie_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc2822(value) {
        return Some(at.with_timezone(&Utc));
    }

    // RFC 850 and asctime spellings still show up in the wild.
    const FORMATS: &[&str] = &[
        "%a, %d-%b-%Y %H:%M:%S GMT",
        "%A, %d-%b-%y %H:%M:%S GMT",
        "%a %b %e %H:%M:%S %Y",
    ];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}
