//! Cookie store boundary.

use async_trait::async_trait;
use url::Url;

use super::record::CookieRecord;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CookieStoreError {
    #[error("cookie store rejected '{name}': {reason}")]
    Rejected { name: String, reason: String },

    #[error("cookie store unavailable: {0}")]
    Unavailable(String),
}

/// Session cookie store indexed by URL.
///
/// Implementations serialize their own operations; callers add no locking.
#[async_trait]
pub trait CookieStore: Send + Sync {
    /// Cookies that would be sent with a request to `url`.
    async fn get(&self, url: &Url) -> Result<Vec<CookieRecord>, CookieStoreError>;

    /// Insert or replace `cookie` in the scope of `url`.
    async fn set(&self, url: &Url, cookie: CookieRecord) -> Result<(), CookieStoreError>;

    /// Remove the cookie called `name` in the scope of `url`.
    async fn remove(&self, url: &Url, name: &str) -> Result<(), CookieStoreError>;
}
