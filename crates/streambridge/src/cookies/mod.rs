//! Cookie state shared between the session cookie store and the handler.
//!
//! # Architecture
//!
//! - **record**: `CookieRecord` and `Cookie` request-header serialization
//! - **store**: the async `CookieStore` boundary (URL-indexed get/set/remove)
//! - **jar**: in-memory `CookieStore` implementation
//! - **parse**: `Set-Cookie` un-folding and attribute parsing
//! - **sync**: applies a response's `Set-Cookie` values to a store

mod jar;
mod parse;
mod record;
mod store;
mod sync;

pub use jar::CookieJar;
pub use parse::{CookieParseError, SetCookie, parse_set_cookie, split_set_cookie};
pub use record::{CookieRecord, SameSite, serialize_cookie_header};
pub use store::{CookieStore, CookieStoreError};
pub use sync::{CookieFailure, CookieSyncError, SyncOp, SyncReport, sync_cookies};
