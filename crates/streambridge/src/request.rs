//! Request translation: captured request → adapted request.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::http::Method;
use bytes::Bytes;
use futures::Stream;
use url::Url;

use crate::channel::SyntheticChannel;
use crate::cookies::{CookieStore, serialize_cookie_header};
use crate::error::AdapterError;
use crate::headers::HeaderList;

/// Request as delivered by the capture layer. Read-only to the adapter.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    /// Absolute URL, scheme and host included.
    pub url: String,
    pub headers: HeaderList,
    pub body: Option<Bytes>,
}

impl CapturedRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: HeaderList::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn parse_url(&self) -> Result<Url, AdapterError> {
        Url::parse(&self.url)
            .map_err(|e| AdapterError::RequestTranslation(format!("invalid URL '{}': {e}", self.url)))
    }
}

/// Finite request body: at most one chunk, then end-of-stream.
#[derive(Debug, Default)]
pub struct RequestBody {
    chunk: Option<Bytes>,
}

impl RequestBody {
    pub fn empty() -> Self {
        Self::default()
    }

    fn from_captured(body: Option<&Bytes>) -> Self {
        Self {
            chunk: body.filter(|b| !b.is_empty()).cloned(),
        }
    }

    /// True once the single chunk (if any) has been taken.
    pub fn is_end_stream(&self) -> bool {
        self.chunk.is_none()
    }

    /// Remaining body bytes, consuming the stream.
    pub fn into_bytes(self) -> Bytes {
        self.chunk.unwrap_or_default()
    }

    /// Adapt into a fallible stream, as `http` body constructors expect.
    pub fn into_try_stream(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
        futures::StreamExt::map(self, Ok::<Bytes, Infallible>)
    }
}

impl Stream for RequestBody {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        Poll::Ready(self.chunk.take())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::from(self.chunk.is_some());
        (n, Some(n))
    }
}

/// Decoded view of the adapted URL, handed to the handler next to the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    pub pathname: String,
    /// Raw query string including the leading `?`, if any.
    pub search: Option<String>,
    pub query: Vec<(String, String)>,
}

impl ParsedUrl {
    fn from_url(url: &Url) -> Self {
        Self {
            pathname: url.path().to_string(),
            search: url.query().map(|q| format!("?{q}")),
            query: url.query_pairs().into_owned().collect(),
        }
    }

    /// Path plus query, the form the handler routes on.
    pub fn path_and_query(&self) -> String {
        match &self.search {
            Some(search) => format!("{}{}", self.pathname, search),
            None => self.pathname.clone(),
        }
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Request handed to the streaming handler.
#[derive(Debug)]
pub struct AdaptedRequest {
    method: Method,
    url: String,
    headers: HeaderList,
    body: RequestBody,
    channel: Arc<SyntheticChannel>,
}

impl AdaptedRequest {
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Path and query only; never carries scheme or host.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    pub fn channel(&self) -> &Arc<SyntheticChannel> {
        &self.channel
    }

    pub fn body_mut(&mut self) -> &mut RequestBody {
        &mut self.body
    }

    pub fn into_parts(self) -> (Method, String, HeaderList, RequestBody) {
        (self.method, self.url, self.headers, self.body)
    }
}

/// Translate `captured` for the handler, attaching the store's cookies for
/// its URL.
///
/// The `cookie` header is replaced, not merged: the capture layer does not
/// expose cookies, only the store does. A failed lookup aborts the call
/// before the handler sees anything.
pub async fn translate(
    captured: &CapturedRequest,
    cookies: &dyn CookieStore,
    channel: Arc<SyntheticChannel>,
) -> Result<(AdaptedRequest, ParsedUrl), AdapterError> {
    if channel.is_released() {
        return Err(AdapterError::RequestTranslation(
            "synthetic channel already released".to_string(),
        ));
    }

    let method = Method::from_bytes(captured.method.as_bytes()).map_err(|e| {
        AdapterError::RequestTranslation(format!("invalid method '{}': {e}", captured.method))
    })?;
    let url = captured.parse_url()?;
    if url.cannot_be_a_base() {
        return Err(AdapterError::RequestTranslation(format!(
            "URL '{}' has no path",
            captured.url
        )));
    }

    let matched = cookies
        .get(&url)
        .await
        .map_err(|source| AdapterError::CookieLookup {
            url: url.to_string(),
            source,
        })?;

    let mut headers = captured.headers.clone();
    headers.remove("cookie");
    if let Some(cookie_header) = serialize_cookie_header(&matched) {
        headers.append("cookie", cookie_header);
    }

    let parsed = ParsedUrl::from_url(&url);
    let request = AdaptedRequest {
        method,
        url: parsed.path_and_query(),
        headers,
        body: RequestBody::from_captured(captured.body.as_ref()),
        channel,
    };

    Ok((request, parsed))
}
