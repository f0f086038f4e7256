//! Demo application mounted behind the interceptor.
//!
//! - `GET /`: page that posts to `/test` and shows the cookies it got back
//! - `POST /test`: echoes the body as JSON and bumps the `iteration` cookie
//! - `GET /stream`: a body written in several delayed chunks

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    http::{HeaderMap, header},
    response::{AppendHeaders, Html, IntoResponse},
    routing::{get, post},
};
use serde_json::json;

const COOKIE_MAX_AGE_SECS: u32 = 60 * 60;
const STREAM_CHUNKS: u32 = 5;
const STREAM_DELAY: Duration = Duration::from_millis(100);

pub fn app() -> Router {
    Router::new()
        .route("/", get(index))
        .route("/test", post(test))
        .route("/stream", get(stream))
}

async fn index() -> Html<String> {
    Html(format!(
        r#"<!doctype html>
<html>
<head><title>streambridge demo</title></head>
<body>
<pre id="out">streambridge {version}</pre>
<script>
fetch('/test', {{ method: 'POST', body: 'Hello from frontend!' }})
  .then((res) => res.json())
  .then((json) => {{
    document.getElementById('out').textContent +=
      '\nAPI response: ' + JSON.stringify(json, null, 2) +
      '\nFrontend cookie: ' + document.cookie;
  }});
</script>
</body>
</html>
"#,
        version = env!("CARGO_PKG_VERSION"),
    ))
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

async fn test(headers: HeaderMap, body: String) -> impl IntoResponse {
    let iteration: u64 = cookie_value(&headers, "iteration")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let now = chrono::Utc::now().timestamp_millis();

    let set_cookie = |name: &str, value: String| {
        (
            header::SET_COOKIE,
            format!("{name}={value}; Path=/; Max-Age={COOKIE_MAX_AGE_SECS}"),
        )
    };

    (
        AppendHeaders([
            set_cookie("iteration", (iteration + 1).to_string()),
            set_cookie("date", now.to_string()),
            set_cookie("sidebar:state", now.to_string()),
        ]),
        Json(json!({ "message": format!("Hello from streambridge! in response to {body}") })),
    )
}

async fn stream() -> Body {
    let chunks = futures::stream::unfold(0u32, |i| async move {
        if i == STREAM_CHUNKS {
            return None;
        }
        if i > 0 {
            tokio::time::sleep(STREAM_DELAY).await;
        }
        let chunk = Bytes::from(format!("chunk {i}\n"));
        Some((Ok::<_, Infallible>(chunk), i + 1))
    });
    Body::from_stream(chunks)
}
