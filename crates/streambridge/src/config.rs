//! Adapter and server configuration.
//!
//! Defaults are overlaid with `STREAMBRIDGE_*` environment variables by
//! [`AdapterConfig::from_env`]; the CLI applies its flags on top.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::response::DEFAULT_HIGH_WATER_MARK;

pub const DEFAULT_LOCAL_ORIGIN: &str = "http://localhost:3000";

/// Largest request body the HTTP front buffers before dispatch.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub const ENV_LOCAL_ORIGIN: &str = "STREAMBRIDGE_LOCAL_ORIGIN";
pub const ENV_EXTERNAL: &str = "STREAMBRIDGE_EXTERNAL";
pub const ENV_HIGH_WATER_MARK: &str = "STREAMBRIDGE_HIGH_WATER_MARK";
pub const ENV_DEBUG: &str = "STREAMBRIDGE_DEBUG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid local origin '{origin}': {reason}")]
    InvalidOrigin { origin: String, reason: String },

    #[error("invalid value '{value}' for {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("cannot build pass-through client: {0}")]
    Client(String),
}

/// What the interceptor does with requests for origins other than the local
/// one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExternalPolicy {
    /// Answer 502 `External HTTP not supported`.
    Reject,
    /// Forward unmodified to the real network.
    #[default]
    PassThrough,
}

impl ExternalPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reject" => Some(Self::Reject),
            "pass-through" | "passthrough" => Some(Self::PassThrough),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdapterConfig {
    /// Origin served by the wrapped handler.
    pub local_origin: String,
    pub external: ExternalPolicy,
    /// Buffered bytes at which `ResponseSink::write` reports backpressure.
    pub high_water_mark: usize,
    /// Log every adapted call at info level.
    pub debug: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            local_origin: DEFAULT_LOCAL_ORIGIN.to_string(),
            external: ExternalPolicy::default(),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            debug: false,
        }
    }
}

impl AdapterConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(origin) = lookup(ENV_LOCAL_ORIGIN) {
            config.local_origin = origin;
        }
        if let Some(value) = lookup(ENV_EXTERNAL) {
            config.external = ExternalPolicy::parse(&value).ok_or(ConfigError::InvalidEnv {
                var: ENV_EXTERNAL,
                value,
            })?;
        }
        if let Some(value) = lookup(ENV_HIGH_WATER_MARK) {
            config.high_water_mark = match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: ENV_HIGH_WATER_MARK,
                        value,
                    });
                }
            };
        }
        if let Some(value) = lookup(ENV_DEBUG) {
            config.debug = parse_flag(&value).ok_or(ConfigError::InvalidEnv {
                var: ENV_DEBUG,
                value,
            })?;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<LocalOrigin, ConfigError> {
        LocalOrigin::parse(&self.local_origin)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Scheme and authority of the local origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalOrigin {
    url: Url,
}

impl LocalOrigin {
    pub fn parse(origin: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidOrigin {
            origin: origin.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(origin).map_err(|e| invalid(&e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https"));
        }
        if url.host_str().is_none() {
            return Err(invalid("missing host"));
        }
        Ok(Self { url })
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// True when `url` has the same scheme, host and effective port.
    pub fn matches(&self, url: &Url) -> bool {
        url.scheme() == self.url.scheme()
            && url.host_str() == self.url.host_str()
            && url.port_or_known_default() == self.url.port_or_known_default()
    }

    /// `scheme://host[:port]`, without a trailing slash.
    pub fn as_str(&self) -> String {
        self.url.origin().ascii_serialization()
    }

    /// Absolute URL for a path-and-query on this origin.
    pub fn join(&self, path_and_query: &str) -> String {
        format!("{}{}", self.as_str(), path_and_query)
    }
}

impl std::fmt::Display for LocalOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str())
    }
}

/// Listening address and request limits of the HTTP front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.addr().parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn defaults_serialize() {
        insta::assert_json_snapshot!(AdapterConfig::default(), @r#"
        {
          "localOrigin": "http://localhost:3000",
          "external": "pass-through",
          "highWaterMark": 16384,
          "debug": false
        }
        "#);
    }

    #[test]
    fn env_overlays_defaults() {
        let config = AdapterConfig::from_lookup(lookup(&[
            (ENV_LOCAL_ORIGIN, "https://app.local"),
            (ENV_EXTERNAL, "reject"),
            (ENV_HIGH_WATER_MARK, "1024"),
            (ENV_DEBUG, "1"),
        ]))
        .unwrap();

        assert_eq!(config.local_origin, "https://app.local");
        assert_eq!(config.external, ExternalPolicy::Reject);
        assert_eq!(config.high_water_mark, 1024);
        assert!(config.debug);
    }

    #[test]
    fn bad_env_values_are_errors() {
        for (var, value) in [
            (ENV_EXTERNAL, "sometimes"),
            (ENV_HIGH_WATER_MARK, "0"),
            (ENV_HIGH_WATER_MARK, "lots"),
            (ENV_DEBUG, "maybe"),
        ] {
            let err = AdapterConfig::from_lookup(lookup(&[(var, value)])).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidEnv { var: v, .. } if v == var));
        }
    }

    #[test]
    fn partial_config_deserializes_with_defaults() {
        let config: AdapterConfig =
            serde_json::from_str(r#"{"external": "reject"}"#).unwrap();
        assert_eq!(config.external, ExternalPolicy::Reject);
        assert_eq!(config.local_origin, DEFAULT_LOCAL_ORIGIN);
    }

    #[test]
    fn origin_matching_uses_effective_port() {
        let origin = AdapterConfig::default().validate().unwrap();
        assert_eq!(origin.to_string(), "http://localhost:3000");

        let same = Url::parse("http://localhost:3000/page?x=1").unwrap();
        let other_port = Url::parse("http://localhost:3001/").unwrap();
        let other_scheme = Url::parse("https://localhost:3000/").unwrap();
        assert!(origin.matches(&same));
        assert!(!origin.matches(&other_port));
        assert!(!origin.matches(&other_scheme));

        let https = LocalOrigin::parse("https://app.local").unwrap();
        assert!(https.matches(&Url::parse("https://app.local:443/x").unwrap()));
        assert_eq!(https.join("/a?b=1"), "https://app.local/a?b=1");
    }

    #[test]
    fn origin_must_be_http_with_host() {
        for origin in ["localhost:3000", "file:///tmp/x", "not a url", "ftp://host"] {
            assert!(
                matches!(LocalOrigin::parse(origin), Err(ConfigError::InvalidOrigin { .. })),
                "{origin}"
            );
        }
    }

    #[test]
    fn server_defaults() {
        let server = ServerConfig::default();
        assert_eq!(server.addr(), "127.0.0.1:3000");
        assert!(server.socket_addr().is_some());
        assert_eq!(server.max_body_bytes, DEFAULT_MAX_BODY_BYTES);
    }
}
