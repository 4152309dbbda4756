//! Environment-sourced configuration (§6.3).
//!
//! The core only ever reads the three values named in the specification: the
//! contact-lookup REST base, the invitation redirect base, and the signaling
//! gateway URL. UI/branding variables are the embedding application's
//! concern and are never read here.

use thiserror::Error;
use url::Url;

/// Failure loading or validating [`CallCoreConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable was not set.
    #[error("missing environment variable {0}")]
    Missing(&'static str),
    /// A URL-valued variable did not parse as a URL.
    #[error("invalid URL in {name}: {source}")]
    InvalidUrl {
        /// Name of the offending environment variable.
        name: &'static str,
        /// Underlying parse failure.
        #[source]
        source: url::ParseError,
    },
    /// The signaling gateway URL did not use a websocket scheme.
    #[error("PROXY_URL must use ws:// or wss://, got {0}")]
    NotWebSocketScheme(String),
}

/// Runtime configuration for the call control core.
#[derive(Debug, Clone)]
pub struct CallCoreConfig {
    /// Base URL for the contact-lookup REST client (`REST_URL`).
    pub rest_url: Url,
    /// Base URL for invitation redirects (`INVITE_URL`).
    pub invite_url: Url,
    /// Signaling gateway URL, `ws://` or `wss://` (`PROXY_URL`).
    pub proxy_url: Url,
}

impl CallCoreConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if a variable is missing or does not parse as
    /// a valid URL, or if `PROXY_URL` does not use a websocket scheme.
    pub fn from_env() -> Result<Self, ConfigError> {
        let rest_url = parse_env_url("REST_URL")?;
        let invite_url = parse_env_url("INVITE_URL")?;
        let proxy_url = parse_env_url("PROXY_URL")?;
        if proxy_url.scheme() != "ws" && proxy_url.scheme() != "wss" {
            return Err(ConfigError::NotWebSocketScheme(proxy_url.to_string()));
        }
        Ok(Self {
            rest_url,
            invite_url,
            proxy_url,
        })
    }

    /// Build a config directly from URLs, bypassing the environment.
    ///
    /// # Errors
    /// Returns [`ConfigError::NotWebSocketScheme`] if `proxy_url` is not a
    /// websocket URL.
    pub fn new(rest_url: Url, invite_url: Url, proxy_url: Url) -> Result<Self, ConfigError> {
        if proxy_url.scheme() != "ws" && proxy_url.scheme() != "wss" {
            return Err(ConfigError::NotWebSocketScheme(proxy_url.to_string()));
        }
        Ok(Self {
            rest_url,
            invite_url,
            proxy_url,
        })
    }
}

fn parse_env_url(name: &'static str) -> Result<Url, ConfigError> {
    let raw = std::env::var(name).map_err(|_| ConfigError::Missing(name))?;
    Url::parse(&raw).map_err(|source| ConfigError::InvalidUrl { name, source })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_ws_proxy_scheme() {
        let rest = Url::parse("https://contacts.example.com").unwrap();
        let invite = Url::parse("https://invite.example.com").unwrap();
        let proxy = Url::parse("https://gateway.example.com").unwrap();
        let err = CallCoreConfig::new(rest, invite, proxy).unwrap_err();
        assert!(matches!(err, ConfigError::NotWebSocketScheme(_)));
    }

    #[test]
    fn accepts_wss_proxy_scheme() {
        let rest = Url::parse("https://contacts.example.com").unwrap();
        let invite = Url::parse("https://invite.example.com").unwrap();
        let proxy = Url::parse("wss://gateway.example.com/ws").unwrap();
        let config = CallCoreConfig::new(rest, invite, proxy).unwrap();
        assert_eq!(config.proxy_url.scheme(), "wss");
    }
}
