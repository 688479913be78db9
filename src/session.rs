//! Ephemeral session credentials for the public streaming API.
//!
//! Every physical connection needs a fresh single-use token, obtained by
//! POSTing to the control plane's `bullet-public` route. The response also
//! names the streaming server to use and its heartbeat parameters.

use crate::config::SessionConfig;
use crate::error::Error;
use crate::Result;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Success code returned by the control plane
const SUCCESS_CODE: &str = "200000";

/// Immutable snapshot of one token + server assignment.
///
/// Replaced wholesale on refresh, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    /// Single-use connect token
    pub token: String,
    /// Base URL of the assigned streaming server
    pub endpoint: String,
    /// Whether the server requires TLS
    pub require_encryption: bool,
    /// Server-suggested heartbeat cadence (advisory)
    pub ping_interval_ms: u64,
    /// Server-declared inactivity timeout
    pub raw_ping_timeout_ms: u64,
}

impl SessionCredentials {
    /// Client-side silence threshold in seconds: half the server timeout, minus one.
    pub fn effective_ping_timeout_secs(&self) -> i64 {
        (self.raw_ping_timeout_ms / 2000) as i64 - 1
    }

    /// Silence threshold as a duration, never shorter than one second.
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.effective_ping_timeout_secs().max(1) as u64)
    }

    /// Parse a `bullet-public` response body.
    ///
    /// The first listed instance server is selected.
    pub fn from_bullet_response(body: &str) -> Result<Self> {
        let response: BulletResponse = serde_json::from_str(body)?;

        if let Some(code) = response.code.as_deref() {
            if code != SUCCESS_CODE {
                return Err(Error::InvalidSession(format!(
                    "control plane returned code {}: {}",
                    code,
                    response.msg.unwrap_or_default()
                )));
            }
        }

        let data = response
            .data
            .ok_or_else(|| Error::InvalidSession("response has no data field".to_string()))?;

        if data.token.is_empty() {
            return Err(Error::InvalidSession("empty token".to_string()));
        }

        let server = data
            .instance_servers
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidSession("no instance servers listed".to_string()))?;

        if server.endpoint.is_empty() {
            return Err(Error::InvalidSession("empty server endpoint".to_string()));
        }

        Ok(Self {
            token: data.token,
            endpoint: server.endpoint,
            require_encryption: server.encrypt,
            ping_interval_ms: server.ping_interval,
            raw_ping_timeout_ms: server.ping_timeout,
        })
    }
}

#[derive(Debug, Deserialize)]
struct BulletResponse {
    code: Option<String>,
    msg: Option<String>,
    data: Option<BulletData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulletData {
    token: String,
    #[serde(default)]
    instance_servers: Vec<InstanceServer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceServer {
    endpoint: String,
    #[serde(default)]
    encrypt: bool,
    ping_interval: u64,
    ping_timeout: u64,
}

/// Source of session credentials.
///
/// Implementations perform a single request per call and never retry;
/// the connection decides what a failure costs.
pub trait SessionProvider: Send + Sync + 'static {
    /// Obtain a fresh credentials snapshot.
    fn fetch(&self) -> impl Future<Output = Result<SessionCredentials>> + Send;
}

/// Fetches credentials from the public token route over HTTP.
#[derive(Debug, Clone)]
pub struct BulletSessionProvider {
    client: reqwest::Client,
    url: String,
}

impl BulletSessionProvider {
    /// Create a provider for the configured control plane
    pub fn new(config: &SessionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            url: config.bullet_public_url(),
        })
    }

    /// URL the token is requested from
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl SessionProvider for BulletSessionProvider {
    async fn fetch(&self) -> Result<SessionCredentials> {
        debug!("Requesting connection token from {}", self.url);

        let body = self
            .client
            .post(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        SessionCredentials::from_bullet_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const BULLET_BODY: &str = r#"{
        "code": "200000",
        "data": {
            "token": "2neAiuYvAU61ZDXANAGAsiL4-iAExhsBXZxftpOeh_55i3Ysy2q2LEsEWU64mdzUOPusi34M_wGoSf7iNyEWJ4aBZXpWhrmY9jKtqkdWoFa75w3istPvPtiYB9J6i9GjsxUuhPw3BlrzazF6ghq4L_ZfKc7RwDf2mZhX2mtZ2FYgTJRbD4wq-9ycTgphqUjCSjG1Z7fWmYX3WEKcB44g",
            "instanceServers": [
                {
                    "endpoint": "wss://ws-api-spot.kucoin.com/",
                    "encrypt": true,
                    "protocol": "websocket",
                    "pingInterval": 18000,
                    "pingTimeout": 10000
                },
                {
                    "endpoint": "wss://backup.example.com/",
                    "encrypt": true,
                    "protocol": "websocket",
                    "pingInterval": 18000,
                    "pingTimeout": 10000
                }
            ]
        }
    }"#;

    fn credentials_with_timeout(raw_ping_timeout_ms: u64) -> SessionCredentials {
        SessionCredentials {
            token: "t".to_string(),
            endpoint: "wss://example.com".to_string(),
            require_encryption: true,
            ping_interval_ms: 18000,
            raw_ping_timeout_ms,
        }
    }

    #[test]
    fn test_parse_selects_first_server() {
        let creds = SessionCredentials::from_bullet_response(BULLET_BODY).unwrap();
        assert_eq!(creds.endpoint, "wss://ws-api-spot.kucoin.com/");
        assert!(creds.require_encryption);
        assert_eq!(creds.ping_interval_ms, 18000);
        assert_eq!(creds.raw_ping_timeout_ms, 10000);
        assert!(creds.token.starts_with("2neAiuYvAU61"));
    }

    #[test]
    fn test_effective_ping_timeout() {
        assert_eq!(credentials_with_timeout(60000).effective_ping_timeout_secs(), 29);
        assert_eq!(credentials_with_timeout(10000).effective_ping_timeout_secs(), 4);
        assert_eq!(credentials_with_timeout(61999).effective_ping_timeout_secs(), 29);
        assert_eq!(credentials_with_timeout(1000).effective_ping_timeout_secs(), -1);
    }

    #[test]
    fn test_ping_timeout_is_clamped() {
        assert_eq!(credentials_with_timeout(60000).ping_timeout(), Duration::from_secs(29));
        assert_eq!(credentials_with_timeout(0).ping_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_parse_rejects_empty_server_list() {
        let body = r#"{"code":"200000","data":{"token":"abc","instanceServers":[]}}"#;
        let err = SessionCredentials::from_bullet_response(body).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Session);
    }

    #[test]
    fn test_parse_rejects_error_code() {
        let body = r#"{"code":"429000","msg":"Too Many Requests"}"#;
        let err = SessionCredentials::from_bullet_response(body).unwrap_err();
        assert!(err.to_string().contains("429000"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(SessionCredentials::from_bullet_response("<html>bad gateway</html>").is_err());
        assert!(SessionCredentials::from_bullet_response(r#"{"code":"200000"}"#).is_err());
    }

    #[test]
    fn test_provider_url() {
        let provider = BulletSessionProvider::new(&SessionConfig::default()).unwrap();
        assert_eq!(provider.url(), "https://api.kucoin.com/api/v1/bullet-public");
    }
}
