//! Device authorization and token caching.
//!
//! The device proves its identity by POSTing a signed registration request
//! to `/api/v1/auth/device`:
//!
//! ```text
//! POST /api/v1/auth/device
//! X-RDFM-Device-Signature: <base64 RSA-SHA256 signature of the body bytes>
//!
//! {"metadata": {...}, "public_key": "<PEM>", "timestamp": <epoch ms>}
//! ```
//!
//! - `200 {"token": "...", "expires": <seconds>}` — token cached until
//!   `timestamp + expires - grace`
//! - `401` — the device is not (yet) accepted by an administrator
//! - anything else — treated as a connection failure
//!
//! [`DeviceTokenProvider::fetch_token`] serializes the check-then-refresh
//! sequence behind a single async mutex, so concurrent callers either see the
//! cached token or wait for the one in-flight registration.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::device::keys::DeviceKey;
use crate::device::DeviceInfo;
use crate::error::AuthError;
use crate::util::now_millis;

/// Header carrying the base64 request signature.
pub const SIGNATURE_HEADER: &str = "X-RDFM-Device-Signature";

/// Source of bearer tokens for server requests.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return a token that is valid for at least the configured grace period.
    async fn fetch_token(&self) -> Result<String, AuthError>;
}

/// Format a token for the `Authorization` header.
pub fn bearer_header(token: &str) -> String {
    format!("Bearer token={token}")
}

/// A cached bearer token and the instant (Unix ms) it stops being used.
#[derive(Debug, Clone)]
pub struct DeviceToken {
    pub value: String,
    pub expires_at_ms: u64,
}

impl DeviceToken {
    fn is_valid_at(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    metadata: BTreeMap<&'static str, String>,
    public_key: &'a str,
    timestamp: u64,
}

#[derive(Deserialize)]
struct RegisterResponse {
    token: String,
    expires: u64,
}

/// Registers the device with the server and caches the resulting token.
pub struct DeviceTokenProvider {
    http: reqwest::Client,
    register_url: String,
    device: Arc<DeviceInfo>,
    key: Arc<dyn DeviceKey>,
    grace: Duration,
    cached: Mutex<Option<DeviceToken>>,
}

impl DeviceTokenProvider {
    pub fn new(
        server_base_url: &str,
        device: Arc<DeviceInfo>,
        key: Arc<dyn DeviceKey>,
        grace: Duration,
        request_timeout: Duration,
    ) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            register_url: format!("{}/api/v1/auth/device", server_base_url.trim_end_matches('/')),
            device,
            key,
            grace,
            cached: Mutex::new(None),
        })
    }

    /// Expiry (Unix ms) of the cached token, if any.
    pub async fn token_expiry(&self) -> Option<u64> {
        self.cached.lock().await.as_ref().map(|t| t.expires_at_ms)
    }

    /// Send one registration request. Does not touch the cache.
    pub async fn register(&self) -> Result<DeviceToken, AuthError> {
        let timestamp = now_millis();
        let public_key = self.key.public_key_pem()?;
        let body = serde_json::to_vec(&RegisterRequest {
            metadata: self.device.metadata(),
            public_key: &public_key,
            timestamp,
        })
        .map_err(|e| AuthError::ConnectionFailed(format!("failed to encode request: {e}")))?;
        let signature = base64::engine::general_purpose::STANDARD.encode(self.key.sign(&body)?);

        let resp = self
            .http
            .post(&self.register_url)
            .header(SIGNATURE_HEADER, signature)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        match resp.status().as_u16() {
            200 => {
                let parsed: RegisterResponse = resp.json().await.map_err(|e| {
                    AuthError::ConnectionFailed(format!("invalid registration response: {e}"))
                })?;
                info!("Device authorized, token expires in {}s", parsed.expires);
                Ok(DeviceToken {
                    value: parsed.token,
                    expires_at_ms: timestamp + self.usable_lifetime_ms(parsed.expires),
                })
            }
            401 => {
                info!("Device unauthorized, waiting for the server administrator to accept it");
                Err(AuthError::Unauthorized)
            }
            status => {
                warn!("Unexpected status code in registration response: {status}");
                Err(AuthError::ConnectionFailed(format!(
                    "registration returned HTTP {status}"
                )))
            }
        }
    }

    /// Lifetime the token is actually used for: shortened by the grace period
    /// unless that would leave nothing.
    fn usable_lifetime_ms(&self, expires_secs: u64) -> u64 {
        let lifetime = expires_secs.saturating_mul(1000);
        #[allow(clippy::cast_possible_truncation)]
        let grace = self.grace.as_millis() as u64;
        if lifetime > grace {
            lifetime - grace
        } else {
            lifetime
        }
    }
}

#[async_trait]
impl TokenProvider for DeviceTokenProvider {
    async fn fetch_token(&self) -> Result<String, AuthError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_valid_at(now_millis()) {
                return Ok(token.value.clone());
            }
        }
        debug!("Token missing or expired, sending device registration");
        let token = self.register().await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::*;
    use crate::testutil::{spawn_server, test_device, StaticKey};

    fn provider(base: &str, grace_ms: u64) -> DeviceTokenProvider {
        DeviceTokenProvider::new(
            base,
            Arc::new(test_device()),
            Arc::new(StaticKey),
            Duration::from_millis(grace_ms),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    /// Registration endpoint answering `status` with a token lifetime of
    /// `expires` seconds after `delay_ms`. Returns the base URL and hit counter.
    async fn registration_server(status: u16, expires: u64, delay_ms: u64) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/api/v1/auth/device",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    assert!(headers.contains_key("x-rdfm-device-signature"));
                    assert!(body["metadata"]["rdfm.hardware.macaddr"].is_string());
                    assert!(body["timestamp"].is_u64());
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    (
                        StatusCode::from_u16(status).unwrap(),
                        Json(json!({"token": format!("token-{n}"), "expires": expires})),
                    )
                }
            }),
        );
        (spawn_server(app).await, hits)
    }

    #[tokio::test]
    async fn test_token_expiry_accounts_for_grace() {
        let (base, hits) = registration_server(200, 3600, 0).await;
        let provider = provider(&base, 5000);
        let before = now_millis();
        let token = provider.fetch_token().await.unwrap();
        let after = now_millis();
        assert_eq!(token, "token-1");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let expiry = provider.token_expiry().await.unwrap();
        assert!(expiry >= before + 3_600_000 - 5000);
        assert!(expiry <= after + 3_600_000 - 5000);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_registration() {
        let (base, hits) = registration_server(200, 3600, 150).await;
        let provider = Arc::new(provider(&base, 5000));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let p = provider.clone();
            handles.push(tokio::spawn(async move { p.fetch_token().await.unwrap() }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), "token-1");
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Still valid: served from cache.
        assert_eq!(provider.fetch_token().await.unwrap(), "token-1");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_token_refreshes_exactly_once() {
        let (base, hits) = registration_server(200, 1, 50).await;
        let provider = Arc::new(provider(&base, 0));

        assert_eq!(provider.fetch_token().await.unwrap(), "token-1");
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let mut handles = Vec::new();
        for _ in 0..5 {
            let p = provider.clone();
            handles.push(tokio::spawn(async move { p.fetch_token().await.unwrap() }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), "token-2");
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_short_lifetime_ignores_grace() {
        let (base, _) = registration_server(200, 2, 0).await;
        let provider = provider(&base, 5000);
        let before = now_millis();
        provider.fetch_token().await.unwrap();
        let expiry = provider.token_expiry().await.unwrap();
        assert!(expiry >= before + 2000);
    }

    #[tokio::test]
    async fn test_unauthorized_is_not_retried() {
        let (base, hits) = registration_server(401, 0, 0).await;
        let provider = provider(&base, 5000);
        assert!(matches!(
            provider.fetch_token().await,
            Err(AuthError::Unauthorized)
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(provider.token_expiry().await.is_none());
    }

    #[tokio::test]
    async fn test_server_error_is_connection_failure() {
        let (base, _) = registration_server(500, 0, 0).await;
        let provider = provider(&base, 5000);
        assert!(matches!(
            provider.fetch_token().await,
            Err(AuthError::ConnectionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connection_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let provider = provider(&format!("http://{addr}"), 5000);
        assert!(matches!(
            provider.fetch_token().await,
            Err(AuthError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn test_bearer_header_format() {
        assert_eq!(bearer_header("abc"), "Bearer token=abc");
    }
}
