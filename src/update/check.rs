//! Update check and package download.
//!
//! ```text
//! POST /api/v1/update/check           Authorization: Bearer token=<token>
//! {"rdfm.software.version": ..., "rdfm.hardware.macaddr": ..., ...}
//!
//! 200 {"uri": "...", "sha256": "..."}   update available
//! 204                                    no update
//! 400                                    metadata missing
//! 401                                    token rejected
//! ```
//!
//! The package is streamed to `<package_dir>/<last path segment of uri>` and
//! its SHA-256 compared against the advertised digest. A mismatching file is
//! deleted before the error is returned.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::auth::{bearer_header, TokenProvider};
use crate::device::DeviceInfo;
use crate::error::{AuthError, UpdateError};

const HASH_BUF_SIZE: usize = 64 * 1024;

/// Result of asking the server for an update.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UpdateOffer {
    pub uri: String,
    pub sha256: String,
}

/// Something that can produce a verified, locally stored update package.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// `Ok(None)` when no update is available.
    async fn fetch_update(&self) -> Result<Option<PathBuf>, UpdateError>;
}

/// Talks to the server's update endpoint.
pub struct UpdateChecker {
    http: reqwest::Client,
    check_url: String,
    device: Arc<DeviceInfo>,
    tokens: Arc<dyn TokenProvider>,
    package_dir: PathBuf,
    request_timeout: Duration,
}

impl UpdateChecker {
    pub fn new(
        server_base_url: &str,
        device: Arc<DeviceInfo>,
        tokens: Arc<dyn TokenProvider>,
        package_dir: impl Into<PathBuf>,
        request_timeout: Duration,
    ) -> Result<Self, UpdateError> {
        // No overall timeout on the client: package downloads can be large.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            check_url: format!("{}/api/v1/update/check", server_base_url.trim_end_matches('/')),
            device,
            tokens,
            package_dir: package_dir.into(),
            request_timeout,
        })
    }

    /// Ask the server whether an update is available for this device.
    pub async fn check(&self) -> Result<Option<UpdateOffer>, UpdateError> {
        let token = self.tokens.fetch_token().await?;
        let resp = self
            .http
            .post(&self.check_url)
            .header(reqwest::header::AUTHORIZATION, bearer_header(&token))
            .timeout(self.request_timeout)
            .json(&self.device.metadata())
            .send()
            .await?;

        match resp.status().as_u16() {
            200 => {
                let offer: UpdateOffer = resp.json().await.map_err(|e| {
                    UpdateError::ConnectionFailed(format!("invalid update check response: {e}"))
                })?;
                info!("Update available: {}", offer.uri);
                Ok(Some(offer))
            }
            204 => {
                debug!("No updates available");
                Ok(None)
            }
            400 => Err(UpdateError::MissingMetadata),
            401 => Err(UpdateError::Auth(AuthError::Unauthorized)),
            status => Err(UpdateError::ConnectionFailed(format!(
                "update check returned HTTP {status}"
            ))),
        }
    }

    /// Download `offer` into the package directory and verify its digest.
    pub async fn download(&self, offer: &UpdateOffer) -> Result<PathBuf, UpdateError> {
        let name = package_file_name(&offer.uri).ok_or_else(|| {
            UpdateError::ConnectionFailed(format!("cannot derive package name from {}", offer.uri))
        })?;
        tokio::fs::create_dir_all(&self.package_dir).await?;
        let path = self.package_dir.join(name);

        if let Err(e) = self.download_to(&offer.uri, &path).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }

        let actual = hash_file(&path).await?;
        if !actual.eq_ignore_ascii_case(offer.sha256.trim()) {
            warn!("Invalid package checksum, discarding {}", path.display());
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("Failed to remove {}: {e}", path.display());
            }
            return Err(UpdateError::ChecksumMismatch {
                expected: offer.sha256.clone(),
                actual,
            });
        }
        info!("Downloaded update package to {}", path.display());
        Ok(path)
    }

    async fn download_to(&self, uri: &str, path: &Path) -> Result<(), UpdateError> {
        let mut resp = self.http.get(uri).send().await?;
        if !resp.status().is_success() {
            return Err(UpdateError::ConnectionFailed(format!(
                "package download returned HTTP {}",
                resp.status()
            )));
        }
        let mut file = tokio::fs::File::create(path).await?;
        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl UpdateSource for UpdateChecker {
    async fn fetch_update(&self) -> Result<Option<PathBuf>, UpdateError> {
        match self.check().await? {
            Some(offer) => self.download(&offer).await.map(Some),
            None => Ok(None),
        }
    }
}

/// Last non-empty path segment of `uri`.
pub fn package_file_name(uri: &str) -> Option<String> {
    let url = reqwest::Url::parse(uri).ok()?;
    let name = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    if name == "." || name == ".." {
        return None;
    }
    Some(name.to_string())
}

/// SHA-256 of a file, streamed in 64 KiB blocks. Lowercase hex.
pub async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::*;
    use crate::testutil::{spawn_server, test_device};

    const PACKAGE: &[u8] = b"pretend this is an OTA zip";

    struct StaticToken;

    #[async_trait]
    impl TokenProvider for StaticToken {
        async fn fetch_token(&self) -> Result<String, AuthError> {
            Ok("tok".to_string())
        }
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// Update server answering the check with `status`. A 200 answer offers
    /// `/packages/ota-1.zip` with the given digest.
    async fn update_server(status: u16, sha256: String) -> String {
        let base_holder = Arc::new(std::sync::OnceLock::<String>::new());
        let holder = base_holder.clone();
        let app = Router::new()
            .route(
                "/api/v1/update/check",
                post(move |headers: HeaderMap, Json(body): Json<Value>| {
                    let holder = holder.clone();
                    let sha256 = sha256.clone();
                    async move {
                        assert_eq!(
                            headers.get("authorization").unwrap().to_str().unwrap(),
                            "Bearer token=tok"
                        );
                        assert_eq!(body["rdfm.hardware.macaddr"], "02:00:00:AA:BB:CC");
                        let base = holder.get().cloned().unwrap_or_default();
                        (
                            StatusCode::from_u16(status).unwrap(),
                            Json(json!({"uri": format!("{base}/packages/ota-1.zip"), "sha256": sha256})),
                        )
                            .into_response()
                    }
                }),
            )
            .route("/packages/ota-1.zip", get(|| async { PACKAGE.to_vec() }));
        let base = spawn_server(app).await;
        base_holder.set(base.clone()).unwrap();
        base
    }

    fn checker(base: &str, dir: &Path) -> UpdateChecker {
        UpdateChecker::new(
            base,
            Arc::new(test_device()),
            Arc::new(StaticToken),
            dir,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_update_downloaded_and_verified() {
        let dir = tempfile::tempdir().unwrap();
        let base = update_server(200, sha256_hex(PACKAGE)).await;
        let path = checker(&base, dir.path()).fetch_update().await.unwrap().unwrap();
        assert_eq!(path, dir.path().join("ota-1.zip"));
        assert_eq!(std::fs::read(&path).unwrap(), PACKAGE);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_discards_package() {
        let dir = tempfile::tempdir().unwrap();
        let base = update_server(200, sha256_hex(b"something else")).await;
        let result = checker(&base, dir.path()).fetch_update().await;
        assert!(matches!(result, Err(UpdateError::ChecksumMismatch { .. })));
        assert!(!dir.path().join("ota-1.zip").exists());
    }

    #[tokio::test]
    async fn test_status_codes() {
        let dir = tempfile::tempdir().unwrap();

        let base = update_server(204, String::new()).await;
        assert_eq!(checker(&base, dir.path()).fetch_update().await.unwrap(), None);

        let base = update_server(400, String::new()).await;
        assert!(matches!(
            checker(&base, dir.path()).check().await,
            Err(UpdateError::MissingMetadata)
        ));

        let base = update_server(401, String::new()).await;
        assert!(matches!(
            checker(&base, dir.path()).check().await,
            Err(UpdateError::Auth(AuthError::Unauthorized))
        ));

        let base = update_server(500, String::new()).await;
        assert!(matches!(
            checker(&base, dir.path()).check().await,
            Err(UpdateError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn test_package_file_name() {
        assert_eq!(
            package_file_name("http://10.0.0.1:5000/local_storage/12a83ff3-2de2").as_deref(),
            Some("12a83ff3-2de2")
        );
        assert_eq!(
            package_file_name("https://s3.example.com/bucket/ota.zip?sig=abc").as_deref(),
            Some("ota.zip")
        );
        assert_eq!(package_file_name("https://example.com/"), None);
        assert_eq!(package_file_name("not a url"), None);
    }

    #[tokio::test]
    async fn test_hash_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            hash_file(&path).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
