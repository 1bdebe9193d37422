//! Remote shell sessions.
//!
//! A `shell_attach` message from the management channel becomes a
//! [`tunnel::ShellTunnel`] when:
//!
//! 1. the session id is a UUID and the MAC is a well-formed hardware address
//!    (both end up in the tunnel URL),
//! 2. a device token can be obtained (an unauthorized device drops the request),
//! 3. the [`ShellRegistry`] has room under `max_sessions` and the id is not
//!    already live.
//!
//! The tunnel then runs on its own task so the management message loop is
//! never blocked by shell I/O.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::TokenProvider;
use crate::config::ShellConfig;
use crate::device::normalize_mac;
use crate::error::ShellError;
use crate::tunnel::client::MessageHandler;

pub mod process;
pub mod tunnel;

/// Tracks live shell sessions and enforces the concurrency cap.
pub struct ShellRegistry {
    max_sessions: usize,
    live: AtomicUsize,
    ids: Mutex<HashSet<String>>,
}

impl ShellRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions,
            live: AtomicUsize::new(0),
            ids: Mutex::new(HashSet::new()),
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Reserve a slot for `session_id`.
    ///
    /// Returns `None` when the cap is reached or the id is already live. The
    /// slot is released when the returned guard is dropped.
    pub fn try_acquire(self: &Arc<Self>, session_id: &str) -> Option<SessionSlot> {
        let mut ids = self.ids.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if self.live_count() >= self.max_sessions || ids.contains(session_id) {
            return None;
        }
        ids.insert(session_id.to_string());
        self.live.fetch_add(1, Ordering::AcqRel);
        Some(SessionSlot {
            registry: self.clone(),
            session_id: session_id.to_string(),
        })
    }
}

/// A reserved session slot; decrements the live count exactly once on drop.
pub struct SessionSlot {
    registry: Arc<ShellRegistry>,
    session_id: String,
}

impl SessionSlot {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        let mut ids = self
            .registry
            .ids
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        ids.remove(&self.session_id);
        self.registry.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Check a `shell_attach` request before anything is interpolated into a URL.
pub fn validate_attach(mac_addr: &str, session_id: &str) -> Result<(), ShellError> {
    uuid::Uuid::parse_str(session_id).map_err(|_| {
        ShellError::InvalidRequest(format!("session id is not a UUID: {session_id}"))
    })?;
    normalize_mac(mac_addr).map_err(|e| ShellError::InvalidRequest(e.to_string()))?;
    Ok(())
}

/// Handles management messages: logs alerts and opens shell tunnels.
pub struct ShellAttachHandler {
    ws_base: String,
    config: ShellConfig,
    ping_interval: Duration,
    tokens: Arc<dyn TokenProvider>,
    registry: Arc<ShellRegistry>,
    shutdown: CancellationToken,
}

impl ShellAttachHandler {
    pub fn new(
        ws_base: &str,
        config: ShellConfig,
        ping_interval: Duration,
        tokens: Arc<dyn TokenProvider>,
        shutdown: CancellationToken,
    ) -> Self {
        let registry = Arc::new(ShellRegistry::new(config.max_sessions));
        Self {
            ws_base: ws_base.to_string(),
            config,
            ping_interval,
            tokens,
            registry,
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<ShellRegistry> {
        &self.registry
    }
}

#[async_trait]
impl MessageHandler for ShellAttachHandler {
    async fn on_alert(&self, message: &str) {
        warn!("Server alert: {message}");
    }

    async fn on_shell_attach(&self, mac_addr: &str, uuid: &str) {
        if let Err(e) = validate_attach(mac_addr, uuid) {
            warn!("Dropping shell attach request: {e}");
            return;
        }
        let token = match self.tokens.fetch_token().await {
            Ok(t) => t,
            Err(e) => {
                warn!("Dropping shell attach request {uuid}: no device token ({e})");
                return;
            }
        };
        let Some(slot) = self.registry.try_acquire(uuid) else {
            info!(
                "Rejecting shell attach request {uuid}: {} of {} sessions live or id in use",
                self.registry.live_count(),
                self.registry.max_sessions()
            );
            return;
        };

        let tunnel = tunnel::ShellTunnel::new(
            &self.ws_base,
            mac_addr,
            uuid,
            token,
            self.config.clone(),
            self.ping_interval,
            self.shutdown.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = tunnel.run().await {
                warn!("Shell {}: session failed: {e}", slot.session_id());
            }
            drop(slot);
        });
    }
}
