//! Update orchestration.
//!
//! ```text
//! timer ──▶ check_and_apply ──(engine Idle, lock free)──▶ UpdateSource::fetch_update
//!                                                              │ package path
//!                                                              ▼
//!                                     extract_payload_spec ──▶ ApplyEngine::apply_payload
//!
//! engine ──Status──▶ on_status    mirror state; first report NeedReboot ⇒ reboot
//!        ──Complete─▶ on_complete  delete package; success ⇒ reboot
//! ```
//!
//! The first-report rule recovers from a crash between a successful apply and
//! the reboot that should have followed it. Until that first report arrives the
//! engine state is unknown and no check runs.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::check::UpdateSource;
use super::engine::{error_code_name, ApplyEngine, EngineEvent, EngineState, Rebooter, ENGINE_SUCCESS};
use super::payload::extract_payload_spec;
use crate::error::UpdateError;

/// Mirrored state before the engine's first status report.
const STATE_UNKNOWN: u8 = u8::MAX;

/// What a call to [`UpdateCoordinator::check_and_apply`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Another check is running or the engine is busy.
    Skipped,
    NoUpdate,
    /// A package was handed to the engine.
    Applying,
}

pub struct UpdateCoordinator {
    engine: Arc<dyn ApplyEngine>,
    source: Arc<dyn UpdateSource>,
    rebooter: Arc<dyn Rebooter>,
    state: AtomicU8,
    first_status_seen: AtomicBool,
    check_lock: tokio::sync::Mutex<()>,
    pending_package: std::sync::Mutex<Option<PathBuf>>,
}

impl UpdateCoordinator {
    pub fn new(
        engine: Arc<dyn ApplyEngine>,
        source: Arc<dyn UpdateSource>,
        rebooter: Arc<dyn Rebooter>,
    ) -> Self {
        Self {
            engine,
            source,
            rebooter,
            state: AtomicU8::new(STATE_UNKNOWN),
            first_status_seen: AtomicBool::new(false),
            check_lock: tokio::sync::Mutex::new(()),
            pending_package: std::sync::Mutex::new(None),
        }
    }

    /// Latest state reported by the engine; `None` before the first report.
    pub fn engine_state(&self) -> Option<EngineState> {
        EngineState::from_code(i32::from(self.state.load(Ordering::Acquire)))
    }

    /// True only once the engine has reported that it is idle.
    pub fn can_safely_check_for_updates(&self) -> bool {
        self.engine_state() == Some(EngineState::Idle)
    }

    /// Run one check/apply cycle unless one is already in flight.
    pub async fn check_and_apply(&self) -> Result<CheckOutcome, UpdateError> {
        let Ok(_guard) = self.check_lock.try_lock() else {
            debug!("Update check already in progress");
            return Ok(CheckOutcome::Skipped);
        };
        if !self.can_safely_check_for_updates() {
            match self.engine_state() {
                Some(state) => info!("Skipping update check, engine is {state}"),
                None => info!("Skipping update check, engine has not reported its state yet"),
            }
            return Ok(CheckOutcome::Skipped);
        }
        match self.source.fetch_update().await? {
            None => Ok(CheckOutcome::NoUpdate),
            Some(package) => {
                self.apply_update(&package).await?;
                Ok(CheckOutcome::Applying)
            }
        }
    }

    /// Locate the payload in `package` and hand it to the engine.
    pub async fn apply_update(&self, package: &Path) -> Result<(), UpdateError> {
        let path = package.to_path_buf();
        let spec = tokio::task::spawn_blocking(move || extract_payload_spec(&path))
            .await
            .map_err(|e| UpdateError::Engine(format!("payload extraction task failed: {e}")))?;
        let spec = match spec {
            Ok(spec) => spec,
            Err(e) => {
                warn!("Discarding unusable update package {}: {e}", package.display());
                remove_package(package).await;
                return Err(e);
            }
        };

        self.set_pending(Some(package.to_path_buf()));
        if let Err(e) = self.engine.apply_payload(spec).await {
            error!("Apply engine rejected the update: {e}");
            self.set_pending(None);
            remove_package(package).await;
            return Err(e);
        }
        Ok(())
    }

    /// Engine status callback.
    pub async fn on_status(&self, state: EngineState, progress: f32) {
        self.state.store(state.code(), Ordering::Release);
        let first = !self.first_status_seen.swap(true, Ordering::AcqRel);
        info!("Update status: {state}, progress: {progress:.2}");
        if first && state == EngineState::NeedReboot {
            warn!("Engine already waiting for reboot at startup, rebooting");
            self.reboot().await;
        }
    }

    /// Engine completion callback.
    pub async fn on_complete(&self, code: i32) {
        info!("Complete applying payload, result: {}", error_code_name(code));
        if let Some(package) = self.set_pending(None) {
            remove_package(&package).await;
        }
        if code == ENGINE_SUCCESS {
            self.reboot().await;
        }
    }

    async fn reboot(&self) {
        if let Err(e) = self.rebooter.reboot().await {
            error!("Reboot failed: {e}");
        }
    }

    fn set_pending(&self, package: Option<PathBuf>) -> Option<PathBuf> {
        let mut pending = self
            .pending_package
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        std::mem::replace(&mut *pending, package)
    }

    /// Subscribe to engine events and dispatch them in order.
    pub async fn bind(self: &Arc<Self>) -> Result<JoinHandle<()>, UpdateError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.engine.bind(tx).await?;
        let this = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    EngineEvent::Status { state, progress } => this.on_status(state, progress).await,
                    EngineEvent::Complete { code } => this.on_complete(code).await,
                }
            }
            debug!("Apply engine event stream ended");
        }))
    }

    pub async fn unbind(&self) {
        self.engine.unbind().await;
    }
}

async fn remove_package(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!("Removed update package {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Update package {} already gone", path.display());
        }
        Err(e) => warn!("Failed to remove update package {}: {e}", path.display()),
    }
}
