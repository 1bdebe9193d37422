//! Boundary to the platform apply engine.
//!
//! The engine is an external system service: it accepts a payload descriptor,
//! applies it to the inactive slot in the background, and reports progress
//! through asynchronous status and completion events. [`ApplyEngine`] models
//! that contract; [`UpdateEngineClient`] implements it on top of the
//! `update_engine_client` command-line tool.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::UpdatePayloadSpec;
use crate::error::UpdateError;

/// Completion code reported for a successful apply.
pub const ENGINE_SUCCESS: i32 = 0;

/// Engine status, as reported by the engine's status callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Idle = 0,
    CheckingForUpdate = 1,
    UpdateAvailable = 2,
    Downloading = 3,
    Verifying = 4,
    Finalizing = 5,
    NeedReboot = 6,
    ReportingError = 7,
    AttemptingRollback = 8,
    Disabled = 9,
    NeedPermission = 10,
}

impl EngineState {
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Idle,
            1 => Self::CheckingForUpdate,
            2 => Self::UpdateAvailable,
            3 => Self::Downloading,
            4 => Self::Verifying,
            5 => Self::Finalizing,
            6 => Self::NeedReboot,
            7 => Self::ReportingError,
            8 => Self::AttemptingRollback,
            9 => Self::Disabled,
            10 => Self::NeedPermission,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::CheckingForUpdate => "CHECKING_FOR_UPDATE",
            Self::UpdateAvailable => "UPDATE_AVAILABLE",
            Self::Downloading => "DOWNLOADING",
            Self::Verifying => "VERIFYING",
            Self::Finalizing => "FINALIZING",
            Self::NeedReboot => "UPDATED_NEED_REBOOT",
            Self::ReportingError => "REPORTING_ERROR_EVENT",
            Self::AttemptingRollback => "ATTEMPTING_ROLLBACK",
            Self::Disabled => "DISABLED",
            Self::NeedPermission => "NEED_PERMISSION_TO_UPDATE",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of an engine completion code, for logs.
pub fn error_code_name(code: i32) -> &'static str {
    match code {
        0 => "SUCCESS",
        1 => "ERROR",
        4 => "FILESYSTEM_COPIER_ERROR",
        5 => "POST_INSTALL_RUNNER_ERROR",
        6 => "PAYLOAD_MISMATCHED_TYPE_ERROR",
        7 => "INSTALL_DEVICE_OPEN_ERROR",
        8 => "KERNEL_DEVICE_OPEN_ERROR",
        9 => "DOWNLOAD_TRANSFER_ERROR",
        10 => "PAYLOAD_HASH_MISMATCH_ERROR",
        11 => "PAYLOAD_SIZE_MISMATCH_ERROR",
        12 => "DOWNLOAD_PAYLOAD_VERIFICATION_ERROR",
        15 => "NEW_ROOTFS_VERIFICATION_ERROR",
        20 => "DOWNLOAD_STATE_INITIALIZATION_ERROR",
        26 => "DOWNLOAD_METADATA_SIGNATURE_MISMATCH",
        51 => "PAYLOAD_TIMESTAMP_ERROR",
        52 => "UPDATED_BUT_NOT_ACTIVE",
        _ => "UNKNOWN",
    }
}

/// Asynchronous engine callback.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Status { state: EngineState, progress: f32 },
    Complete { code: i32 },
}

/// The platform service that applies payloads.
#[async_trait]
pub trait ApplyEngine: Send + Sync {
    /// Subscribe to engine events. The engine reports its current status
    /// shortly after binding.
    async fn bind(&self, events: mpsc::UnboundedSender<EngineEvent>) -> Result<(), UpdateError>;

    async fn unbind(&self);

    /// Start applying `spec`. Returns once the engine accepted the request;
    /// the outcome arrives later as [`EngineEvent::Complete`].
    async fn apply_payload(&self, spec: UpdatePayloadSpec) -> Result<(), UpdateError>;
}

/// Parse one line of `update_engine_client --follow` output.
///
/// ```text
/// onStatusUpdate(UPDATE_STATUS_DOWNLOADING (3), 0.25)
/// onPayloadApplicationComplete(ErrorCode::kSuccess (0))
/// ```
///
/// Log prefixes before the callback name are ignored.
pub fn parse_engine_line(line: &str) -> Option<EngineEvent> {
    if let Some(idx) = line.find("onStatusUpdate(") {
        let (code, rest) = parenthesized_code(&line[idx..])?;
        let progress = rest
            .trim_start_matches(',')
            .trim()
            .trim_end_matches(')')
            .trim()
            .parse()
            .unwrap_or(0.0);
        return Some(EngineEvent::Status {
            state: EngineState::from_code(code)?,
            progress,
        });
    }
    if let Some(idx) = line.find("onPayloadApplicationComplete(") {
        let (code, _) = parenthesized_code(&line[idx..])?;
        return Some(EngineEvent::Complete { code });
    }
    None
}

/// Find `" (<n>)"` and return `n` with the text after the closing paren.
fn parenthesized_code(s: &str) -> Option<(i32, &str)> {
    let open = s.find(" (")?;
    let after = &s[open + 2..];
    let close = after.find(')')?;
    let code = after[..close].trim().parse().ok()?;
    Some((code, &after[close + 1..]))
}

/// [`ApplyEngine`] driving the `update_engine_client` binary.
pub struct UpdateEngineClient {
    binary: String,
    follower: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateEngineClient {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
            follower: Mutex::new(None),
        }
    }

    /// Arguments for an apply request.
    pub fn apply_args(spec: &UpdatePayloadSpec) -> Vec<String> {
        vec![
            "--update".to_string(),
            format!("--payload={}", spec.source_uri),
            format!("--offset={}", spec.offset),
            format!("--size={}", spec.size),
            format!("--headers={}", spec.properties.join("\n")),
        ]
    }
}

/// Forward parsed engine events from one output stream.
async fn forward_events(
    stream: impl AsyncRead + Unpin,
    events: mpsc::UnboundedSender<EngineEvent>,
) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match parse_engine_line(&line) {
            Some(event) => {
                if events.send(event).is_err() {
                    break;
                }
            }
            None => debug!("update_engine_client: {line}"),
        }
    }
}

#[async_trait]
impl ApplyEngine for UpdateEngineClient {
    async fn bind(&self, events: mpsc::UnboundedSender<EngineEvent>) -> Result<(), UpdateError> {
        let mut follower = self.follower.lock().await;
        if let Some(old) = follower.take() {
            old.abort();
        }

        let mut child = Command::new(&self.binary)
            .arg("--follow")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| UpdateError::Engine(format!("failed to start {}: {e}", self.binary)))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let binary = self.binary.clone();

        *follower = Some(tokio::spawn(async move {
            let out = stdout.map(|s| tokio::spawn(forward_events(s, events.clone())));
            let err = stderr.map(|s| tokio::spawn(forward_events(s, events)));
            match child.wait().await {
                Ok(status) => warn!("{binary} --follow exited ({status})"),
                Err(e) => warn!("{binary} --follow failed: {e}"),
            }
            for task in [out, err].into_iter().flatten() {
                let _ = task.await;
            }
        }));
        info!("Bound to apply engine via {}", self.binary);
        Ok(())
    }

    async fn unbind(&self) {
        if let Some(task) = self.follower.lock().await.take() {
            task.abort();
            debug!("Unbound from apply engine");
        }
    }

    async fn apply_payload(&self, spec: UpdatePayloadSpec) -> Result<(), UpdateError> {
        info!(
            "Applying payload {} (offset {}, size {})",
            spec.source_uri, spec.offset, spec.size
        );
        let output = Command::new(&self.binary)
            .args(Self::apply_args(&spec))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| UpdateError::Engine(format!("failed to start {}: {e}", self.binary)))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(UpdateError::Engine(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// Restarts the device after an update.
#[async_trait]
pub trait Rebooter: Send + Sync {
    async fn reboot(&self) -> Result<(), UpdateError>;
}

/// Reboots by running a configured command, e.g. `["/sbin/reboot"]`.
pub struct CommandRebooter {
    command: Vec<String>,
}

impl CommandRebooter {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Rebooter for CommandRebooter {
    async fn reboot(&self) -> Result<(), UpdateError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(UpdateError::Engine("reboot command is empty".to_string()));
        };
        warn!("Rebooting device: {}", self.command.join(" "));
        let status = Command::new(program).args(args).status().await?;
        if status.success() {
            Ok(())
        } else {
            Err(UpdateError::Engine(format!("reboot command exited with {status}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_line() {
        assert_eq!(
            parse_engine_line("onStatusUpdate(UPDATE_STATUS_DOWNLOADING (3), 0.25)"),
            Some(EngineEvent::Status {
                state: EngineState::Downloading,
                progress: 0.25
            })
        );
        assert_eq!(
            parse_engine_line(
                "I update_engine_client: onStatusUpdate(UPDATE_STATUS_UPDATED_NEED_REBOOT (6), 1)"
            ),
            Some(EngineEvent::Status {
                state: EngineState::NeedReboot,
                progress: 1.0
            })
        );
    }

    #[test]
    fn test_parse_completion_line() {
        assert_eq!(
            parse_engine_line("onPayloadApplicationComplete(ErrorCode::kSuccess (0))"),
            Some(EngineEvent::Complete { code: 0 })
        );
        assert_eq!(
            parse_engine_line("onPayloadApplicationComplete(ErrorCode::kPayloadHashMismatchError (10))"),
            Some(EngineEvent::Complete { code: 10 })
        );
    }

    #[test]
    fn test_parse_ignores_other_lines() {
        assert_eq!(parse_engine_line("Waiting for update_engine"), None);
        assert_eq!(parse_engine_line("onStatusUpdate(UNKNOWN (99), 0)"), None);
        assert_eq!(parse_engine_line("onStatusUpdate(garbage"), None);
    }

    #[test]
    fn test_state_codes_round_trip_names() {
        assert_eq!(EngineState::from_code(0), Some(EngineState::Idle));
        assert_eq!(EngineState::from_code(10), Some(EngineState::NeedPermission));
        assert_eq!(EngineState::from_code(11), None);
        assert_eq!(EngineState::NeedReboot.code(), 6);
        assert_eq!(EngineState::NeedReboot.to_string(), "UPDATED_NEED_REBOOT");
        assert_eq!(error_code_name(52), "UPDATED_BUT_NOT_ACTIVE");
        assert_eq!(error_code_name(3), "UNKNOWN");
    }

    #[test]
    fn test_apply_args() {
        let spec = UpdatePayloadSpec {
            source_uri: "file:///data/ota_package/ota.zip".to_string(),
            offset: 41,
            size: 1000,
            properties: vec!["FILE_HASH=abc".to_string(), "FILE_SIZE=1000".to_string()],
        };
        assert_eq!(
            UpdateEngineClient::apply_args(&spec),
            vec![
                "--update",
                "--payload=file:///data/ota_package/ota.zip",
                "--offset=41",
                "--size=1000",
                "--headers=FILE_HASH=abc\nFILE_SIZE=1000",
            ]
        );
    }

    #[tokio::test]
    async fn test_follower_forwards_events_from_engine_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake_engine.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             echo 'onStatusUpdate(UPDATE_STATUS_IDLE (0), 0)'\n\
             echo 'noise' 1>&2\n\
             echo 'onPayloadApplicationComplete(ErrorCode::kSuccess (0))' 1>&2\n",
        )
        .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let engine = UpdateEngineClient::new(script.to_str().unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.bind(tx).await.unwrap();

        let mut events = Vec::new();
        while events.len() < 2 {
            let ev = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            events.push(ev);
        }
        assert!(events.contains(&EngineEvent::Status {
            state: EngineState::Idle,
            progress: 0.0
        }));
        assert!(events.contains(&EngineEvent::Complete { code: 0 }));
        engine.unbind().await;
    }

    #[tokio::test]
    async fn test_command_rebooter() {
        assert!(CommandRebooter::new(vec!["true".into()]).reboot().await.is_ok());
        assert!(CommandRebooter::new(vec!["false".into()]).reboot().await.is_err());
        assert!(CommandRebooter::new(Vec::new()).reboot().await.is_err());
    }
}
