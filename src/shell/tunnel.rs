//! Remote shell tunnel: one local process bridged to one WebSocket.
//!
//! ```text
//!                ┌──────────── listener ───────────┐
//!  server ══WS══▶│ binary frames ──▶ process stdin │
//!                ├──────────── output pump ────────┤
//!  server ◀══WS══│ binary frames ◀── stdout+stderr │
//!                ├──────────── waiter ─────────────┤
//!                │ child.wait()                    │
//!                └─────────────────────────────────┘
//! ```
//!
//! Each of the three flows owns a [`FlowExit`] guard. Dropping it runs the
//! session's one-shot close (SIGKILL the process group, cancel the other
//! flows) and releases one permit of a three-permit [`CompletionGate`].
//! [`ShellTunnel::run`] returns once the gate is drained, i.e. after every
//! flow has finished regardless of which one ended the session.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::process::{kill_process_group, spawn_session_process};
use crate::config::ShellConfig;
use crate::error::ShellError;
use crate::tunnel::client::{
    authorized_request, close_message, liveness_timeout, spawn_heartbeat, WsSink,
};
use crate::tunnel::WS_CLOSE_NORMAL;

/// Bytes read from the process per outbound frame.
const OUTPUT_CHUNK: usize = 4096;

/// How long the output pump keeps draining after the session was closed.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Number of flows participating in a session.
const SESSION_FLOWS: usize = 3;

/// Counting rendezvous: `wait()` resolves once `release()` was called
/// `permits` times.
pub struct CompletionGate {
    remaining: AtomicUsize,
    notify: Notify,
}

impl CompletionGate {
    pub fn new(permits: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(permits),
            notify: Notify::new(),
        }
    }

    /// Release one permit. Extra releases past zero are ignored.
    pub fn release(&self) {
        let prev = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if prev == Ok(1) {
            self.notify.notify_one();
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        while self.remaining() > 0 {
            self.notify.notified().await;
        }
    }
}

/// One-shot session teardown shared by all flows.
pub struct SessionCloser {
    closed: AtomicBool,
    cancel: CancellationToken,
    pgid: i32,
}

impl SessionCloser {
    pub fn new(pgid: i32, cancel: CancellationToken) -> Self {
        Self {
            closed: AtomicBool::new(false),
            cancel,
            pgid,
        }
    }

    /// Kill the process group and cancel the session's flows.
    ///
    /// Only the first call has any effect; it returns `true`, later calls
    /// return `false`.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        kill_process_group(self.pgid);
        self.cancel.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Held by each flow for its whole lifetime, including on panic.
struct FlowExit {
    name: &'static str,
    closer: Arc<SessionCloser>,
    gate: Arc<CompletionGate>,
}

impl Drop for FlowExit {
    fn drop(&mut self) {
        if self.closer.close() {
            debug!("Shell: session closed by {}", self.name);
        }
        self.gate.release();
    }
}

/// A single remote shell session.
pub struct ShellTunnel {
    session_id: String,
    token: String,
    attach_url: String,
    config: ShellConfig,
    ping_interval: Duration,
    shutdown: CancellationToken,
}

impl ShellTunnel {
    /// `ws_base` is the server address with a `ws://` or `wss://` scheme.
    pub fn new(
        ws_base: &str,
        mac_addr: &str,
        session_id: &str,
        token: String,
        config: ShellConfig,
        ping_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            token,
            attach_url: format!(
                "{}/api/v1/devices/{mac_addr}/shell/attach/{session_id}",
                ws_base.trim_end_matches('/')
            ),
            config,
            ping_interval,
            shutdown,
        }
    }

    pub fn attach_url(&self) -> &str {
        &self.attach_url
    }

    /// Run the session to completion.
    ///
    /// Errors are only returned when the session could not be started; once
    /// both the process and the connection exist, every ending is normal.
    pub async fn run(self) -> Result<(), ShellError> {
        let request = authorized_request(&self.attach_url, &self.token)
            .map_err(|e| ShellError::ConnectionFailed(e.to_string()))?;
        let proc = spawn_session_process(&self.config)?;
        let pgid = proc.pgid;
        info!("Shell {}: started {} (pgid {pgid})", self.session_id, self.config.program);

        let ws = match tokio_tungstenite::connect_async(request).await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                kill_process_group(pgid);
                let mut child = proc.child;
                let _ = child.wait().await;
                return Err(e.into());
            }
        };
        info!("Shell {}: tunnel connected", self.session_id);

        let (ws_sink, mut ws_stream) = ws.split();
        let ws_sink: WsSink = Arc::new(Mutex::new(ws_sink));
        let cancel = self.shutdown.child_token();
        let closer = Arc::new(SessionCloser::new(pgid, cancel.clone()));
        let gate = Arc::new(CompletionGate::new(SESSION_FLOWS));
        let exit = |name: &'static str| FlowExit {
            name,
            closer: closer.clone(),
            gate: gate.clone(),
        };
        let heartbeat = spawn_heartbeat(ws_sink.clone(), self.ping_interval);

        let mut stdin = proc.stdin;
        let mut output = proc.output;
        let mut child = proc.child;

        // (1) remote → process stdin
        let listener_exit = exit("listener");
        let listener_cancel = cancel.clone();
        let idle_limit = liveness_timeout(self.ping_interval);
        tokio::spawn(async move {
            let _exit = listener_exit;
            loop {
                let msg = tokio::select! {
                    () = listener_cancel.cancelled() => break,
                    next = tokio::time::timeout(idle_limit, ws_stream.next()) => {
                        if let Ok(msg) = next {
                            msg
                        } else {
                            warn!("Shell: no frames from server for {}s", idle_limit.as_secs());
                            break;
                        }
                    }
                };
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let written = tokio::select! {
                            () = listener_cancel.cancelled() => break,
                            r = stdin.write_all(&data) => r,
                        };
                        if written.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("Shell: tunnel read error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        });

        // (2) process output → remote
        let pump_exit = exit("output pump");
        let pump_cancel = cancel.clone();
        let pump_sink = ws_sink.clone();
        tokio::spawn(async move {
            let _exit = pump_exit;
            let mut buf = vec![0u8; OUTPUT_CHUNK];
            loop {
                let n = {
                    let read = output.read(&mut buf);
                    tokio::pin!(read);
                    tokio::select! {
                        r = &mut read => r,
                        () = pump_cancel.cancelled() => {
                            tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut read)
                                .await
                                .unwrap_or(Ok(0))
                        }
                    }
                };
                let n = match n {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let frame = Message::Binary(buf[..n].to_vec().into());
                if pump_sink.lock().await.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = pump_sink
                .lock()
                .await
                .send(close_message(WS_CLOSE_NORMAL, "shell connection closed"))
                .await;
        });

        // (3) process exit
        let waiter_exit = exit("waiter");
        let waiter_cancel = cancel.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            let _exit = waiter_exit;
            let status = tokio::select! {
                s = child.wait() => s,
                () = waiter_cancel.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            match status {
                Ok(s) => info!("Shell {session_id}: process exited ({s})"),
                Err(e) => warn!("Shell {session_id}: failed to wait for process: {e}"),
            }
        });

        gate.wait().await;
        heartbeat.abort();
        info!("Shell {}: session ended", self.session_id);
        Ok(())
    }
}
