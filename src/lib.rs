#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::too_many_arguments)]

//! fleetd library — the building blocks of the device agent.
//!
//! - `auth` — device registration and bearer-token caching
//! - `device` — device identity and the signing key store
//! - `tunnel` — management WebSocket channel and its message codec
//! - `shell` — remote shell sessions bridged over a second WebSocket
//! - `update` — update check, payload location, apply engine, coordinator
//! - `backoff` — reconnect delay counter
//! - `config` — configuration loading

pub mod auth;
pub mod backoff;
pub mod config;
pub mod device;
pub mod error;
pub mod shell;
pub mod tunnel;
pub mod update;
pub mod util;

#[cfg(test)]
mod testutil;

// Re-export key types at crate root for convenience.
pub use auth::{DeviceTokenProvider, TokenProvider};
pub use config::Config;
pub use device::DeviceInfo;
pub use shell::ShellAttachHandler;
pub use tunnel::client::ManagementChannel;
pub use update::coordinator::UpdateCoordinator;
