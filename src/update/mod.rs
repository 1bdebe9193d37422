//! Over-the-air updates.
//!
//! - [`check`] — asks the server for an update and downloads the package
//! - [`payload`] — locates `payload.bin` inside the package archive
//! - [`engine`] — boundary to the platform apply engine and reboot
//! - [`coordinator`] — serializes check/apply cycles and reacts to engine events

pub mod check;
pub mod coordinator;
pub mod engine;
pub mod payload;

/// Where the apply engine finds the payload: a byte range inside a local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePayloadSpec {
    /// `file://` URI of the package archive.
    pub source_uri: String,
    /// Offset of the payload's first byte inside the archive.
    pub offset: u64,
    /// Stored size of the payload.
    pub size: u64,
    /// `KEY=VALUE` lines passed to the engine as headers.
    pub properties: Vec<String>,
}
