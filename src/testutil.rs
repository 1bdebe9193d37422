//! Shared fixtures for unit tests.

use axum::Router;

use crate::device::keys::DeviceKey;
use crate::device::DeviceInfo;
use crate::error::KeyError;

/// Serve `app` on an ephemeral loopback port, returning its `http://` base URL.
pub async fn spawn_server(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

pub fn test_device() -> DeviceInfo {
    DeviceInfo {
        mac_address: "02:00:00:AA:BB:CC".to_string(),
        device_type: "test-board".to_string(),
        software_version: "1.0.0".to_string(),
    }
}

/// Key stand-in that skips RSA work.
pub struct StaticKey;

impl DeviceKey for StaticKey {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, KeyError> {
        Ok(data.iter().rev().take(16).copied().collect())
    }

    fn public_key_pem(&self) -> Result<String, KeyError> {
        Ok("-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----\n".to_string())
    }
}

/// One entry for [`build_zip`]. `data` is written as-is (already compressed
/// when `method` is 8).
pub struct ZipEntry<'a> {
    pub name: &'a str,
    pub data: Vec<u8>,
    pub method: u16,
    pub uncompressed_len: u32,
    pub extra: Vec<u8>,
    /// Write sizes in a trailing data descriptor instead of the local header.
    pub descriptor: bool,
}

impl<'a> ZipEntry<'a> {
    pub fn stored(name: &'a str, data: &[u8]) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let len = data.len() as u32;
        Self {
            name,
            data: data.to_vec(),
            method: 0,
            uncompressed_len: len,
            extra: Vec::new(),
            descriptor: false,
        }
    }
}

/// Minimal ZIP writer for archive fixtures (no CRCs, no ZIP64).
#[allow(clippy::cast_possible_truncation)]
pub fn build_zip(entries: &[ZipEntry<'_>]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut central = Vec::new();
    for e in entries {
        let local_offset = out.len() as u32;
        let flags: u16 = if e.descriptor { 0x0008 } else { 0 };
        let csize = e.data.len() as u32;
        let (hdr_csize, hdr_usize) = if e.descriptor {
            (0, 0)
        } else {
            (csize, e.uncompressed_len)
        };

        out.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&e.method.to_le_bytes());
        out.extend_from_slice(&[0u8; 4]); // time, date
        out.extend_from_slice(&0u32.to_le_bytes()); // crc
        out.extend_from_slice(&hdr_csize.to_le_bytes());
        out.extend_from_slice(&hdr_usize.to_le_bytes());
        out.extend_from_slice(&(e.name.len() as u16).to_le_bytes());
        out.extend_from_slice(&(e.extra.len() as u16).to_le_bytes());
        out.extend_from_slice(e.name.as_bytes());
        out.extend_from_slice(&e.extra);
        out.extend_from_slice(&e.data);
        if e.descriptor {
            out.extend_from_slice(&0x0807_4b50u32.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&csize.to_le_bytes());
            out.extend_from_slice(&e.uncompressed_len.to_le_bytes());
        }

        central.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
        central.extend_from_slice(&20u16.to_le_bytes());
        central.extend_from_slice(&20u16.to_le_bytes());
        central.extend_from_slice(&flags.to_le_bytes());
        central.extend_from_slice(&e.method.to_le_bytes());
        central.extend_from_slice(&[0u8; 4]);
        central.extend_from_slice(&0u32.to_le_bytes());
        central.extend_from_slice(&csize.to_le_bytes());
        central.extend_from_slice(&e.uncompressed_len.to_le_bytes());
        central.extend_from_slice(&(e.name.len() as u16).to_le_bytes());
        central.extend_from_slice(&[0u8; 4]); // extra len, comment len
        central.extend_from_slice(&[0u8; 8]); // disk, internal attrs, external attrs
        central.extend_from_slice(&local_offset.to_le_bytes());
        central.extend_from_slice(e.name.as_bytes());
    }

    let cd_offset = out.len() as u32;
    out.extend_from_slice(&central);
    out.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    out.extend_from_slice(&(central.len() as u32).to_le_bytes());
    out.extend_from_slice(&cd_offset.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}
