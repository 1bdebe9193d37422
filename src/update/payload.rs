//! Payload location inside an update package.
//!
//! An update package is a ZIP archive holding the raw `payload.bin` (stored,
//! not compressed) and an optional `payload_properties.txt`. The apply engine
//! reads the payload straight out of the archive, so instead of extracting it
//! we walk the local file headers and compute its byte range:
//!
//! ```text
//! offset(entry) = Σ previous (30 + name_len + extra_len + stored_size [+ descriptor])
//!               + 30 + name_len + extra_len
//! ```
//!
//! Entries written with a data descriptor (flag bit 3) carry zero sizes in the
//! local header; their sizes come from the central directory instead.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use flate2::read::DeflateDecoder;
use tracing::debug;

use super::UpdatePayloadSpec;
use crate::error::UpdateError;

pub const PAYLOAD_BINARY_NAME: &str = "payload.bin";
pub const PAYLOAD_PROPERTIES_NAME: &str = "payload_properties.txt";
/// Used when the package carries no properties file.
pub const DEFAULT_PROPERTY: &str = "SWITCH_SLOT_ON_REBOOT=1";

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const END_OF_CENTRAL_DIR_SIG: u32 = 0x0605_4b50;
const ZIP64_LOCATOR_SIG: u32 = 0x0706_4b50;
const ZIP64_END_SIG: u32 = 0x0606_4b50;
const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4b50;
const ZIP64_EXTRA_ID: u16 = 0x0001;

const LOCAL_HEADER_LEN: u64 = 30;
const CENTRAL_HEADER_LEN: usize = 46;
const END_OF_CENTRAL_DIR_LEN: u64 = 22;
const MAX_COMMENT_LEN: u64 = 0xFFFF;

/// Properties files are a handful of `KEY=value` lines.
const MAX_PROPERTIES_LEN: u64 = 64 * 1024;

const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;
const METHOD_STORED: u16 = 0;
const METHOD_DEFLATED: u16 = 8;

/// Locate the payload inside the archive at `archive`.
pub fn extract_payload_spec(archive: &Path) -> Result<UpdatePayloadSpec, UpdateError> {
    let file = File::open(archive)?;
    let archive_len = file.metadata()?.len();
    let mut zip = ArchiveReader {
        inner: BufReader::new(file),
        len: archive_len,
        central: None,
    };

    let mut payload: Option<(u64, u64)> = None;
    let mut properties: Option<Vec<String>> = None;
    let mut pos = 0u64;

    loop {
        if pos + 4 > archive_len {
            break;
        }
        let sig = zip.u32_at(pos)?;
        if sig != LOCAL_HEADER_SIG {
            if pos == 0 && sig != END_OF_CENTRAL_DIR_SIG {
                return Err(corrupt("not a ZIP archive"));
            }
            break;
        }
        let entry = zip.local_entry(pos)?;
        debug!(
            "Archive entry {} at {} ({} bytes stored)",
            entry.name, entry.data_offset, entry.stored_size
        );
        let data_end = entry
            .data_offset
            .checked_add(entry.stored_size)
            .filter(|&end| end <= archive_len)
            .ok_or_else(|| corrupt(&format!("entry {} extends past end of archive", entry.name)))?;

        if entry.name == PAYLOAD_BINARY_NAME {
            if entry.method != METHOD_STORED {
                return Err(corrupt("payload.bin must be stored uncompressed"));
            }
            payload = Some((entry.data_offset, entry.stored_size));
        } else if entry.name == PAYLOAD_PROPERTIES_NAME {
            properties = Some(zip.read_lines(&entry)?);
        }

        pos = data_end;
        if entry.flags & FLAG_DATA_DESCRIPTOR != 0 {
            pos += zip.descriptor_len(pos, entry.zip64)?;
        }
    }

    let (offset, size) = payload.ok_or(UpdateError::PayloadNotFound)?;
    let absolute = std::fs::canonicalize(archive)?;
    Ok(UpdatePayloadSpec {
        source_uri: format!("file://{}", absolute.display()),
        offset,
        size,
        properties: properties.unwrap_or_else(|| vec![DEFAULT_PROPERTY.to_string()]),
    })
}

fn corrupt(reason: &str) -> UpdateError {
    UpdateError::ArchiveCorrupt(reason.to_string())
}

#[derive(Debug)]
struct LocalEntry {
    name: String,
    flags: u16,
    method: u16,
    data_offset: u64,
    stored_size: u64,
    zip64: bool,
}

#[derive(Debug, Clone, Copy)]
struct CentralSizes {
    stored: u64,
    zip64: bool,
}

struct ArchiveReader {
    inner: BufReader<File>,
    len: u64,
    /// Central directory sizes by entry name, loaded on first use.
    central: Option<HashMap<String, CentralSizes>>,
}

impl ArchiveReader {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<(), UpdateError> {
        self.inner.seek(SeekFrom::Start(pos))?;
        self.inner.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                corrupt("unexpected end of archive")
            } else {
                UpdateError::Io(e)
            }
        })
    }

    fn u32_at(&mut self, pos: u64) -> Result<u32, UpdateError> {
        let mut b = [0u8; 4];
        self.read_at(pos, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn local_entry(&mut self, pos: u64) -> Result<LocalEntry, UpdateError> {
        let mut h = [0u8; 30];
        self.read_at(pos, &mut h)?;
        let flags = le16(&h, 6);
        let method = le16(&h, 8);
        let mut stored = u64::from(le32(&h, 18));
        let uncompressed = u64::from(le32(&h, 22));
        let name_len = usize::from(le16(&h, 26));
        let extra_len = usize::from(le16(&h, 28));

        let mut name_extra = vec![0u8; name_len + extra_len];
        self.read_at(pos + LOCAL_HEADER_LEN, &mut name_extra)?;
        let name = String::from_utf8_lossy(&name_extra[..name_len]).into_owned();
        let extra = &name_extra[name_len..];

        let mut zip64 = false;
        if stored == u64::from(u32::MAX) || uncompressed == u64::from(u32::MAX) {
            // Local ZIP64 extra holds both sizes: uncompressed, then compressed.
            let fields = zip64_fields(extra)
                .ok_or_else(|| corrupt(&format!("entry {name} lacks ZIP64 sizes")))?;
            stored = *fields
                .get(1)
                .ok_or_else(|| corrupt(&format!("entry {name} lacks ZIP64 sizes")))?;
            zip64 = true;
        }
        if flags & FLAG_DATA_DESCRIPTOR != 0 {
            let sizes = self
                .central_sizes(&name)?
                .ok_or_else(|| corrupt(&format!("entry {name} missing from central directory")))?;
            stored = sizes.stored;
            zip64 |= sizes.zip64;
        }

        Ok(LocalEntry {
            data_offset: pos + LOCAL_HEADER_LEN + (name_len + extra_len) as u64,
            name,
            flags,
            method,
            stored_size: stored,
            zip64,
        })
    }

    /// Length of the data descriptor starting at `pos`.
    fn descriptor_len(&mut self, pos: u64, zip64: bool) -> Result<u64, UpdateError> {
        let sizes = if zip64 { 16 } else { 8 };
        let sig = if pos + 4 <= self.len && self.u32_at(pos)? == DATA_DESCRIPTOR_SIG {
            4
        } else {
            0
        };
        Ok(sig + 4 + sizes)
    }

    fn read_lines(&mut self, entry: &LocalEntry) -> Result<Vec<String>, UpdateError> {
        let too_large = || corrupt(&format!("{} exceeds {MAX_PROPERTIES_LEN} bytes", entry.name));
        if entry.stored_size > MAX_PROPERTIES_LEN {
            return Err(too_large());
        }
        let mut raw = vec![0u8; usize::try_from(entry.stored_size).map_err(|_| too_large())?];
        self.read_at(entry.data_offset, &mut raw)?;
        let bytes = match entry.method {
            METHOD_STORED => raw,
            METHOD_DEFLATED => {
                let mut out = Vec::new();
                DeflateDecoder::new(raw.as_slice())
                    .take(MAX_PROPERTIES_LEN + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| corrupt(&format!("cannot inflate {}: {e}", entry.name)))?;
                if out.len() as u64 > MAX_PROPERTIES_LEN {
                    return Err(too_large());
                }
                out
            }
            other => {
                return Err(corrupt(&format!(
                    "unsupported compression method {other} for {}",
                    entry.name
                )))
            }
        };
        Ok(String::from_utf8_lossy(&bytes)
            .lines()
            .map(ToString::to_string)
            .collect())
    }

    fn central_sizes(&mut self, name: &str) -> Result<Option<CentralSizes>, UpdateError> {
        if self.central.is_none() {
            self.central = Some(self.load_central_directory()?);
        }
        Ok(self.central.as_ref().and_then(|c| c.get(name).copied()))
    }

    fn load_central_directory(&mut self) -> Result<HashMap<String, CentralSizes>, UpdateError> {
        let (cd_offset, cd_size) = self.find_central_directory()?;
        if cd_offset.checked_add(cd_size).map_or(true, |end| end > self.len) {
            return Err(corrupt("central directory extends past end of archive"));
        }
        let cd_len = usize::try_from(cd_size).map_err(|_| corrupt("central directory too large"))?;
        let mut cd = vec![0u8; cd_len];
        self.read_at(cd_offset, &mut cd)?;

        let mut sizes = HashMap::new();
        let mut i = 0usize;
        while i + CENTRAL_HEADER_LEN <= cd.len() && le32(&cd, i) == CENTRAL_HEADER_SIG {
            let compressed = u64::from(le32(&cd, i + 20));
            let uncompressed = u64::from(le32(&cd, i + 24));
            let name_len = usize::from(le16(&cd, i + 28));
            let extra_len = usize::from(le16(&cd, i + 30));
            let comment_len = usize::from(le16(&cd, i + 32));
            let name_start = i + CENTRAL_HEADER_LEN;
            let extra_start = name_start + name_len;
            let next = extra_start + extra_len + comment_len;
            if next > cd.len() {
                return Err(corrupt("truncated central directory"));
            }
            let name = String::from_utf8_lossy(&cd[name_start..extra_start]).into_owned();

            let mut stored = compressed;
            let mut zip64 = false;
            if compressed == u64::from(u32::MAX) {
                // Only the fields that overflowed are present, in fixed order.
                let fields = zip64_fields(&cd[extra_start..extra_start + extra_len])
                    .ok_or_else(|| corrupt(&format!("entry {name} lacks ZIP64 sizes")))?;
                let idx = usize::from(uncompressed == u64::from(u32::MAX));
                stored = *fields
                    .get(idx)
                    .ok_or_else(|| corrupt(&format!("entry {name} lacks ZIP64 sizes")))?;
                zip64 = true;
            }
            sizes.insert(name, CentralSizes { stored, zip64 });
            i = next;
        }
        Ok(sizes)
    }

    /// Returns the central directory's (offset, size) from the end records.
    fn find_central_directory(&mut self) -> Result<(u64, u64), UpdateError> {
        if self.len < END_OF_CENTRAL_DIR_LEN {
            return Err(corrupt("archive too short"));
        }
        let tail_len = self.len.min(END_OF_CENTRAL_DIR_LEN + MAX_COMMENT_LEN);
        let tail_start = self.len - tail_len;
        let mut tail = vec![0u8; usize::try_from(tail_len).unwrap_or(0)];
        self.read_at(tail_start, &mut tail)?;

        let eocd = (0..=tail.len() - END_OF_CENTRAL_DIR_LEN as usize)
            .rev()
            .find(|&i| le32(&tail, i) == END_OF_CENTRAL_DIR_SIG)
            .ok_or_else(|| corrupt("end of central directory not found"))?;
        let cd_size = u64::from(le32(&tail, eocd + 12));
        let cd_offset = u64::from(le32(&tail, eocd + 16));
        if cd_offset != u64::from(u32::MAX) && cd_size != u64::from(u32::MAX) {
            return Ok((cd_offset, cd_size));
        }

        let locator = eocd
            .checked_sub(20)
            .filter(|&l| le32(&tail, l) == ZIP64_LOCATOR_SIG)
            .ok_or_else(|| corrupt("ZIP64 locator not found"))?;
        let zip64_end = le64(&tail, locator + 8);
        let mut rec = [0u8; 56];
        self.read_at(zip64_end, &mut rec)?;
        if le32(&rec, 0) != ZIP64_END_SIG {
            return Err(corrupt("ZIP64 end of central directory not found"));
        }
        Ok((le64(&rec, 48), le64(&rec, 40)))
    }
}

/// Values of the ZIP64 extended information extra field, if present.
fn zip64_fields(extra: &[u8]) -> Option<Vec<u64>> {
    let mut i = 0usize;
    while i + 4 <= extra.len() {
        let id = le16(extra, i);
        let len = usize::from(le16(extra, i + 2));
        let data = extra.get(i + 4..i + 4 + len)?;
        if id == ZIP64_EXTRA_ID {
            return Some(data.chunks_exact(8).map(|c| le64(c, 0)).collect());
        }
        i += 4 + len;
    }
    None
}

fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn le64(b: &[u8], at: usize) -> u64 {
    let mut v = [0u8; 8];
    v.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(v)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::DeflateEncoder;
    use flate2::Compression;

    use super::*;
    use crate::testutil::{build_zip, ZipEntry};

    const PAYLOAD: &[u8] = b"CrAU\x00\x00\x00\x02-not-really-a-payload-";

    fn write_archive(dir: &tempfile::TempDir, entries: &[ZipEntry<'_>]) -> std::path::PathBuf {
        let path = dir.path().join("ota.zip");
        std::fs::write(&path, build_zip(entries)).unwrap();
        path
    }

    fn payload_at(path: &Path, spec: &UpdatePayloadSpec) -> Vec<u8> {
        let data = std::fs::read(path).unwrap();
        let start = usize::try_from(spec.offset).unwrap();
        data[start..start + usize::try_from(spec.size).unwrap()].to_vec()
    }

    #[test]
    fn test_payload_only_gets_default_properties() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_archive(&dir, &[ZipEntry::stored("payload.bin", PAYLOAD)]);

        let spec = extract_payload_spec(&path).unwrap();
        assert_eq!(spec.properties, vec!["SWITCH_SLOT_ON_REBOOT=1".to_string()]);
        assert_eq!(spec.offset, 30 + "payload.bin".len() as u64);
        assert_eq!(spec.size, PAYLOAD.len() as u64);
        assert!(spec.source_uri.starts_with("file:///"));
        assert!(spec.source_uri.ends_with("/ota.zip"));
    }

    #[test]
    fn test_offset_accounts_for_preceding_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut care_map = ZipEntry::stored("care_map.pb", b"0123456789");
        care_map.extra = vec![0xfe, 0xca, 0x00, 0x00];
        let path = write_archive(
            &dir,
            &[
                ZipEntry::stored("META-INF/", b""),
                care_map,
                ZipEntry::stored("payload_properties.txt", b"FILE_HASH=abc\r\nFILE_SIZE=42\n"),
                ZipEntry::stored("payload.bin", PAYLOAD),
            ],
        );

        let spec = extract_payload_spec(&path).unwrap();
        assert_eq!(payload_at(&path, &spec), PAYLOAD);
        assert_eq!(spec.properties, vec!["FILE_HASH=abc", "FILE_SIZE=42"]);
    }

    #[test]
    fn test_deflated_properties_are_inflated() {
        let text = b"FILE_HASH=xyz\nMETADATA_HASH=123\n";
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(text).unwrap();
        let compressed = enc.finish().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = write_archive(
            &dir,
            &[
                ZipEntry {
                    name: "payload_properties.txt",
                    data: compressed,
                    method: 8,
                    uncompressed_len: text.len() as u32,
                    extra: Vec::new(),
                    descriptor: false,
                },
                ZipEntry::stored("payload.bin", PAYLOAD),
            ],
        );

        let spec = extract_payload_spec(&path).unwrap();
        assert_eq!(spec.properties, vec!["FILE_HASH=xyz", "METADATA_HASH=123"]);
        assert_eq!(payload_at(&path, &spec), PAYLOAD);
    }

    #[test]
    fn test_data_descriptor_sizes_come_from_central_directory() {
        let mut props = ZipEntry::stored("payload_properties.txt", b"A=1\n");
        props.descriptor = true;
        let dir = tempfile::tempdir().unwrap();
        let path = write_archive(&dir, &[props, ZipEntry::stored("payload.bin", PAYLOAD)]);

        let spec = extract_payload_spec(&path).unwrap();
        assert_eq!(spec.properties, vec!["A=1"]);
        assert_eq!(payload_at(&path, &spec), PAYLOAD);
    }

    #[test]
    fn test_missing_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_archive(&dir, &[ZipEntry::stored("payload_properties.txt", b"A=1\n")]);
        assert!(matches!(
            extract_payload_spec(&path),
            Err(UpdateError::PayloadNotFound)
        ));
    }

    #[test]
    fn test_compressed_payload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut payload = ZipEntry::stored("payload.bin", PAYLOAD);
        payload.method = 8;
        let path = write_archive(&dir, &[payload]);
        assert!(matches!(
            extract_payload_spec(&path),
            Err(UpdateError::ArchiveCorrupt(_))
        ));
    }

    #[test]
    fn test_corrupt_archives() {
        let dir = tempfile::tempdir().unwrap();

        let garbage = dir.path().join("garbage.zip");
        std::fs::write(&garbage, b"definitely not a zip file").unwrap();
        assert!(matches!(
            extract_payload_spec(&garbage),
            Err(UpdateError::ArchiveCorrupt(_))
        ));

        let mut truncated = build_zip(&[ZipEntry::stored("payload.bin", PAYLOAD)]);
        truncated.truncate(40);
        let path = dir.path().join("truncated.zip");
        std::fs::write(&path, truncated).unwrap();
        assert!(matches!(
            extract_payload_spec(&path),
            Err(UpdateError::ArchiveCorrupt(_))
        ));
    }

    #[test]
    fn test_missing_archive_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            extract_payload_spec(&dir.path().join("absent.zip")),
            Err(UpdateError::Io(_))
        ));
    }

    fn zip64_extra(uncompressed: u64, compressed: u64) -> Vec<u8> {
        let mut extra = Vec::new();
        extra.extend_from_slice(&ZIP64_EXTRA_ID.to_le_bytes());
        extra.extend_from_slice(&16u16.to_le_bytes());
        extra.extend_from_slice(&uncompressed.to_le_bytes());
        extra.extend_from_slice(&compressed.to_le_bytes());
        extra
    }

    #[test]
    fn test_zip64_size_past_end_is_corrupt() {
        let mut payload = ZipEntry::stored("payload.bin", b"");
        payload.extra = zip64_extra(0, u64::MAX);
        let mut data = build_zip(&[payload]);
        // Local header compressed size = 0xFFFFFFFF defers to the ZIP64 field.
        data[18..22].copy_from_slice(&u32::MAX.to_le_bytes());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zip64.zip");
        std::fs::write(&path, data).unwrap();
        assert!(matches!(
            extract_payload_spec(&path),
            Err(UpdateError::ArchiveCorrupt(_))
        ));
    }

    #[test]
    fn test_central_directory_past_end_is_corrupt() {
        let mut props = ZipEntry::stored("payload_properties.txt", b"A=1\n");
        props.descriptor = true;
        let mut data = build_zip(&[props, ZipEntry::stored("payload.bin", PAYLOAD)]);
        let cd_size_at = data.len() - 22 + 12;
        data[cd_size_at..cd_size_at + 4].copy_from_slice(&0xFFFF_FFF0u32.to_le_bytes());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad-cd.zip");
        std::fs::write(&path, data).unwrap();
        assert!(matches!(
            extract_payload_spec(&path),
            Err(UpdateError::ArchiveCorrupt(_))
        ));
    }

    #[test]
    fn test_oversized_properties_rejected() {
        let big = vec![b'x'; 70 * 1024];
        let dir = tempfile::tempdir().unwrap();
        let path = write_archive(
            &dir,
            &[
                ZipEntry::stored("payload_properties.txt", &big),
                ZipEntry::stored("payload.bin", PAYLOAD),
            ],
        );
        assert!(matches!(
            extract_payload_spec(&path),
            Err(UpdateError::ArchiveCorrupt(_))
        ));

        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&big).unwrap();
        let compressed = enc.finish().unwrap();
        let path = write_archive(
            &dir,
            &[
                ZipEntry {
                    name: "payload_properties.txt",
                    data: compressed,
                    method: 8,
                    uncompressed_len: big.len() as u32,
                    extra: Vec::new(),
                    descriptor: false,
                },
                ZipEntry::stored("payload.bin", PAYLOAD),
            ],
        );
        assert!(matches!(
            extract_payload_spec(&path),
            Err(UpdateError::ArchiveCorrupt(_))
        ));
    }

    #[test]
    fn test_zip64_extra_field() {
        assert_eq!(zip64_fields(&zip64_extra(7, 9)), Some(vec![7, 9]));
        assert_eq!(zip64_fields(&[0x99, 0x99, 0x00, 0x00]), None);
    }
}
