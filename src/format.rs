//! Format catalog for zero-copy dmabuf import
//!
//! Tracks the (fourcc, modifier) pairs the compositor accepts through
//! `zwp_linux_dmabuf_v1`. Two negotiation mechanisms exist and a connection
//! speaks exactly one of them:
//! - versions 2 and 3 send a flat list of `format` (and `modifier`) events
//! - version 4 sends a format table over a file descriptor, then tranches of
//!   indices into that table, terminated by `done`
//!
//! An empty catalog rejects every import.

use std::collections::HashSet;
use std::fmt;
use std::os::fd::OwnedFd;

use thiserror::Error;
use tracing::{debug, trace, warn};

/// Implicit modifier: the producer and consumer agree on the layout out of band.
pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;
pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;

/// Size of one `{u32 format, u32 padding, u64 modifier}` table record.
const TABLE_ENTRY_SIZE: usize = 16;

/// A DRM fourcc pixel format code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FourCc(pub u32);

impl FourCc {
    pub const fn from_chars(code: &[u8; 4]) -> Self {
        Self(
            code[0] as u32
                | (code[1] as u32) << 8
                | (code[2] as u32) << 16
                | (code[3] as u32) << 24,
        )
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.to_le_bytes() {
            let c = if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '?'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormatEntry {
    pub format: u32,
    pub modifier: u64,
}

/// Which negotiation mechanism populated the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Negotiation {
    #[default]
    None,
    FormatList,
    FeedbackTable,
}

#[derive(Debug, Error)]
pub enum FormatTableError {
    #[error("failed to map format table: {0}")]
    Map(#[from] std::io::Error),
    #[error("format table size {0} is not a multiple of {TABLE_ENTRY_SIZE}")]
    Truncated(usize),
}

#[derive(Debug, Default)]
pub struct FormatCatalog {
    pairs: HashSet<FormatEntry>,
    implicit: HashSet<u32>,
    negotiation: Negotiation,
    feedback: FeedbackState,
}

/// In-progress `zwp_linux_dmabuf_feedback_v1` batch.
#[derive(Debug, Default)]
struct FeedbackState {
    table: Vec<FormatEntry>,
    indices: Vec<u16>,
}

impl FormatCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent insert of a (format, modifier) pair.
    pub fn record(&mut self, format: u32, modifier: u64) {
        if self.pairs.insert(FormatEntry { format, modifier }) {
            trace!(
                format = %FourCc(format),
                modifier = format_args!("{modifier:#018x}"),
                "format supported by the compositor"
            );
        }
    }

    /// A bare format code from the flat list. Its presence means "supported
    /// with the implicit or linear modifier".
    pub fn record_implicit(&mut self, format: u32) {
        self.negotiation = Negotiation::FormatList;
        if self.implicit.insert(format) {
            debug!("{} is supported by the compositor", FourCc(format));
        }
    }

    /// A `modifier` event of the flat list (version 3).
    pub fn record_modifier(&mut self, format: u32, modifier: u64) {
        self.negotiation = Negotiation::FormatList;
        self.record(format, modifier);
    }

    pub fn supports(&self, format: u32, modifier: u64) -> bool {
        if self.pairs.contains(&FormatEntry { format, modifier }) {
            return true;
        }
        matches!(modifier, DRM_FORMAT_MOD_INVALID | DRM_FORMAT_MOD_LINEAR)
            && self.implicit.contains(&format)
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty() && self.implicit.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len() + self.implicit.len()
    }

    pub fn negotiation(&self) -> Negotiation {
        self.negotiation
    }

    /// Every known pair, implicit formats reported with `DRM_FORMAT_MOD_INVALID`.
    pub fn entries(&self) -> Vec<FormatEntry> {
        let mut entries: Vec<_> = self
            .pairs
            .iter()
            .copied()
            .chain(self.implicit.iter().map(|&format| FormatEntry {
                format,
                modifier: DRM_FORMAT_MOD_INVALID,
            }))
            .collect();
        entries.sort_by_key(|e| (e.format, e.modifier));
        entries.dedup();
        entries
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
        self.implicit.clear();
        self.negotiation = Negotiation::None;
        self.feedback = FeedbackState::default();
    }

    /// `format_table` event: map the table and keep it until `done`.
    pub fn load_table(&mut self, fd: OwnedFd, size: u32) -> Result<(), FormatTableError> {
        let size = size as usize;
        if size % TABLE_ENTRY_SIZE != 0 {
            return Err(FormatTableError::Truncated(size));
        }
        if size == 0 {
            self.feedback.table.clear();
            return Ok(());
        }
        // SAFETY: the table must be mapped read-only and private. The
        // compositor never truncates it and the mapping does not outlive this
        // function.
        let map = unsafe { memmap2::MmapOptions::new().len(size).map_copy_read_only(&fd)? };
        self.feedback.table = parse_table(&map)?;
        debug!(entries = self.feedback.table.len(), "received dmabuf format table");
        Ok(())
    }

    /// `tranche_formats` event: native-endian u16 indices into the table.
    pub fn add_tranche_indices(&mut self, indices: &[u8]) {
        self.feedback.indices.extend(
            indices
                .chunks_exact(2)
                .map(|c| u16::from_ne_bytes([c[0], c[1]])),
        );
    }

    /// `done` event: replace the catalog with the pairs the tranches referenced.
    /// A feedback batch without tranche indices commits the whole table.
    pub fn commit_feedback(&mut self) {
        let FeedbackState { table, indices } = &mut self.feedback;
        if table.is_empty() {
            warn!("dmabuf feedback done without a format table");
            indices.clear();
            return;
        }
        let committed: HashSet<FormatEntry> = if indices.is_empty() {
            table.iter().copied().collect()
        } else {
            indices
                .drain(..)
                .filter_map(|i| {
                    let entry = table.get(i as usize).copied();
                    if entry.is_none() {
                        warn!(index = i, "tranche index outside of the format table");
                    }
                    entry
                })
                .collect()
        };
        self.pairs = committed;
        self.implicit.clear();
        self.negotiation = Negotiation::FeedbackTable;
        debug!(pairs = self.pairs.len(), "dmabuf feedback committed");
    }
}

pub fn parse_table(bytes: &[u8]) -> Result<Vec<FormatEntry>, FormatTableError> {
    if bytes.len() % TABLE_ENTRY_SIZE != 0 {
        return Err(FormatTableError::Truncated(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(TABLE_ENTRY_SIZE)
        .map(|record| {
            let mut format = [0u8; 4];
            let mut modifier = [0u8; 8];
            format.copy_from_slice(&record[0..4]);
            modifier.copy_from_slice(&record[8..16]);
            FormatEntry {
                format: u32::from_ne_bytes(format),
                modifier: u64::from_ne_bytes(modifier),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const NV12: FourCc = FourCc::from_chars(b"NV12");
    const P010: FourCc = FourCc::from_chars(b"P010");
    const Y_TILED: u64 = 0x0100_0000_0000_0002;

    fn table_bytes(entries: &[(FourCc, u64)]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for (format, modifier) in entries {
            bytes.extend_from_slice(&format.0.to_ne_bytes());
            bytes.extend_from_slice(&0u32.to_ne_bytes());
            bytes.extend_from_slice(&modifier.to_ne_bytes());
        }
        bytes
    }

    fn table_fd(bytes: &[u8]) -> OwnedFd {
        let memfd = memfd::MemfdOptions::default()
            .create("format-table")
            .unwrap();
        memfd.as_file().write_all(bytes).unwrap();
        OwnedFd::from(memfd.into_file())
    }

    #[test]
    fn fourcc_displays_as_text() {
        assert_eq!(NV12.to_string(), "NV12");
        assert_eq!(FourCc(0x3231_564e).to_string(), "NV12");
    }

    #[test]
    fn empty_catalog_supports_nothing() {
        let catalog = FormatCatalog::new();
        assert!(catalog.is_empty());
        assert!(!catalog.supports(NV12.0, DRM_FORMAT_MOD_LINEAR));
        assert_eq!(catalog.negotiation(), Negotiation::None);
    }

    #[test]
    fn record_is_visible_immediately_and_idempotent() {
        let mut catalog = FormatCatalog::new();
        assert!(!catalog.supports(NV12.0, Y_TILED));
        catalog.record(NV12.0, Y_TILED);
        catalog.record(NV12.0, Y_TILED);
        assert!(catalog.supports(NV12.0, Y_TILED));
        assert!(!catalog.supports(NV12.0, DRM_FORMAT_MOD_LINEAR));
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn implicit_formats_accept_only_implicit_or_linear() {
        let mut catalog = FormatCatalog::new();
        catalog.record_implicit(NV12.0);
        assert_eq!(catalog.negotiation(), Negotiation::FormatList);
        assert!(catalog.supports(NV12.0, DRM_FORMAT_MOD_INVALID));
        assert!(catalog.supports(NV12.0, DRM_FORMAT_MOD_LINEAR));
        assert!(!catalog.supports(NV12.0, Y_TILED));
        assert!(!catalog.supports(P010.0, DRM_FORMAT_MOD_LINEAR));
    }

    #[test]
    fn parse_table_reads_native_endian_records() {
        let bytes = table_bytes(&[(NV12, Y_TILED), (P010, DRM_FORMAT_MOD_LINEAR)]);
        let entries = parse_table(&bytes).unwrap();
        assert_eq!(
            entries,
            vec![
                FormatEntry {
                    format: NV12.0,
                    modifier: Y_TILED
                },
                FormatEntry {
                    format: P010.0,
                    modifier: DRM_FORMAT_MOD_LINEAR
                },
            ]
        );
    }

    #[test]
    fn parse_table_rejects_partial_records() {
        assert!(matches!(
            parse_table(&[0u8; 20]),
            Err(FormatTableError::Truncated(20))
        ));
    }

    #[test]
    #[serial]
    fn feedback_commits_only_tranche_indices() {
        let mut catalog = FormatCatalog::new();
        let bytes = table_bytes(&[(NV12, Y_TILED), (P010, DRM_FORMAT_MOD_LINEAR)]);
        catalog.load_table(table_fd(&bytes), bytes.len() as u32).unwrap();
        assert!(!catalog.supports(NV12.0, Y_TILED));

        catalog.add_tranche_indices(&1u16.to_ne_bytes());
        catalog.commit_feedback();

        assert_eq!(catalog.negotiation(), Negotiation::FeedbackTable);
        assert!(catalog.supports(P010.0, DRM_FORMAT_MOD_LINEAR));
        assert!(!catalog.supports(NV12.0, Y_TILED));
    }

    #[test]
    #[serial]
    fn write_sealed_table_maps_privately() {
        let bytes = table_bytes(&[(NV12, Y_TILED)]);
        let memfd = memfd::MemfdOptions::default()
            .allow_sealing(true)
            .create("sealed-format-table")
            .unwrap();
        memfd.as_file().write_all(&bytes).unwrap();
        memfd.add_seal(memfd::FileSeal::SealShrink).unwrap();
        memfd.add_seal(memfd::FileSeal::SealGrow).unwrap();
        memfd.add_seal(memfd::FileSeal::SealWrite).unwrap();

        let mut catalog = FormatCatalog::new();
        catalog
            .load_table(OwnedFd::from(memfd.into_file()), bytes.len() as u32)
            .unwrap();
        catalog.commit_feedback();
        assert!(catalog.supports(NV12.0, Y_TILED));
    }

    #[test]
    #[serial]
    fn feedback_without_tranches_commits_whole_table() {
        let mut catalog = FormatCatalog::new();
        let bytes = table_bytes(&[(NV12, Y_TILED), (P010, DRM_FORMAT_MOD_LINEAR)]);
        catalog.load_table(table_fd(&bytes), bytes.len() as u32).unwrap();
        catalog.commit_feedback();
        assert!(catalog.supports(NV12.0, Y_TILED));
        assert!(catalog.supports(P010.0, DRM_FORMAT_MOD_LINEAR));
    }

    #[test]
    #[serial]
    fn reissued_feedback_rebuilds_the_catalog() {
        let mut catalog = FormatCatalog::new();
        let first = table_bytes(&[(NV12, Y_TILED)]);
        catalog.load_table(table_fd(&first), first.len() as u32).unwrap();
        catalog.commit_feedback();

        let second = table_bytes(&[(P010, DRM_FORMAT_MOD_LINEAR)]);
        catalog.load_table(table_fd(&second), second.len() as u32).unwrap();
        catalog.commit_feedback();

        assert!(!catalog.supports(NV12.0, Y_TILED));
        assert!(catalog.supports(P010.0, DRM_FORMAT_MOD_LINEAR));
    }

    #[test]
    #[serial]
    fn out_of_range_tranche_indices_are_skipped() {
        let mut catalog = FormatCatalog::new();
        let bytes = table_bytes(&[(NV12, Y_TILED)]);
        catalog.load_table(table_fd(&bytes), bytes.len() as u32).unwrap();
        let mut indices = 0u16.to_ne_bytes().to_vec();
        indices.extend_from_slice(&7u16.to_ne_bytes());
        catalog.add_tranche_indices(&indices);
        catalog.commit_feedback();
        assert_eq!(catalog.len(), 1);
    }
}
