//! Accepts placement hints from explicit submission or kernel-originated
//! events and serves them back out to the placement strategies.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::Flags;
use crate::error::Result;
use crate::types::LogAddr;

/// Maximum inode/LBA ranges carried in a single hint submission.
pub const HINT_DATA_MAX_INOS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintClass {
    Empty = 0,
    Unknown = 1,
    VideoSlow = 2,
    ImageSlow = 3,
    DbIndex = 4,
}

/// One hint record. `flags` selects which placement mode(s) this hint
/// applies to (`ENGINE_SWAP` / `ENGINE_LATENCY` / `ENGINE_PACK`).
#[derive(Debug, Clone)]
pub struct HintRecord {
    pub inode: u64,
    pub start_lba: LogAddr,
    pub count: u32,
    pub class: HintClass,
    pub is_write: bool,
    pub flags: u32,
    pub processed: u32,
}

impl HintRecord {
    fn covers(&self, l: LogAddr) -> bool {
        l >= self.start_lba && l < self.start_lba + self.count as LogAddr
    }
}

/// One element of a hint submission payload.
#[derive(Debug, Clone)]
pub struct HintDataEntry {
    pub ino: u64,
    pub start_lba: u32,
    pub count: u32,
    pub class: HintClass,
}

#[derive(Debug, Clone)]
pub struct HintPayload {
    pub lba: u32,
    pub sectors_count: u32,
    pub is_write: bool,
    pub hint_flags: u32,
    pub data: Vec<HintDataEntry>,
}

/// Tags which channel a hint arrived through, for logging only — both
/// sources feed the same ingestion path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintSource {
    Submit,
    Kernel,
}

pub struct HintIngestion {
    hints: Mutex<Vec<HintRecord>>,
    /// Inode -> access class, consulted by swap placement to decide
    /// whether an inode's writes belong on a fast page.
    ino2fc: RwLock<HashMap<u64, HintClass>>,
}

impl HintIngestion {
    pub fn new() -> Self {
        Self {
            hints: Mutex::new(Vec::new()),
            ino2fc: RwLock::new(HashMap::new()),
        }
    }

    /// Accepts a hint submission. Validates the payload size against
    /// `HINT_DATA_MAX_INOS`; a rejection is a typed error, never an
    /// uninitialized value.
    pub fn submit(&self, source: HintSource, payload: HintPayload) -> Result<()> {
        if payload.data.len() > HINT_DATA_MAX_INOS {
            return Err(crate::error::FtlError::Transient(format!(
                "hint payload carries {} entries, max is {}",
                payload.data.len(),
                HINT_DATA_MAX_INOS
            )));
        }
        // Strip any bits outside the three placement-mode flags so a hint
        // can never match `find_hint` through an unrelated flag collision.
        let flags = active_mode_flags(Flags(payload.hint_flags));
        let mut hints = self.hints.lock();
        for entry in &payload.data {
            hints.push(HintRecord {
                inode: entry.ino,
                start_lba: entry.start_lba as LogAddr,
                count: entry.count,
                class: entry.class,
                is_write: payload.is_write,
                flags,
                processed: 0,
            });
            self.ino2fc.write().insert(entry.ino, entry.class);
        }
        debug!(?source, count = payload.data.len(), "hints ingested");
        Ok(())
    }

    /// First record covering `l` whose flags intersect `active_mode`,
    /// consuming one use.
    pub fn find_hint(&self, l: LogAddr, is_write: bool, active_mode: u32) -> Option<HintRecord> {
        let mut hints = self.hints.lock();
        let idx = hints.iter().position(|h| {
            h.covers(l) && h.is_write == is_write && (h.flags & active_mode) != 0
        })?;
        hints[idx].processed += 1;
        let result = hints[idx].clone();
        if hints[idx].processed >= hints[idx].count {
            hints.remove(idx);
        }
        Some(result)
    }

    pub fn class_for_inode(&self, inode: u64) -> HintClass {
        self.ino2fc.read().get(&inode).copied().unwrap_or(HintClass::Unknown)
    }

    pub fn len(&self) -> usize {
        self.hints.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HintIngestion {
    fn default() -> Self {
        Self::new()
    }
}

/// Classifies a write by sniffing the first sector for magic bytes,
/// compared as an unsigned byte sequence, never as signed bytes.
pub fn file_classify(first_sector: &[u8]) -> HintClass {
    const VIDEO_MAGIC: [u8; 4] = [0x66, 0x74, 0x79, 0x70]; // "ftyp"
    const DB_INDEX_MAGIC: [u8; 4] = [0x53, 0x51, 0x4c, 0x69]; // "SQLi"
    if first_sector.len() < 8 {
        return HintClass::Unknown;
    }
    if first_sector[4..8] == VIDEO_MAGIC {
        HintClass::VideoSlow
    } else if first_sector[0..4] == DB_INDEX_MAGIC {
        HintClass::DbIndex
    } else {
        HintClass::Unknown
    }
}

pub fn active_mode_flags(misc_flags: Flags) -> u32 {
    misc_flags.0 & (Flags::ENGINE_SWAP | Flags::ENGINE_LATENCY | Flags::ENGINE_PACK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_hint_matches_covering_range_and_consumes() {
        let ingestion = HintIngestion::new();
        ingestion
            .submit(
                HintSource::Submit,
                HintPayload {
                    lba: 5,
                    sectors_count: 1,
                    is_write: true,
                    hint_flags: Flags::ENGINE_SWAP,
                    data: vec![HintDataEntry {
                        ino: 1,
                        start_lba: 5,
                        count: 1,
                        class: HintClass::Unknown,
                    }],
                },
            )
            .unwrap();
        let hint = ingestion.find_hint(5, true, Flags::ENGINE_SWAP).unwrap();
        assert_eq!(hint.inode, 1);
        assert!(ingestion.is_empty());
    }

    #[test]
    fn find_hint_ignores_mismatched_mode() {
        let ingestion = HintIngestion::new();
        ingestion
            .submit(
                HintSource::Kernel,
                HintPayload {
                    lba: 5,
                    sectors_count: 1,
                    is_write: true,
                    hint_flags: Flags::ENGINE_LATENCY,
                    data: vec![HintDataEntry {
                        ino: 1,
                        start_lba: 5,
                        count: 1,
                        class: HintClass::Unknown,
                    }],
                },
            )
            .unwrap();
        assert!(ingestion.find_hint(5, true, Flags::ENGINE_SWAP).is_none());
    }

    #[test]
    fn rejects_oversized_payload() {
        let ingestion = HintIngestion::new();
        let data = (0..HINT_DATA_MAX_INOS + 1)
            .map(|i| HintDataEntry {
                ino: i as u64,
                start_lba: 0,
                count: 1,
                class: HintClass::Unknown,
            })
            .collect();
        let result = ingestion.submit(
            HintSource::Submit,
            HintPayload {
                lba: 0,
                sectors_count: 1,
                is_write: true,
                hint_flags: 0,
                data,
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn classifies_video_magic() {
        let mut sector = vec![0u8; 16];
        sector[4..8].copy_from_slice(&[0x66, 0x74, 0x79, 0x70]);
        assert_eq!(file_classify(&sector), HintClass::VideoSlow);
    }
}
