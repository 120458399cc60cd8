use anyhow::{bail, Context as AnyhowContext, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::core::reader::{MifareKey, NfcReader};
use crate::core::tag::{NfcTag, TagFamily};
use crate::core::utils::format_hex_spaced;

/// Byte written into a unit's slot when that unit could not be
/// authenticated or read. Every failure path uses this one constant so a
/// dump image is unambiguous about which slots are real data.
pub const FAILED_UNIT_FILL: u8 = 0x00;

/// Per-dump failure counters, zero-initialized and only ever incremented
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpStats {
    /// Units that failed to read after a successful authentication (or
    /// without one, for the unauthenticated families)
    pub unreadable: u32,
    /// Mifare Classic blocks whose sector key was rejected
    pub unauthenticated: u32,
}

/// Phase of an in-progress dump. A failed poll short-circuits straight to
/// `Done` with no image; per-unit failures only advance the counters and
/// never abort the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DumpPhase {
    Unit(usize),
    Done,
}

/// How one unit visit ended
enum UnitOutcome {
    Read,
    Unreadable,
    Unauthenticated,
}

/// Drives full-tag reads over any [`NfcReader`], producing an [`NfcTag`]
/// image and a partial-failure summary.
///
/// Dumps are synchronous and blocking for the whole tag; units are
/// visited exactly once each, in ascending index order.
pub struct TagDumper {
    fill: u8,
}

impl TagDumper {
    pub fn new() -> Self {
        Self {
            fill: FAILED_UNIT_FILL,
        }
    }

    /// Override the failed-unit fill byte
    pub fn with_fill(fill: u8) -> Self {
        Self { fill }
    }

    /// Dump whatever ISO14443A tag is present, classifying Classic vs
    /// Ultralight from the UID length. Classic blocks authenticate with
    /// the single supplied key before each read.
    ///
    /// Returns `Ok(None)` when no tag answers the poll; this is always
    /// distinguishable from a present tag with unreadable blocks.
    pub fn dump_tag<R: NfcReader>(
        &self,
        reader: &mut R,
        key: &MifareKey,
    ) -> Result<Option<(NfcTag, DumpStats)>> {
        let Some(uid) = reader.poll_iso14443a()? else {
            log::warn!("Dump aborted: no ISO14443A tag in range");
            return Ok(None);
        };
        let mut tag = NfcTag::mifare(&uid);
        log::info!(
            "Found {} tag, UID length {}",
            tag.family(),
            uid.len()
        );

        let stats = match tag.family() {
            TagFamily::MifareClassic => {
                self.run_units(tag.unit_count(), |i| {
                    self.classic_unit(reader, &mut tag, &uid, i, key)
                })?
            }
            _ => self.run_units(tag.unit_count(), |i| self.page_unit(reader, &mut tag, i))?,
        };
        Ok(Some((tag, stats)))
    }

    /// Bounded dump for a caller-known geometry: `blocks` Classic blocks
    /// authenticated with a per-sector key array addressed as
    /// `keys[block / 4]`.
    pub fn dump_with_keys<R: NfcReader>(
        &self,
        reader: &mut R,
        blocks: usize,
        keys: &[MifareKey],
    ) -> Result<Option<(NfcTag, DumpStats)>> {
        if keys.len() * 4 < blocks {
            bail!(
                "{} sector keys cannot cover {} blocks",
                keys.len(),
                blocks
            );
        }
        let Some(uid) = reader.poll_iso14443a()? else {
            log::warn!("Dump aborted: no ISO14443A tag in range");
            return Ok(None);
        };
        let mut tag = NfcTag::mifare(&uid);
        if blocks > tag.unit_count() {
            bail!(
                "{} blocks exceed the {} geometry of {} units",
                blocks,
                tag.family(),
                tag.unit_count()
            );
        }

        let stats = self.run_units(blocks, |i| {
            self.classic_unit(reader, &mut tag, &uid, i, &keys[i / 4])
        })?;
        Ok(Some((tag, stats)))
    }

    /// Dump an NTAG21x page range (see the `NTAG*_PAGES` constants for
    /// the per-variant counts). Pages need no authentication. A present
    /// tag with a non-7-byte UID is not an NTAG21x and yields `Ok(None)`.
    pub fn dump_ntag<R: NfcReader>(
        &self,
        reader: &mut R,
        pages: usize,
    ) -> Result<Option<(NfcTag, DumpStats)>> {
        let Some(uid) = reader.poll_iso14443a()? else {
            log::warn!("Dump aborted: no ISO14443A tag in range");
            return Ok(None);
        };
        if uid.len() != 7 {
            log::warn!("Tag with UID length {} is not an NTAG21x", uid.len());
            return Ok(None);
        }
        let mut tag = NfcTag::ntag(&uid, pages);
        let stats = self.run_units(pages, |i| self.page_unit(reader, &mut tag, i))?;
        Ok(Some((tag, stats)))
    }

    /// Per-unit phase machine shared by every dump variant: visit units
    /// 0..total in order, tally outcomes, never abort on a unit failure.
    fn run_units<F>(&self, total: usize, mut step: F) -> Result<DumpStats>
    where
        F: FnMut(usize) -> Result<UnitOutcome>,
    {
        let mut stats = DumpStats::default();
        let mut phase = if total == 0 {
            DumpPhase::Done
        } else {
            DumpPhase::Unit(0)
        };
        while let DumpPhase::Unit(i) = phase {
            match step(i)? {
                UnitOutcome::Read => {}
                UnitOutcome::Unreadable => stats.unreadable += 1,
                UnitOutcome::Unauthenticated => stats.unauthenticated += 1,
            }
            phase = if i + 1 < total {
                DumpPhase::Unit(i + 1)
            } else {
                DumpPhase::Done
            };
        }
        Ok(stats)
    }

    /// One Classic block: authenticate, then read; either failure fills
    /// the slot and is recorded, and the loop moves on.
    fn classic_unit<R: NfcReader>(
        &self,
        reader: &mut R,
        tag: &mut NfcTag,
        uid: &[u8],
        index: usize,
        key: &MifareKey,
    ) -> Result<UnitOutcome> {
        if !reader.authenticate_block(uid, index as u8, key)? {
            log::warn!("Block {index}: unable to authenticate");
            tag.fill_block(index, self.fill)?;
            return Ok(UnitOutcome::Unauthenticated);
        }
        match reader.read_block(index as u8)? {
            Some(block) => {
                log::debug!("Block {index:2} {}", format_hex_spaced(&block));
                tag.set_block(index, &block)?;
                Ok(UnitOutcome::Read)
            }
            None => {
                log::warn!("Block {index}: unable to read");
                tag.fill_block(index, self.fill)?;
                Ok(UnitOutcome::Unreadable)
            }
        }
    }

    /// One Ultralight/NTAG unit: plain read, no authentication phase
    fn page_unit<R: NfcReader>(
        &self,
        reader: &mut R,
        tag: &mut NfcTag,
        index: usize,
    ) -> Result<UnitOutcome> {
        let data = if tag.family() == TagFamily::Ntag21x {
            reader.read_page(index as u8)?.map(|p| p.to_vec())
        } else {
            reader.read_block(index as u8)?.map(|b| b.to_vec())
        };
        match data {
            Some(unit) => {
                log::debug!("Unit {index:2} {}", format_hex_spaced(&unit));
                tag.set_block(index, &unit)?;
                Ok(UnitOutcome::Read)
            }
            None => {
                log::warn!("Unit {index}: unable to read");
                tag.fill_block(index, self.fill)?;
                Ok(UnitOutcome::Unreadable)
            }
        }
    }
}

impl Default for TagDumper {
    fn default() -> Self {
        Self::new()
    }
}

/// Metadata saved next to a raw dump image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpReport {
    pub timestamp: DateTime<Utc>,
    pub family: TagFamily,
    pub uid: String,
    pub unit_size: usize,
    pub unit_count: usize,
    pub stats: DumpStats,
    /// Sparse FeliCa blocks (block number to hex payload); absent for the
    /// dense families, whose image goes to the `.bin` file instead
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocks: Option<BTreeMap<u16, String>>,
}

impl DumpReport {
    pub fn new(tag: &NfcTag, stats: DumpStats) -> Self {
        Self {
            timestamp: Utc::now(),
            family: tag.family(),
            uid: hex::encode_upper(tag.uid()),
            unit_size: tag.unit_size(),
            unit_count: tag.unit_count(),
            stats,
            blocks: tag.sparse_blocks().map(|map| {
                map.iter()
                    .map(|(pos, block)| (*pos, hex::encode_upper(block)))
                    .collect()
            }),
        }
    }
}

/// Persist a dump: `<path>.bin` holds the raw image (dense families only)
/// and `<path>.json` the report.
pub fn save_dump(tag: &NfcTag, stats: DumpStats, path: &Path) -> Result<()> {
    let report = DumpReport::new(tag, stats);

    if let Some(image) = tag.data() {
        let bin_path = path.with_extension("bin");
        fs::write(&bin_path, image)
            .with_context(|| format!("Failed to write image to {}", bin_path.display()))?;
        log::info!("Wrote {} bytes to {}", image.len(), bin_path.display());
    }

    let json_path = path.with_extension("json");
    let json = serde_json::to_string_pretty(&report).context("Failed to serialize dump report")?;
    fs::write(&json_path, json)
        .with_context(|| format!("Failed to write report to {}", json_path.display()))?;
    log::info!("Wrote report to {}", json_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::reader::{KeyType, MockNfcReader};
    use crate::core::tag::{BLOCK_SIZE, MIFARE_CLASSIC_BLOCKS, MIFARE_ULTRALIGHT_BLOCKS};

    const CLASSIC_UID: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];
    const ULTRALIGHT_UID: [u8; 7] = [1, 2, 3, 4, 5, 6, 7];

    #[test]
    fn test_dump_absent_tag_returns_none() {
        let mut reader = MockNfcReader::new();
        reader.expect_poll_iso14443a().returning(|| Ok(None));

        let dumper = TagDumper::new();
        assert!(dumper
            .dump_tag(&mut reader, &MifareKey::FACTORY)
            .unwrap()
            .is_none());
        assert!(dumper.dump_ntag(&mut reader, 45).unwrap().is_none());
    }

    #[test]
    fn test_classic_dump_counts_sum_to_block_count() {
        // Sector 0 key wrong, sectors 1-15 correct and readable
        let mut reader = MockNfcReader::new();
        reader
            .expect_poll_iso14443a()
            .returning(|| Ok(Some(CLASSIC_UID.to_vec())));
        reader
            .expect_authenticate_block()
            .returning(|_, block, _| Ok(block / 4 != 0));
        reader
            .expect_read_block()
            .returning(|block| Ok(Some([block; BLOCK_SIZE])));

        let dumper = TagDumper::new();
        let (tag, stats) = dumper
            .dump_tag(&mut reader, &MifareKey::FACTORY)
            .unwrap()
            .unwrap();

        assert_eq!(stats.unauthenticated, 4);
        assert_eq!(stats.unreadable, 0);
        let successes = MIFARE_CLASSIC_BLOCKS as u32 - stats.unauthenticated - stats.unreadable;
        assert_eq!(successes, 60);

        // Sector 0 slots carry the fill byte, later sectors real data
        let mut buf = [0u8; BLOCK_SIZE];
        tag.get_block(0, &mut buf).unwrap();
        assert_eq!(buf, [FAILED_UNIT_FILL; BLOCK_SIZE]);
        tag.get_block(4, &mut buf).unwrap();
        assert_eq!(buf, [4; BLOCK_SIZE]);
    }

    #[test]
    fn test_classic_read_failures_counted_separately() {
        let mut reader = MockNfcReader::new();
        reader
            .expect_poll_iso14443a()
            .returning(|| Ok(Some(CLASSIC_UID.to_vec())));
        reader.expect_authenticate_block().returning(|_, _, _| Ok(true));
        reader
            .expect_read_block()
            .returning(|block| Ok(if block == 7 { None } else { Some([0x5A; BLOCK_SIZE]) }));

        let dumper = TagDumper::new();
        let (tag, stats) = dumper
            .dump_tag(&mut reader, &MifareKey::FACTORY)
            .unwrap()
            .unwrap();

        assert_eq!(stats.unreadable, 1);
        assert_eq!(stats.unauthenticated, 0);

        let mut buf = [0u8; BLOCK_SIZE];
        tag.get_block(7, &mut buf).unwrap();
        assert_eq!(buf, [FAILED_UNIT_FILL; BLOCK_SIZE]);
    }

    #[test]
    fn test_ultralight_dump_skips_authentication() {
        // Page 5 fails once; authenticate_block must never be called
        let mut reader = MockNfcReader::new();
        reader
            .expect_poll_iso14443a()
            .returning(|| Ok(Some(ULTRALIGHT_UID.to_vec())));
        reader
            .expect_read_block()
            .times(MIFARE_ULTRALIGHT_BLOCKS)
            .returning(|block| Ok(if block == 5 { None } else { Some([block; BLOCK_SIZE]) }));

        let dumper = TagDumper::new();
        let (tag, stats) = dumper
            .dump_tag(&mut reader, &MifareKey::FACTORY)
            .unwrap()
            .unwrap();

        assert_eq!(stats.unreadable, 1);
        assert_eq!(stats.unauthenticated, 0);
        let successes = MIFARE_ULTRALIGHT_BLOCKS as u32 - stats.unreadable;
        assert_eq!(successes, 15);

        let mut buf = [0u8; BLOCK_SIZE];
        tag.get_block(5, &mut buf).unwrap();
        assert_eq!(buf, [FAILED_UNIT_FILL; BLOCK_SIZE]);
        tag.get_block(6, &mut buf).unwrap();
        assert_eq!(buf, [6; BLOCK_SIZE]);
    }

    #[test]
    fn test_dump_with_keys_addresses_sector_keys() {
        let keys: Vec<MifareKey> = (0..4)
            .map(|sector| MifareKey::key_a([sector as u8; 6]))
            .collect();

        let mut reader = MockNfcReader::new();
        reader
            .expect_poll_iso14443a()
            .returning(|| Ok(Some(CLASSIC_UID.to_vec())));
        // Each block must be authenticated with its sector's key
        reader
            .expect_authenticate_block()
            .withf(|_, block, key| key.bytes == [(block / 4); 6])
            .times(16)
            .returning(|_, _, _| Ok(true));
        reader
            .expect_read_block()
            .returning(|_| Ok(Some([0u8; BLOCK_SIZE])));

        let dumper = TagDumper::new();
        let (_, stats) = dumper
            .dump_with_keys(&mut reader, 16, &keys)
            .unwrap()
            .unwrap();
        assert_eq!(stats, DumpStats::default());
    }

    #[test]
    fn test_zero_geometry_dump_touches_no_units() {
        // Beyond the poll, any reader call would panic the mock
        let mut reader = MockNfcReader::new();
        reader
            .expect_poll_iso14443a()
            .returning(|| Ok(Some(CLASSIC_UID.to_vec())));

        let dumper = TagDumper::new();
        let (_, stats) = dumper.dump_with_keys(&mut reader, 0, &[]).unwrap().unwrap();
        assert_eq!(stats, DumpStats::default());

        let mut reader = MockNfcReader::new();
        reader
            .expect_poll_iso14443a()
            .returning(|| Ok(Some(ULTRALIGHT_UID.to_vec())));
        let (tag, stats) = dumper.dump_ntag(&mut reader, 0).unwrap().unwrap();
        assert_eq!(stats, DumpStats::default());
        assert_eq!(tag.unit_count(), 0);
    }

    #[test]
    fn test_dump_with_keys_rejects_short_key_array() {
        let mut reader = MockNfcReader::new();
        let dumper = TagDumper::new();
        let keys = [MifareKey::FACTORY];
        assert!(dumper.dump_with_keys(&mut reader, 16, &keys).is_err());
    }

    #[test]
    fn test_dump_ntag_rejects_short_uid() {
        let mut reader = MockNfcReader::new();
        reader
            .expect_poll_iso14443a()
            .returning(|| Ok(Some(CLASSIC_UID.to_vec())));

        let dumper = TagDumper::new();
        assert!(dumper.dump_ntag(&mut reader, 45).unwrap().is_none());
    }

    #[test]
    fn test_dump_ntag_pages() {
        let mut reader = MockNfcReader::new();
        reader
            .expect_poll_iso14443a()
            .returning(|| Ok(Some(ULTRALIGHT_UID.to_vec())));
        reader
            .expect_read_page()
            .times(45)
            .returning(|page| Ok(Some([page, 0, 0, page])));

        let dumper = TagDumper::new();
        let (tag, stats) = dumper.dump_ntag(&mut reader, 45).unwrap().unwrap();

        assert_eq!(stats, DumpStats::default());
        assert_eq!(tag.unit_count(), 45);
        let mut buf = [0u8; 4];
        tag.get_block(44, &mut buf).unwrap();
        assert_eq!(buf, [44, 0, 0, 44]);
    }

    #[test]
    fn test_custom_fill_applies_to_both_failure_paths() {
        let mut reader = MockNfcReader::new();
        reader
            .expect_poll_iso14443a()
            .returning(|| Ok(Some(CLASSIC_UID.to_vec())));
        // Block 0 fails auth, block 1 fails the read
        reader
            .expect_authenticate_block()
            .returning(|_, block, _| Ok(block != 0));
        reader
            .expect_read_block()
            .returning(|block| Ok(if block == 1 { None } else { Some([0x11; BLOCK_SIZE]) }));

        let dumper = TagDumper::with_fill(0xFF);
        let (tag, stats) = dumper
            .dump_tag(&mut reader, &MifareKey::FACTORY)
            .unwrap()
            .unwrap();
        assert_eq!(stats.unauthenticated, 1);
        assert_eq!(stats.unreadable, 1);

        let mut buf = [0u8; BLOCK_SIZE];
        tag.get_block(0, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; BLOCK_SIZE]);
        tag.get_block(1, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; BLOCK_SIZE]);
    }

    #[test]
    fn test_key_type_passed_through() {
        let mut reader = MockNfcReader::new();
        reader
            .expect_poll_iso14443a()
            .returning(|| Ok(Some(CLASSIC_UID.to_vec())));
        reader
            .expect_authenticate_block()
            .withf(|_, _, key| key.key_type == KeyType::B)
            .returning(|_, _, _| Ok(true));
        reader
            .expect_read_block()
            .returning(|_| Ok(Some([0u8; BLOCK_SIZE])));

        let dumper = TagDumper::new();
        let key = MifareKey::key_b([0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5]);
        let (_, stats) = dumper.dump_tag(&mut reader, &key).unwrap().unwrap();
        assert_eq!(stats, DumpStats::default());
    }
}
