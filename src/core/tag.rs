use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::core::felica::SystemCode;

/// Mifare Classic/Ultralight block size in bytes
pub const BLOCK_SIZE: usize = 16;
/// Block count of a Mifare Classic 1K tag
pub const MIFARE_CLASSIC_BLOCKS: usize = 64;
/// Block count of a Mifare Ultralight tag
pub const MIFARE_ULTRALIGHT_BLOCKS: usize = 16;
/// NTAG21x page size in bytes
pub const NTAG_PAGE_SIZE: usize = 4;
/// FeliCa block size in bytes
pub const FELICA_BLOCK_SIZE: usize = 16;

// NTAG21x page counts per variant
pub const NTAG203_PAGES: usize = 42;
pub const NTAG213_PAGES: usize = 45;
pub const NTAG215_PAGES: usize = 135;
pub const NTAG216_PAGES: usize = 231;

/// Tag family a memory model belongs to.
///
/// The family is fixed by the constructor used to build the [`NfcTag`] and
/// never re-derived from the stored data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagFamily {
    MifareClassic,
    MifareUltralight,
    Ntag21x,
    Felica,
}

impl TagFamily {
    /// Classify an ISO14443A tag from its UID length: anything longer than
    /// 4 bytes is Ultralight, otherwise Classic. NTAG21x and FeliCa share
    /// UID-length signatures with these families and must be constructed
    /// explicitly instead.
    pub fn from_uid_len(len: usize) -> Self {
        if len > 4 {
            TagFamily::MifareUltralight
        } else {
            TagFamily::MifareClassic
        }
    }
}

impl std::fmt::Display for TagFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TagFamily::MifareClassic => "Mifare Classic",
            TagFamily::MifareUltralight => "Mifare Ultralight",
            TagFamily::Ntag21x => "NTAG21x",
            TagFamily::Felica => "FeliCa",
        };
        write!(f, "{name}")
    }
}

/// Errors from block-level access to a tag memory model
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TagError {
    #[error("unit index {index} out of range (tag has {count} units)")]
    IndexOutOfRange { index: usize, count: usize },
    #[error("buffer is {got} bytes but the tag unit is {want} bytes")]
    UnitSize { got: usize, want: usize },
    #[error("block {0} is not present in the sparse image")]
    MissingBlock(u16),
}

/// Storage strategy, selected by family: Classic/Ultralight/NTAG memory is
/// linear and dumped whole, FeliCa blocks are service-scoped and sparse.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TagStorage {
    Dense(Vec<u8>),
    Sparse(BTreeMap<u16, [u8; FELICA_BLOCK_SIZE]>),
}

/// Unified in-memory image of one physical tag.
///
/// Constructed once per detected tag, populated progressively by the dump
/// or write paths, and discarded once the caller is done with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfcTag {
    family: TagFamily,
    uid: Vec<u8>,
    storage: TagStorage,
    unit_size: usize,
    unit_count: usize,
    // FeliCa identity; zeroed for the ISO14443A families
    pmm: [u8; 8],
    system_code: u16,
}

impl NfcTag {
    /// Build a Classic or Ultralight model from a polled UID, classifying
    /// by UID length. Storage starts zero-filled.
    pub fn mifare(uid: &[u8]) -> Self {
        let family = TagFamily::from_uid_len(uid.len());
        let unit_count = match family {
            TagFamily::MifareUltralight => MIFARE_ULTRALIGHT_BLOCKS,
            _ => MIFARE_CLASSIC_BLOCKS,
        };
        Self {
            family,
            uid: uid.to_vec(),
            storage: TagStorage::Dense(vec![0; BLOCK_SIZE * unit_count]),
            unit_size: BLOCK_SIZE,
            unit_count,
            pmm: [0; 8],
            system_code: 0,
        }
    }

    /// Build an NTAG21x model with a caller-supplied page count
    /// (see the `NTAG*_PAGES` constants). Overrides the UID-length
    /// heuristic.
    pub fn ntag(uid: &[u8], pages: usize) -> Self {
        Self {
            family: TagFamily::Ntag21x,
            uid: uid.to_vec(),
            storage: TagStorage::Dense(vec![0; NTAG_PAGE_SIZE * pages]),
            unit_size: NTAG_PAGE_SIZE,
            unit_count: pages,
            pmm: [0; 8],
            system_code: 0,
        }
    }

    /// Build a FeliCa model from polled identity. Blocks are stored
    /// sparsely: FeliCa memory is non-linear and typical sessions touch
    /// only a handful of blocks.
    pub fn felica(idm: [u8; 8], pmm: [u8; 8], system_code: u16) -> Self {
        Self {
            family: TagFamily::Felica,
            uid: idm.to_vec(),
            storage: TagStorage::Sparse(BTreeMap::new()),
            unit_size: FELICA_BLOCK_SIZE,
            unit_count: 0,
            pmm,
            system_code,
        }
    }

    pub fn family(&self) -> TagFamily {
        self.family
    }

    /// Tag UID (4 or 7 bytes), or the 8-byte IDm for FeliCa
    pub fn uid(&self) -> &[u8] {
        &self.uid
    }

    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    /// Number of addressable units; for FeliCa this is the number of
    /// sparse blocks currently stored.
    pub fn unit_count(&self) -> usize {
        match &self.storage {
            TagStorage::Dense(_) => self.unit_count,
            TagStorage::Sparse(map) => map.len(),
        }
    }

    /// Contiguous image for the dense families, `None` for FeliCa
    pub fn data(&self) -> Option<&[u8]> {
        match &self.storage {
            TagStorage::Dense(buf) => Some(buf),
            TagStorage::Sparse(_) => None,
        }
    }

    /// Sparse FeliCa block map, `None` for the dense families
    pub fn sparse_blocks(&self) -> Option<&BTreeMap<u16, [u8; FELICA_BLOCK_SIZE]>> {
        match &self.storage {
            TagStorage::Sparse(map) => Some(map),
            TagStorage::Dense(_) => None,
        }
    }

    /// Copy one unit into `out`. `out` must be exactly `unit_size` bytes
    /// and `index` must be in range.
    pub fn get_block(&self, index: usize, out: &mut [u8]) -> Result<(), TagError> {
        if out.len() != self.unit_size {
            return Err(TagError::UnitSize {
                got: out.len(),
                want: self.unit_size,
            });
        }
        match &self.storage {
            TagStorage::Dense(buf) => {
                if index >= self.unit_count {
                    return Err(TagError::IndexOutOfRange {
                        index,
                        count: self.unit_count,
                    });
                }
                let start = index * self.unit_size;
                out.copy_from_slice(&buf[start..start + self.unit_size]);
                Ok(())
            }
            TagStorage::Sparse(map) => {
                let pos = u16::try_from(index).map_err(|_| TagError::MissingBlock(u16::MAX))?;
                let block = map.get(&pos).ok_or(TagError::MissingBlock(pos))?;
                out.copy_from_slice(block);
                Ok(())
            }
        }
    }

    /// Overwrite one unit of a dense image; used while populating a dump.
    pub fn set_block(&mut self, index: usize, data: &[u8]) -> Result<(), TagError> {
        if data.len() != self.unit_size {
            return Err(TagError::UnitSize {
                got: data.len(),
                want: self.unit_size,
            });
        }
        match &mut self.storage {
            TagStorage::Dense(buf) => {
                if index >= self.unit_count {
                    return Err(TagError::IndexOutOfRange {
                        index,
                        count: self.unit_count,
                    });
                }
                let start = index * self.unit_size;
                buf[start..start + self.unit_size].copy_from_slice(data);
                Ok(())
            }
            TagStorage::Sparse(map) => {
                let pos = u16::try_from(index).map_err(|_| TagError::MissingBlock(u16::MAX))?;
                let mut block = [0u8; FELICA_BLOCK_SIZE];
                block.copy_from_slice(data);
                map.insert(pos, block);
                Ok(())
            }
        }
    }

    /// Fill one unit of a dense image with a sentinel byte; the dump path
    /// uses this to mark units it could not authenticate or read.
    pub fn fill_block(&mut self, index: usize, value: u8) -> Result<(), TagError> {
        match &mut self.storage {
            TagStorage::Dense(buf) => {
                if index >= self.unit_count {
                    return Err(TagError::IndexOutOfRange {
                        index,
                        count: self.unit_count,
                    });
                }
                let start = index * self.unit_size;
                buf[start..start + self.unit_size].fill(value);
                Ok(())
            }
            TagStorage::Sparse(_) => Ok(()),
        }
    }

    /// Insert or overwrite one sparse FeliCa block. No-op for the dense
    /// families, whose geometry is fixed at construction.
    pub fn add_block(&mut self, pos: u16, data: [u8; FELICA_BLOCK_SIZE]) {
        if let TagStorage::Sparse(map) = &mut self.storage {
            map.insert(pos, data);
        }
    }

    /// Block check character, stored at a fixed offset of the Classic
    /// manufacturer block. Zero for every other family.
    pub fn bcc(&self) -> u8 {
        match (&self.storage, self.family) {
            (TagStorage::Dense(buf), TagFamily::MifareClassic) => buf[5],
            _ => 0,
        }
    }

    /// SAK byte from the manufacturer block; offset depends on UID layout.
    /// Zero when the image is too short to hold it.
    pub fn sak(&self) -> u8 {
        match (&self.storage, self.family) {
            (TagStorage::Dense(buf), TagFamily::MifareClassic) => buf[6],
            (TagStorage::Dense(buf), _) if buf.len() > 8 => buf[8],
            _ => 0,
        }
    }

    /// ATQA bytes from the manufacturer block; offset depends on UID layout.
    /// Zeroed when the image is too short to hold them.
    pub fn atqa(&self) -> [u8; 2] {
        match (&self.storage, self.family) {
            (TagStorage::Dense(buf), TagFamily::MifareClassic) => [buf[7], buf[8]],
            (TagStorage::Dense(buf), _) if buf.len() > 10 => [buf[9], buf[10]],
            _ => [0, 0],
        }
    }

    /// FeliCa manufacturer parameters; zeroed for the ISO14443A families
    pub fn pmm(&self) -> &[u8; 8] {
        &self.pmm
    }

    /// Raw FeliCa system code as returned by polling
    pub fn raw_sys_code(&self) -> u16 {
        self.system_code
    }

    /// Classified FeliCa system code. Returns [`SystemCode::Invalid`] for
    /// unknown codes and for non-FeliCa models; callers treat it as
    /// "unclassified", not as an error.
    pub fn sys_code(&self) -> SystemCode {
        match self.family {
            TagFamily::Felica => SystemCode::from_raw(self.system_code),
            _ => SystemCode::Invalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_length_classification() {
        assert_eq!(TagFamily::from_uid_len(4), TagFamily::MifareClassic);
        assert_eq!(TagFamily::from_uid_len(3), TagFamily::MifareClassic);
        assert_eq!(TagFamily::from_uid_len(5), TagFamily::MifareUltralight);
        assert_eq!(TagFamily::from_uid_len(7), TagFamily::MifareUltralight);
    }

    #[test]
    fn test_mifare_constructor_geometry() {
        let classic = NfcTag::mifare(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(classic.family(), TagFamily::MifareClassic);
        assert_eq!(classic.unit_size(), BLOCK_SIZE);
        assert_eq!(classic.unit_count(), MIFARE_CLASSIC_BLOCKS);
        assert_eq!(classic.data().unwrap().len(), 1024);

        let ultralight = NfcTag::mifare(&[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(ultralight.family(), TagFamily::MifareUltralight);
        assert_eq!(ultralight.unit_count(), MIFARE_ULTRALIGHT_BLOCKS);
        assert_eq!(ultralight.data().unwrap().len(), 256);
    }

    #[test]
    fn test_explicit_constructors_override_heuristic() {
        // 7-byte UID would classify as Ultralight; the NTAG constructor wins
        let ntag = NfcTag::ntag(&[1, 2, 3, 4, 5, 6, 7], NTAG213_PAGES);
        assert_eq!(ntag.family(), TagFamily::Ntag21x);
        assert_eq!(ntag.unit_size(), NTAG_PAGE_SIZE);
        assert_eq!(ntag.unit_count(), NTAG213_PAGES);

        let felica = NfcTag::felica([1, 2, 3, 4, 5, 6, 7, 8], [9; 8], 0x12FC);
        assert_eq!(felica.family(), TagFamily::Felica);
        assert_eq!(felica.uid(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(felica.pmm(), &[9; 8]);
    }

    #[test]
    fn test_get_block_is_idempotent() {
        let mut tag = NfcTag::mifare(&[1, 2, 3, 4]);
        tag.set_block(3, &[0xAB; BLOCK_SIZE]).unwrap();

        let mut first = [0u8; BLOCK_SIZE];
        let mut second = [0u8; BLOCK_SIZE];
        tag.get_block(3, &mut first).unwrap();
        tag.get_block(3, &mut second).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, [0xAB; BLOCK_SIZE]);
    }

    #[test]
    fn test_get_block_checked_errors() {
        let tag = NfcTag::mifare(&[1, 2, 3, 4]);
        let mut buf = [0u8; BLOCK_SIZE];
        assert_eq!(
            tag.get_block(MIFARE_CLASSIC_BLOCKS, &mut buf),
            Err(TagError::IndexOutOfRange {
                index: 64,
                count: 64
            })
        );

        let mut short = [0u8; 4];
        assert_eq!(
            tag.get_block(0, &mut short),
            Err(TagError::UnitSize { got: 4, want: 16 })
        );
    }

    #[test]
    fn test_add_block_sparse_overwrites() {
        let mut tag = NfcTag::felica([0; 8], [0; 8], 0x12FC);
        tag.add_block(9, [0x11; FELICA_BLOCK_SIZE]);
        tag.add_block(9, [0x22; FELICA_BLOCK_SIZE]);
        assert_eq!(tag.unit_count(), 1);

        let mut buf = [0u8; FELICA_BLOCK_SIZE];
        tag.get_block(9, &mut buf).unwrap();
        assert_eq!(buf, [0x22; FELICA_BLOCK_SIZE]);

        assert_eq!(
            tag.get_block(10, &mut buf),
            Err(TagError::MissingBlock(10))
        );
    }

    #[test]
    fn test_add_block_is_noop_for_dense_families() {
        let mut tag = NfcTag::mifare(&[1, 2, 3, 4]);
        tag.add_block(0, [0xFF; FELICA_BLOCK_SIZE]);
        // Dense storage is untouched
        assert!(tag.data().unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_sys_code_classification() {
        let ndef = NfcTag::felica([0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08], [0; 8], 0x12FC);
        assert_eq!(ndef.sys_code(), SystemCode::Ndef);

        let unknown = NfcTag::felica([0; 8], [0; 8], 0x9999);
        assert_eq!(unknown.sys_code(), SystemCode::Invalid);

        // Wrong-family lookup yields the sentinel, never an error
        let classic = NfcTag::mifare(&[1, 2, 3, 4]);
        assert_eq!(classic.sys_code(), SystemCode::Invalid);
    }

    #[test]
    fn test_identity_bytes_on_short_image() {
        // A 2-page NTAG image is 8 bytes, shorter than the SAK/ATQA offsets
        let tag = NfcTag::ntag(&[1, 2, 3, 4, 5, 6, 7], 2);
        assert_eq!(tag.bcc(), 0);
        assert_eq!(tag.sak(), 0);
        assert_eq!(tag.atqa(), [0, 0]);
    }

    #[test]
    fn test_identity_byte_offsets() {
        let mut classic = NfcTag::mifare(&[1, 2, 3, 4]);
        let mut block0 = [0u8; BLOCK_SIZE];
        block0[5] = 0xB1;
        block0[6] = 0x08;
        block0[7] = 0x04;
        block0[8] = 0x00;
        classic.set_block(0, &block0).unwrap();
        assert_eq!(classic.bcc(), 0xB1);
        assert_eq!(classic.sak(), 0x08);
        assert_eq!(classic.atqa(), [0x04, 0x00]);

        let mut ultralight = NfcTag::mifare(&[1, 2, 3, 4, 5, 6, 7]);
        let mut block0 = [0u8; BLOCK_SIZE];
        block0[8] = 0x00;
        block0[9] = 0x44;
        block0[10] = 0x00;
        ultralight.set_block(0, &block0).unwrap();
        assert_eq!(ultralight.bcc(), 0);
        assert_eq!(ultralight.sak(), 0x00);
        assert_eq!(ultralight.atqa(), [0x44, 0x00]);

        let felica = NfcTag::felica([0; 8], [0; 8], 0x12FC);
        assert_eq!(felica.bcc(), 0);
        assert_eq!(felica.sak(), 0);
        assert_eq!(felica.atqa(), [0, 0]);
    }
}
