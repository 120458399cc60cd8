use anyhow::Result;

use crate::core::reader::{MifareKey, NfcReader};
use crate::core::tag::{BLOCK_SIZE, NTAG_PAGE_SIZE};
use crate::core::utils::format_hex_spaced;

/// Write one Mifare Classic block: poll, authenticate the target block
/// with the supplied key, then write.
///
/// Every failing step (no card, rejected key, rejected write) yields
/// `Ok(false)`; no retries and no verification read-back happen here, so
/// retry policy stays with the caller. On success the addressed block on
/// the physical tag is overwritten.
pub fn write_block<R: NfcReader>(
    reader: &mut R,
    block: u8,
    data: &[u8; BLOCK_SIZE],
    key: &MifareKey,
) -> Result<bool> {
    let Some(uid) = reader.poll_iso14443a()? else {
        log::warn!("Write aborted: no ISO14443A tag in range");
        return Ok(false);
    };
    if !reader.authenticate_block(&uid, block, key)? {
        log::warn!("Block {block}: unable to authenticate for write");
        return Ok(false);
    }
    log::debug!("Writing block {block}: {}", format_hex_spaced(data));
    let written = reader.write_block(block, data)?;
    if !written {
        log::warn!("Block {block}: write rejected by the card");
    }
    Ok(written)
}

/// Write one NTAG21x page. NTAG21x has no sector keys, so there is no
/// authentication step; a present tag with a non-7-byte UID is not an
/// NTAG21x and the write is refused.
pub fn write_page<R: NfcReader>(
    reader: &mut R,
    page: u8,
    data: &[u8; NTAG_PAGE_SIZE],
) -> Result<bool> {
    let Some(uid) = reader.poll_iso14443a()? else {
        log::warn!("Write aborted: no ISO14443A tag in range");
        return Ok(false);
    };
    if uid.len() != 7 {
        log::warn!("Tag with UID length {} is not an NTAG21x", uid.len());
        return Ok(false);
    }
    log::debug!("Writing page {page}: {}", format_hex_spaced(data));
    let written = reader.write_page(page, data)?;
    if !written {
        log::warn!("Page {page}: write rejected by the card");
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::reader::MockNfcReader;

    const CLASSIC_UID: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];
    const NTAG_UID: [u8; 7] = [1, 2, 3, 4, 5, 6, 7];

    #[test]
    fn test_write_block_success() {
        let mut reader = MockNfcReader::new();
        reader
            .expect_poll_iso14443a()
            .returning(|| Ok(Some(CLASSIC_UID.to_vec())));
        // The target block is authenticated, not block 0
        reader
            .expect_authenticate_block()
            .withf(|uid, block, _| uid == CLASSIC_UID && *block == 9)
            .times(1)
            .returning(|_, _, _| Ok(true));
        reader
            .expect_write_block()
            .withf(|block, data| *block == 9 && *data == [0x42; BLOCK_SIZE])
            .times(1)
            .returning(|_, _| Ok(true));

        let ok = write_block(&mut reader, 9, &[0x42; BLOCK_SIZE], &MifareKey::FACTORY).unwrap();
        assert!(ok);
    }

    #[test]
    fn test_write_block_absent_tag() {
        let mut reader = MockNfcReader::new();
        reader.expect_poll_iso14443a().returning(|| Ok(None));

        let ok = write_block(&mut reader, 4, &[0u8; BLOCK_SIZE], &MifareKey::FACTORY).unwrap();
        assert!(!ok);
    }

    #[test]
    fn test_write_block_auth_failure_skips_write() {
        // No expect_write_block: a write attempt would panic the mock
        let mut reader = MockNfcReader::new();
        reader
            .expect_poll_iso14443a()
            .returning(|| Ok(Some(CLASSIC_UID.to_vec())));
        reader
            .expect_authenticate_block()
            .returning(|_, _, _| Ok(false));

        let ok = write_block(&mut reader, 4, &[0u8; BLOCK_SIZE], &MifareKey::FACTORY).unwrap();
        assert!(!ok);
    }

    #[test]
    fn test_write_block_rejected() {
        let mut reader = MockNfcReader::new();
        reader
            .expect_poll_iso14443a()
            .returning(|| Ok(Some(CLASSIC_UID.to_vec())));
        reader
            .expect_authenticate_block()
            .returning(|_, _, _| Ok(true));
        reader.expect_write_block().returning(|_, _| Ok(false));

        let ok = write_block(&mut reader, 4, &[0u8; BLOCK_SIZE], &MifareKey::FACTORY).unwrap();
        assert!(!ok);
    }

    #[test]
    fn test_write_page_success_without_auth() {
        let mut reader = MockNfcReader::new();
        reader
            .expect_poll_iso14443a()
            .returning(|| Ok(Some(NTAG_UID.to_vec())));
        reader
            .expect_write_page()
            .withf(|page, data| *page == 6 && *data == [1, 2, 3, 4])
            .times(1)
            .returning(|_, _| Ok(true));

        let ok = write_page(&mut reader, 6, &[1, 2, 3, 4]).unwrap();
        assert!(ok);
    }

    #[test]
    fn test_write_page_refuses_non_ntag_uid() {
        let mut reader = MockNfcReader::new();
        reader
            .expect_poll_iso14443a()
            .returning(|| Ok(Some(CLASSIC_UID.to_vec())));

        let ok = write_page(&mut reader, 6, &[1, 2, 3, 4]).unwrap();
        assert!(!ok);
    }
}
