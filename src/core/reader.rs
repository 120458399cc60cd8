use pcsc::{Card, Context, Protocols, Scope, ShareMode};
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use thiserror::Error;

use crate::core::tag::{BLOCK_SIZE, FELICA_BLOCK_SIZE, NTAG_PAGE_SIZE};
use crate::core::utils::format_hex;

/// Mifare Classic key length in bytes
pub const MIFARE_KEY_SIZE: usize = 6;

/// Mifare Classic key slot (key A or key B)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    A,
    B,
}

/// One sector key. Supplied by the caller per authenticate call and never
/// retained by this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MifareKey {
    pub key_type: KeyType,
    pub bytes: [u8; MIFARE_KEY_SIZE],
}

impl MifareKey {
    /// Transport factory key (all 0xFF, key A)
    pub const FACTORY: MifareKey = MifareKey {
        key_type: KeyType::A,
        bytes: [0xFF; MIFARE_KEY_SIZE],
    };

    pub fn key_a(bytes: [u8; MIFARE_KEY_SIZE]) -> Self {
        Self {
            key_type: KeyType::A,
            bytes,
        }
    }

    pub fn key_b(bytes: [u8; MIFARE_KEY_SIZE]) -> Self {
        Self {
            key_type: KeyType::B,
            bytes,
        }
    }
}

/// Result of a FeliCa poll: card identity plus the requested system code
/// when the request code asked for one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FelicaTarget {
    pub idm: [u8; 8],
    pub pmm: [u8; 8],
    pub system_code: Option<u16>,
}

/// Transport-level reader failure. Per-operation rejections (wrong key,
/// unreadable block) are reported through the `Option`/`bool` returns of
/// [`NfcReader`] instead; an error here aborts the whole operation.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("PCSC transport error: {0}")]
    Transport(#[from] pcsc::Error),
    #[error("not connected to a reader")]
    NotConnected,
    #[error("reader response too short ({0} bytes)")]
    ShortResponse(usize),
    #[error("reader rejected command with status {sw1:02X} {sw2:02X}")]
    Status { sw1: u8, sw2: u8 },
}

/// Narrow surface the orchestration layer consumes from the reader driver.
///
/// All calls block until the hardware answers or times out; the reader is
/// a single exclusive resource and callers must serialize access.
#[cfg_attr(test, mockall::automock)]
pub trait NfcReader {
    /// Wait for an ISO14443A target. `Ok(None)` means nothing answered
    /// the poll window.
    fn poll_iso14443a(&mut self) -> Result<Option<Vec<u8>>, ReaderError>;

    /// Poll for a FeliCa target with the given system code and request
    /// code. `Ok(None)` means no tag in range or system-code mismatch.
    fn poll_felica(
        &mut self,
        system_code: u16,
        request_code: u8,
    ) -> Result<Option<FelicaTarget>, ReaderError>;

    /// Authenticate one Mifare Classic block. `Ok(false)` is a wrong key
    /// or an unsupported key type and is never fatal to a dump loop.
    fn authenticate_block(
        &mut self,
        uid: &[u8],
        block: u8,
        key: &MifareKey,
    ) -> Result<bool, ReaderError>;

    /// Read one 16-byte block; `Ok(None)` when the card rejects the read.
    fn read_block(&mut self, block: u8) -> Result<Option<[u8; BLOCK_SIZE]>, ReaderError>;

    fn write_block(&mut self, block: u8, data: &[u8; BLOCK_SIZE]) -> Result<bool, ReaderError>;

    /// Read one 4-byte NTAG21x page; `Ok(None)` when the card rejects it.
    fn read_page(&mut self, page: u8) -> Result<Option<[u8; NTAG_PAGE_SIZE]>, ReaderError>;

    fn write_page(&mut self, page: u8, data: &[u8; NTAG_PAGE_SIZE]) -> Result<bool, ReaderError>;

    /// FeliCa Read Without Encryption over a service-code/block-list pair.
    /// `Ok(None)` when the card answers with a non-zero status flag.
    fn felica_read_without_encryption(
        &mut self,
        idm: &[u8; 8],
        services: &[u16],
        blocks: &[u16],
    ) -> Result<Option<Vec<[u8; FELICA_BLOCK_SIZE]>>, ReaderError>;

    /// FeliCa Write Without Encryption; `Ok(false)` on a non-zero status
    /// flag from the card.
    fn felica_write_without_encryption(
        &mut self,
        idm: &[u8; 8],
        services: &[u16],
        blocks: &[u16],
        data: &[[u8; FELICA_BLOCK_SIZE]],
    ) -> Result<bool, ReaderError>;
}

/// Information about a PCSC reader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderInfo {
    pub name: String,
    pub has_card: bool,
    pub atr: Option<Vec<u8>>,
}

/// PC/SC-backed NFC reader (ACR122-style contactless readers).
///
/// Tag operations are issued as contactless pseudo-APDUs; FeliCa traffic
/// goes through the PN532 passthrough channel those readers expose.
pub struct PcscNfcReader {
    context: Context,
    current_reader: Option<String>,
    card: Option<Card>,
}

// ACR122 pseudo-APDU constants
const CLA_PSEUDO: u8 = 0xFF;
const INS_GET_UID: u8 = 0xCA;
const INS_LOAD_KEY: u8 = 0x82;
const INS_GENERAL_AUTH: u8 = 0x86;
const INS_READ_BINARY: u8 = 0xB0;
const INS_UPDATE_BINARY: u8 = 0xD6;
const KEY_SLOT: u8 = 0x00;
// PN532 passthrough command codes
const PN532_IN_LIST_PASSIVE_TARGET: u8 = 0x4A;
const PN532_IN_DATA_EXCHANGE: u8 = 0x40;
const PN532_BAUD_212K_FELICA: u8 = 0x01;
// FeliCa command codes
const FELICA_CMD_READ: u8 = 0x06;
const FELICA_RSP_READ: u8 = 0x07;
const FELICA_CMD_WRITE: u8 = 0x08;
const FELICA_RSP_WRITE: u8 = 0x09;

impl PcscNfcReader {
    /// Create a new reader manager with a fresh PCSC context
    pub fn new() -> Result<Self, ReaderError> {
        let context = Context::establish(Scope::User)?;
        Ok(Self {
            context,
            current_reader: None,
            card: None,
        })
    }

    /// List all available readers
    pub fn list_readers(&self) -> Result<Vec<ReaderInfo>, ReaderError> {
        let mut readers_buf = vec![0; 2048];
        let readers = self.context.list_readers(&mut readers_buf)?;

        let mut reader_infos = Vec::new();
        for reader_name in readers {
            let name = reader_name.to_string_lossy().to_string();
            let (has_card, atr) = self.reader_status(&name).unwrap_or((false, None));
            reader_infos.push(ReaderInfo {
                name,
                has_card,
                atr,
            });
        }
        Ok(reader_infos)
    }

    fn reader_status(&self, reader_name: &str) -> Result<(bool, Option<Vec<u8>>), ReaderError> {
        let reader_cstr = CString::new(reader_name).map_err(|_| pcsc::Error::UnknownReader)?;
        match self
            .context
            .connect(&reader_cstr, ShareMode::Shared, Protocols::ANY)
        {
            Ok(card) => match card.status2_owned() {
                Ok(status) => Ok((true, Some(status.atr().to_vec()))),
                Err(_) => Ok((true, None)),
            },
            Err(pcsc::Error::NoSmartcard) => Ok((false, None)),
            Err(_) => Ok((false, None)),
        }
    }

    /// Select the reader used by subsequent polls. Connection to the card
    /// itself happens lazily on the next poll.
    pub fn select_reader(&mut self, reader_name: &str) {
        log::info!("Using reader: {reader_name}");
        self.current_reader = Some(reader_name.to_string());
    }

    /// Name of the currently selected reader
    pub fn current_reader(&self) -> Option<&str> {
        self.current_reader.as_deref()
    }

    /// Drop the card handle, leaving the card in the field
    pub fn disconnect(&mut self) {
        if let Some(card) = self.card.take() {
            if card.disconnect(pcsc::Disposition::LeaveCard).is_err() {
                log::warn!("Failed to disconnect cleanly from card");
            }
        }
    }

    /// Connect to the selected reader if a card is in the field. Returns
    /// false when no card is present, which callers map to a failed poll.
    fn ensure_card(&mut self) -> Result<bool, ReaderError> {
        if self.card.is_some() {
            return Ok(true);
        }
        let name = self
            .current_reader
            .clone()
            .ok_or(ReaderError::NotConnected)?;
        let reader_cstr = CString::new(name.as_str()).map_err(|_| pcsc::Error::UnknownReader)?;
        match self
            .context
            .connect(&reader_cstr, ShareMode::Shared, Protocols::ANY)
        {
            Ok(card) => {
                log::debug!("Card detected on {name}");
                self.card = Some(card);
                Ok(true)
            }
            Err(pcsc::Error::NoSmartcard) | Err(pcsc::Error::RemovedCard) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Transmit one APDU and split off the trailing status word
    fn transmit(&mut self, apdu: &[u8]) -> Result<(Vec<u8>, u8, u8), ReaderError> {
        let card = self.card.as_ref().ok_or(ReaderError::NotConnected)?;
        log::trace!("APDU >> {}", format_hex(apdu));

        let mut response_buf = [0; pcsc::MAX_BUFFER_SIZE];
        let response = match card.transmit(apdu, &mut response_buf) {
            Ok(r) => r,
            Err(e) => {
                // A vanished card invalidates the handle; the next poll
                // will reconnect.
                self.card = None;
                return Err(e.into());
            }
        };
        log::trace!("APDU << {}", format_hex(response));

        if response.len() < 2 {
            return Err(ReaderError::ShortResponse(response.len()));
        }
        let (payload, sw) = response.split_at(response.len() - 2);
        Ok((payload.to_vec(), sw[0], sw[1]))
    }

    /// Transmit an operation APDU where SW 63 00 means "card rejected the
    /// operation" (reported as `None`) rather than a transport fault.
    fn transmit_op(&mut self, apdu: &[u8]) -> Result<Option<Vec<u8>>, ReaderError> {
        let (payload, sw1, sw2) = self.transmit(apdu)?;
        match (sw1, sw2) {
            (0x90, 0x00) => Ok(Some(payload)),
            (0x63, 0x00) => Ok(None),
            _ => Err(ReaderError::Status { sw1, sw2 }),
        }
    }

    /// Exchange a raw PN532 command through the reader's passthrough APDU
    fn pn532_exchange(&mut self, command: &[u8]) -> Result<Option<Vec<u8>>, ReaderError> {
        let mut apdu = vec![0xFF, 0x00, 0x00, 0x00, (command.len() + 1) as u8, 0xD4];
        apdu.extend_from_slice(command);
        let Some(response) = self.transmit_op(&apdu)? else {
            return Ok(None);
        };
        // Response opens with D5 <cmd+1>
        if response.len() < 2 || response[0] != 0xD5 {
            return Err(ReaderError::ShortResponse(response.len()));
        }
        Ok(Some(response[2..].to_vec()))
    }
}

impl NfcReader for PcscNfcReader {
    fn poll_iso14443a(&mut self) -> Result<Option<Vec<u8>>, ReaderError> {
        if !self.ensure_card()? {
            log::debug!("Poll: no card in field");
            return Ok(None);
        }
        let apdu = [CLA_PSEUDO, INS_GET_UID, 0x00, 0x00, 0x00];
        match self.transmit_op(&apdu) {
            Ok(Some(uid)) if !uid.is_empty() => {
                log::info!("Found ISO14443A tag, UID {}", format_hex(&uid));
                Ok(Some(uid))
            }
            Ok(_) => Ok(None),
            // Card left the field between connect and transmit
            Err(ReaderError::Transport(pcsc::Error::RemovedCard)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn poll_felica(
        &mut self,
        system_code: u16,
        request_code: u8,
    ) -> Result<Option<FelicaTarget>, ReaderError> {
        if !self.ensure_card()? {
            log::debug!("FeliCa poll: no card in field");
            return Ok(None);
        }
        let [sys_hi, sys_lo] = system_code.to_be_bytes();
        // InListPassiveTarget, one target, FeliCa 212 kbps polling frame
        let command = [
            PN532_IN_LIST_PASSIVE_TARGET,
            0x01,
            PN532_BAUD_212K_FELICA,
            0x00,
            sys_hi,
            sys_lo,
            request_code,
            0x00,
        ];
        let Some(response) = self.pn532_exchange(&command)? else {
            return Ok(None);
        };
        // NbTg, Tg, PolRes length, response code 0x01, IDm(8), PMm(8)[, RD(2)]
        if response.is_empty() || response[0] == 0 {
            log::debug!("FeliCa poll: no target answered");
            return Ok(None);
        }
        if response.len() < 20 {
            return Err(ReaderError::ShortResponse(response.len()));
        }
        let pol_len = response[2] as usize;
        let mut idm = [0u8; 8];
        let mut pmm = [0u8; 8];
        idm.copy_from_slice(&response[4..12]);
        pmm.copy_from_slice(&response[12..20]);
        let system_code = if pol_len >= 0x14 && response.len() >= 22 {
            Some(u16::from_be_bytes([response[20], response[21]]))
        } else {
            None
        };
        log::info!("Found FeliCa tag, IDm {}", format_hex(&idm));
        Ok(Some(FelicaTarget {
            idm,
            pmm,
            system_code,
        }))
    }

    fn authenticate_block(
        &mut self,
        _uid: &[u8],
        block: u8,
        key: &MifareKey,
    ) -> Result<bool, ReaderError> {
        // Key goes into a volatile reader slot first, then general
        // authenticate binds it to the block.
        let mut load = vec![CLA_PSEUDO, INS_LOAD_KEY, 0x00, KEY_SLOT, MIFARE_KEY_SIZE as u8];
        load.extend_from_slice(&key.bytes);
        if self.transmit_op(&load)?.is_none() {
            log::warn!("Reader refused key load for block {block}");
            return Ok(false);
        }

        let key_code = match key.key_type {
            KeyType::A => 0x60,
            KeyType::B => 0x61,
        };
        let auth = [
            CLA_PSEUDO,
            INS_GENERAL_AUTH,
            0x00,
            0x00,
            0x05,
            0x01,
            0x00,
            block,
            key_code,
            KEY_SLOT,
        ];
        Ok(self.transmit_op(&auth)?.is_some())
    }

    fn read_block(&mut self, block: u8) -> Result<Option<[u8; BLOCK_SIZE]>, ReaderError> {
        let apdu = [CLA_PSEUDO, INS_READ_BINARY, 0x00, block, BLOCK_SIZE as u8];
        match self.transmit_op(&apdu)? {
            Some(payload) if payload.len() == BLOCK_SIZE => {
                let mut out = [0u8; BLOCK_SIZE];
                out.copy_from_slice(&payload);
                Ok(Some(out))
            }
            Some(payload) => Err(ReaderError::ShortResponse(payload.len())),
            None => Ok(None),
        }
    }

    fn write_block(&mut self, block: u8, data: &[u8; BLOCK_SIZE]) -> Result<bool, ReaderError> {
        let mut apdu = vec![CLA_PSEUDO, INS_UPDATE_BINARY, 0x00, block, BLOCK_SIZE as u8];
        apdu.extend_from_slice(data);
        Ok(self.transmit_op(&apdu)?.is_some())
    }

    fn read_page(&mut self, page: u8) -> Result<Option<[u8; NTAG_PAGE_SIZE]>, ReaderError> {
        let apdu = [CLA_PSEUDO, INS_READ_BINARY, 0x00, page, NTAG_PAGE_SIZE as u8];
        match self.transmit_op(&apdu)? {
            Some(payload) if payload.len() >= NTAG_PAGE_SIZE => {
                let mut out = [0u8; NTAG_PAGE_SIZE];
                out.copy_from_slice(&payload[..NTAG_PAGE_SIZE]);
                Ok(Some(out))
            }
            Some(payload) => Err(ReaderError::ShortResponse(payload.len())),
            None => Ok(None),
        }
    }

    fn write_page(&mut self, page: u8, data: &[u8; NTAG_PAGE_SIZE]) -> Result<bool, ReaderError> {
        let mut apdu = vec![CLA_PSEUDO, INS_UPDATE_BINARY, 0x00, page, NTAG_PAGE_SIZE as u8];
        apdu.extend_from_slice(data);
        Ok(self.transmit_op(&apdu)?.is_some())
    }

    fn felica_read_without_encryption(
        &mut self,
        idm: &[u8; 8],
        services: &[u16],
        blocks: &[u16],
    ) -> Result<Option<Vec<[u8; FELICA_BLOCK_SIZE]>>, ReaderError> {
        let mut frame = felica_frame(FELICA_CMD_READ, idm, services, blocks);
        let mut command = vec![PN532_IN_DATA_EXCHANGE, 0x01];
        command.append(&mut frame);

        let Some(response) = self.pn532_exchange(&command)? else {
            return Ok(None);
        };
        // PN532 status byte, then FeliCa response: len, 0x07, IDm(8),
        // status1, status2, block count, block data
        if response.first() != Some(&0x00) {
            log::warn!("FeliCa read failed at the PN532 layer");
            return Ok(None);
        }
        let felica = &response[1..];
        if felica.len() < 13 || felica[1] != FELICA_RSP_READ {
            return Err(ReaderError::ShortResponse(felica.len()));
        }
        let (status1, status2) = (felica[10], felica[11]);
        if status1 != 0 {
            log::warn!("FeliCa read rejected, status flags {status1:02X} {status2:02X}");
            return Ok(None);
        }
        let count = felica[12] as usize;
        let data = &felica[13..];
        if data.len() < count * FELICA_BLOCK_SIZE {
            return Err(ReaderError::ShortResponse(data.len()));
        }
        let mut out = Vec::with_capacity(count);
        for chunk in data.chunks_exact(FELICA_BLOCK_SIZE).take(count) {
            let mut block = [0u8; FELICA_BLOCK_SIZE];
            block.copy_from_slice(chunk);
            out.push(block);
        }
        Ok(Some(out))
    }

    fn felica_write_without_encryption(
        &mut self,
        idm: &[u8; 8],
        services: &[u16],
        blocks: &[u16],
        data: &[[u8; FELICA_BLOCK_SIZE]],
    ) -> Result<bool, ReaderError> {
        let mut frame = felica_frame(FELICA_CMD_WRITE, idm, services, blocks);
        for block in data {
            frame.extend_from_slice(block);
        }
        // Patch the frame length byte to cover the appended block data
        frame[0] = frame.len() as u8;
        let mut command = vec![PN532_IN_DATA_EXCHANGE, 0x01];
        command.append(&mut frame);

        let Some(response) = self.pn532_exchange(&command)? else {
            return Ok(false);
        };
        if response.first() != Some(&0x00) {
            log::warn!("FeliCa write failed at the PN532 layer");
            return Ok(false);
        }
        let felica = &response[1..];
        if felica.len() < 12 || felica[1] != FELICA_RSP_WRITE {
            return Err(ReaderError::ShortResponse(felica.len()));
        }
        let (status1, status2) = (felica[10], felica[11]);
        if status1 != 0 {
            log::warn!("FeliCa write rejected, status flags {status1:02X} {status2:02X}");
            return Ok(false);
        }
        Ok(true)
    }
}

/// Build a FeliCa command frame: length, command code, IDm, service list
/// (little-endian), block list. Block numbers up to 0xFF use the two-byte
/// list element; larger numbers need the three-byte form.
fn felica_frame(cmd: u8, idm: &[u8; 8], services: &[u16], blocks: &[u16]) -> Vec<u8> {
    let mut frame = vec![0u8, cmd];
    frame.extend_from_slice(idm);
    frame.push(services.len() as u8);
    for service in services {
        frame.extend_from_slice(&service.to_le_bytes());
    }
    frame.push(blocks.len() as u8);
    for block in blocks {
        // Access mode 0, service list index 0; bit 7 of the first byte
        // selects the two-byte element
        if *block <= 0xFF {
            frame.push(0x80);
            frame.push(*block as u8);
        } else {
            frame.push(0x00);
            frame.extend_from_slice(&block.to_le_bytes());
        }
    }
    frame[0] = frame.len() as u8;
    frame
}

impl Drop for PcscNfcReader {
    fn drop(&mut self) {
        self.disconnect();
    }
}
