use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::reader::{FelicaTarget, NfcReader, ReaderError};
use crate::core::tag::{NfcTag, FELICA_BLOCK_SIZE};

/// Wildcard system code matched by every FeliCa card
pub const SYSTEM_CODE_WILDCARD: u16 = 0xFFFF;
/// Default request code: ask the card to report its system code
pub const REQUEST_CODE_SYSTEM: u8 = 0x01;

/// Closed enumeration of known FeliCa system codes. Anything outside the
/// list maps to `Invalid`, which callers treat as "unclassified".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemCode {
    /// NFC Forum Type 3 / NDEF (0x12FC)
    Ndef,
    /// NFC-F (0x4000)
    NfcF,
    /// FeliCa Lite-S (0x88B4)
    LiteS,
    /// FeliCa SecureID (0x957A)
    SecureId,
    /// FeliCa Common Area (0xFE00)
    CommonArea,
    /// FeliCa Plug (0xFEE1)
    Plug,
    Invalid,
}

impl SystemCode {
    pub fn from_raw(code: u16) -> Self {
        match code {
            0x12FC => SystemCode::Ndef,
            0x4000 => SystemCode::NfcF,
            0x88B4 => SystemCode::LiteS,
            0x957A => SystemCode::SecureId,
            0xFE00 => SystemCode::CommonArea,
            0xFEE1 => SystemCode::Plug,
            _ => SystemCode::Invalid,
        }
    }
}

impl From<u16> for SystemCode {
    fn from(code: u16) -> Self {
        SystemCode::from_raw(code)
    }
}

impl std::fmt::Display for SystemCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SystemCode::Ndef => "NDEF",
            SystemCode::NfcF => "NFC-F",
            SystemCode::LiteS => "FeliCa Lite-S",
            SystemCode::SecureId => "FeliCa SecureID",
            SystemCode::CommonArea => "FeliCa Common Area",
            SystemCode::Plug => "FeliCa Plug",
            SystemCode::Invalid => "Invalid",
        };
        write!(f, "{name}")
    }
}

/// FeliCa addressing failure
#[derive(Debug, Error)]
pub enum FelicaError {
    #[error("no prior successful poll; poll the card first")]
    NotPolled,
    #[error("card rejected the block-list exchange")]
    Rejected,
    #[error("card returned {returned} blocks, expected {requested}")]
    BlockCount { requested: usize, returned: usize },
    #[error("write payload holds {data} blocks but the block list names {blocks}")]
    PayloadMismatch { blocks: usize, data: usize },
    #[error(transparent)]
    Transport(#[from] ReaderError),
}

/// Identity captured by a successful poll; required before any
/// Read/Write Without Encryption exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FelicaSession {
    pub idm: [u8; 8],
    pub pmm: [u8; 8],
    pub system_code: u16,
}

/// Service-code/block-list addressing layer over a FeliCa card.
///
/// A successful poll is a mandatory precondition state: `read`/`write`
/// refuse to touch the reader until one has happened, and a failed poll
/// clears any earlier session.
pub struct FelicaClient<R> {
    reader: R,
    session: Option<FelicaSession>,
}

impl<R: NfcReader> FelicaClient<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            session: None,
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Session captured by the last successful poll, if any
    pub fn session(&self) -> Option<&FelicaSession> {
        self.session.as_ref()
    }

    /// Poll with the wildcard system code and the default request code
    pub fn poll(&mut self) -> Result<Option<FelicaSession>, FelicaError> {
        self.poll_with(SYSTEM_CODE_WILDCARD, REQUEST_CODE_SYSTEM)
    }

    /// Poll a specific system code with the default request code
    pub fn poll_system(&mut self, system_code: u16) -> Result<Option<FelicaSession>, FelicaError> {
        self.poll_with(system_code, REQUEST_CODE_SYSTEM)
    }

    /// Fully explicit poll. The defaulted overloads delegate here and
    /// behave identically once defaults are substituted.
    pub fn poll_with(
        &mut self,
        system_code: u16,
        request_code: u8,
    ) -> Result<Option<FelicaSession>, FelicaError> {
        match self.reader.poll_felica(system_code, request_code)? {
            Some(FelicaTarget {
                idm,
                pmm,
                system_code: reported,
            }) => {
                let session = FelicaSession {
                    idm,
                    pmm,
                    system_code: reported.unwrap_or(system_code),
                };
                log::info!(
                    "FeliCa session open, system code {:04X} ({})",
                    session.system_code,
                    SystemCode::from_raw(session.system_code)
                );
                self.session = Some(session.clone());
                Ok(Some(session))
            }
            None => {
                log::warn!("FeliCa poll failed, no tag for system code {system_code:04X}");
                self.session = None;
                Ok(None)
            }
        }
    }

    /// Read Without Encryption over the given service codes and block
    /// list. Blocks come back in block-list order.
    pub fn read(
        &mut self,
        services: &[u16],
        blocks: &[u16],
    ) -> Result<Vec<[u8; FELICA_BLOCK_SIZE]>, FelicaError> {
        let session = self.session.as_ref().ok_or(FelicaError::NotPolled)?;
        let idm = session.idm;
        match self
            .reader
            .felica_read_without_encryption(&idm, services, blocks)?
        {
            Some(data) if data.len() == blocks.len() => Ok(data),
            Some(data) => Err(FelicaError::BlockCount {
                requested: blocks.len(),
                returned: data.len(),
            }),
            None => Err(FelicaError::Rejected),
        }
    }

    /// Read a block list into a sparse tag model keyed by block number
    pub fn read_into_tag(
        &mut self,
        services: &[u16],
        blocks: &[u16],
    ) -> Result<NfcTag, FelicaError> {
        let session = self.session.clone().ok_or(FelicaError::NotPolled)?;
        let data = self.read(services, blocks)?;
        let mut tag = NfcTag::felica(session.idm, session.pmm, session.system_code);
        for (pos, block) in blocks.iter().zip(data) {
            tag.add_block(*pos, block);
        }
        Ok(tag)
    }

    /// Write Without Encryption; one 16-byte payload per listed block
    pub fn write(
        &mut self,
        services: &[u16],
        blocks: &[u16],
        data: &[[u8; FELICA_BLOCK_SIZE]],
    ) -> Result<(), FelicaError> {
        let session = self.session.as_ref().ok_or(FelicaError::NotPolled)?;
        if data.len() != blocks.len() {
            return Err(FelicaError::PayloadMismatch {
                blocks: blocks.len(),
                data: data.len(),
            });
        }
        let idm = session.idm;
        if self
            .reader
            .felica_write_without_encryption(&idm, services, blocks, data)?
        {
            Ok(())
        } else {
            Err(FelicaError::Rejected)
        }
    }
}
