/// Tagdump - Cross-platform tool for dumping and writing NFC tag memory
///
/// This library models the memory of Mifare Classic, Mifare Ultralight,
/// NTAG21x and FeliCa tags and orchestrates reads/writes against any
/// reader implementing the narrow `NfcReader` trait; a PC/SC backend is
/// provided for ACR122-style contactless readers.
pub mod cli;
pub mod core;

// Re-export commonly used types
pub use crate::core::{
    dump::{save_dump, DumpReport, DumpStats, TagDumper, FAILED_UNIT_FILL},
    felica::{FelicaClient, FelicaError, FelicaSession, SystemCode},
    reader::{FelicaTarget, KeyType, MifareKey, NfcReader, PcscNfcReader, ReaderError, ReaderInfo},
    tag::{NfcTag, TagError, TagFamily},
    utils::{format_hex, parse_hex},
    write::{write_block, write_page},
};

// Common error type
pub type Result<T> = anyhow::Result<T>;
