use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::core::{
    dump::{save_dump, DumpStats, TagDumper},
    felica::{FelicaClient, SYSTEM_CODE_WILDCARD},
    reader::{KeyType, MifareKey, NfcReader, PcscNfcReader},
    tag::{
        NfcTag, TagFamily, FELICA_BLOCK_SIZE, NTAG203_PAGES, NTAG213_PAGES, NTAG215_PAGES,
        NTAG216_PAGES,
    },
    utils::{format_hex, format_hex_spaced, parse_hex_exact, parse_mifare_key, parse_u16_list},
    write,
};

#[derive(Parser)]
#[command(name = "tagdump")]
#[command(about = "Cross-platform PCSC tool for dumping and writing NFC tag memory")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List available PCSC readers
    List {
        /// Show detailed information about readers
        #[arg(short = 'l', long)]
        detailed: bool,
    },

    /// Poll for a tag and print its identity
    Detect {
        /// Reader name or index (use 'list' to see available readers)
        reader: String,
    },

    /// Dump a Mifare Classic or Ultralight tag
    Dump {
        /// Reader name or index
        reader: String,

        /// Sector key in hex (e.g. "FFFFFFFFFFFF")
        #[arg(short, long, default_value = "FFFFFFFFFFFF")]
        key: String,

        /// Key slot to authenticate with
        #[arg(short = 't', long, default_value = "a")]
        key_type: KeyTypeArg,

        /// Save the image to <path>.bin and a report to <path>.json
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Dump an NTAG21x tag page range
    DumpNtag {
        /// Reader name or index
        reader: String,

        /// Tag variant, sets the page count
        #[arg(short = 'V', long, default_value = "ntag213")]
        variant: NtagVariant,

        /// Explicit page count, overrides --variant
        #[arg(short, long)]
        pages: Option<usize>,

        /// Save the image to <path>.bin and a report to <path>.json
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write one 16-byte Mifare Classic block
    Write {
        /// Reader name or index
        reader: String,

        /// Block number to write
        block: u8,

        /// 16 bytes of data in hex
        data: String,

        /// Sector key in hex
        #[arg(short, long, default_value = "FFFFFFFFFFFF")]
        key: String,

        /// Key slot to authenticate with
        #[arg(short = 't', long, default_value = "a")]
        key_type: KeyTypeArg,
    },

    /// Write one 4-byte NTAG21x page
    WritePage {
        /// Reader name or index
        reader: String,

        /// Page number to write
        page: u8,

        /// 4 bytes of data in hex
        data: String,
    },

    /// Read FeliCa blocks without encryption
    FelicaRead {
        /// Reader name or index
        reader: String,

        /// Service codes, comma-separated hex (e.g. "000B")
        services: String,

        /// Block numbers, comma-separated hex (e.g. "0,1,2")
        blocks: String,

        /// System code to poll, hex
        #[arg(short, long, default_value = "FFFF")]
        system_code: String,

        /// Save the blocks to a <path>.json report
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write FeliCa blocks without encryption
    FelicaWrite {
        /// Reader name or index
        reader: String,

        /// Service codes, comma-separated hex (e.g. "0009")
        services: String,

        /// Block number, hex
        block: String,

        /// 16 bytes of data in hex
        data: String,

        /// System code to poll, hex
        #[arg(short, long, default_value = "FFFF")]
        system_code: String,
    },
}

#[derive(Clone, Debug)]
pub enum KeyTypeArg {
    A,
    B,
}

impl std::str::FromStr for KeyTypeArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "a" => Ok(KeyTypeArg::A),
            "b" => Ok(KeyTypeArg::B),
            _ => Err(format!("Invalid key type: {s} (expected 'a' or 'b')")),
        }
    }
}

impl From<KeyTypeArg> for KeyType {
    fn from(arg: KeyTypeArg) -> Self {
        match arg {
            KeyTypeArg::A => KeyType::A,
            KeyTypeArg::B => KeyType::B,
        }
    }
}

#[derive(Clone, Debug)]
pub enum NtagVariant {
    Ntag203,
    Ntag213,
    Ntag215,
    Ntag216,
}

impl NtagVariant {
    pub fn pages(&self) -> usize {
        match self {
            NtagVariant::Ntag203 => NTAG203_PAGES,
            NtagVariant::Ntag213 => NTAG213_PAGES,
            NtagVariant::Ntag215 => NTAG215_PAGES,
            NtagVariant::Ntag216 => NTAG216_PAGES,
        }
    }
}

impl std::str::FromStr for NtagVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ntag203" | "203" => Ok(NtagVariant::Ntag203),
            "ntag213" | "213" => Ok(NtagVariant::Ntag213),
            "ntag215" | "215" => Ok(NtagVariant::Ntag215),
            "ntag216" | "216" => Ok(NtagVariant::Ntag216),
            _ => Err(format!("Invalid NTAG variant: {s}")),
        }
    }
}

pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.debug {
        log::LevelFilter::Debug
    } else if cli.verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    match cli.command {
        Commands::List { detailed } => cmd_list(detailed),
        Commands::Detect { reader } => cmd_detect(&reader),
        Commands::Dump {
            reader,
            key,
            key_type,
            output,
        } => cmd_dump(&reader, &key, key_type, output.as_deref()),
        Commands::DumpNtag {
            reader,
            variant,
            pages,
            output,
        } => cmd_dump_ntag(
            &reader,
            pages.unwrap_or_else(|| variant.pages()),
            output.as_deref(),
        ),
        Commands::Write {
            reader,
            block,
            data,
            key,
            key_type,
        } => cmd_write(&reader, block, &data, &key, key_type),
        Commands::WritePage { reader, page, data } => cmd_write_page(&reader, page, &data),
        Commands::FelicaRead {
            reader,
            services,
            blocks,
            system_code,
            output,
        } => cmd_felica_read(&reader, &services, &blocks, &system_code, output.as_deref()),
        Commands::FelicaWrite {
            reader,
            services,
            block,
            data,
            system_code,
        } => cmd_felica_write(&reader, &services, &block, &data, &system_code),
    }
}

fn cmd_list(detailed: bool) -> Result<()> {
    let reader = PcscNfcReader::new().context("Failed to initialize PCSC")?;

    let readers = reader.list_readers().context("Failed to list readers")?;

    if readers.is_empty() {
        println!("No PCSC readers found.");
        return Ok(());
    }

    println!("Available PCSC readers:");
    for (i, info) in readers.iter().enumerate() {
        if detailed {
            println!("  [{}] {}", i, info.name);
            println!(
                "      Status: {}",
                if info.has_card { "Card present" } else { "No card" }
            );
            if let Some(ref atr) = info.atr {
                println!("      ATR: {}", format_hex_spaced(atr));
            }
        } else if info.has_card {
            println!("  [{}] {} [CARD]", i, info.name);
        } else {
            println!("  [{}] {}", i, info.name);
        }
    }

    Ok(())
}

fn cmd_detect(reader_name: &str) -> Result<()> {
    let mut reader = connect(reader_name)?;

    if let Some(uid) = reader.poll_iso14443a()? {
        let family = TagFamily::from_uid_len(uid.len());
        println!("ISO14443A tag found");
        println!("  UID ({} bytes): {}", uid.len(), format_hex_spaced(&uid));
        println!("  Family guess: {family} (NTAG21x shares the 7-byte UID signature)");
        return Ok(());
    }

    let mut client = FelicaClient::new(reader);
    if let Some(session) = client.poll()? {
        println!("FeliCa tag found");
        println!("  IDm: {}", format_hex_spaced(&session.idm));
        println!("  PMm: {}", format_hex_spaced(&session.pmm));
        println!(
            "  System code: {:04X} ({})",
            session.system_code,
            crate::core::felica::SystemCode::from_raw(session.system_code)
        );
        return Ok(());
    }

    println!("No tag detected.");
    Ok(())
}

fn cmd_dump(
    reader_name: &str,
    key_hex: &str,
    key_type: KeyTypeArg,
    output: Option<&std::path::Path>,
) -> Result<()> {
    let mut reader = connect(reader_name)?;
    let key = MifareKey {
        key_type: key_type.into(),
        bytes: parse_mifare_key(key_hex)?,
    };

    let dumper = TagDumper::new();
    let Some((tag, stats)) = dumper.dump_tag(&mut reader, &key)? else {
        bail!("No tag detected");
    };

    print_tag(&tag, stats);

    if let Some(path) = output {
        save_dump(&tag, stats, path)?;
    }
    Ok(())
}

fn cmd_dump_ntag(reader_name: &str, pages: usize, output: Option<&std::path::Path>) -> Result<()> {
    let mut reader = connect(reader_name)?;

    let dumper = TagDumper::new();
    let Some((tag, stats)) = dumper.dump_ntag(&mut reader, pages)? else {
        bail!("No NTAG21x tag detected");
    };

    print_tag(&tag, stats);

    if let Some(path) = output {
        save_dump(&tag, stats, path)?;
    }
    Ok(())
}

fn cmd_write(
    reader_name: &str,
    block: u8,
    data_hex: &str,
    key_hex: &str,
    key_type: KeyTypeArg,
) -> Result<()> {
    let mut reader = connect(reader_name)?;
    let key = MifareKey {
        key_type: key_type.into(),
        bytes: parse_mifare_key(key_hex)?,
    };
    let bytes = parse_hex_exact(data_hex, 16).context("Block data must be 16 bytes")?;
    let mut data = [0u8; 16];
    data.copy_from_slice(&bytes);

    if write::write_block(&mut reader, block, &data, &key)? {
        println!("Block {block} written.");
        Ok(())
    } else {
        bail!("Write to block {block} failed");
    }
}

fn cmd_write_page(reader_name: &str, page: u8, data_hex: &str) -> Result<()> {
    let mut reader = connect(reader_name)?;
    let bytes = parse_hex_exact(data_hex, 4).context("Page data must be 4 bytes")?;
    let mut data = [0u8; 4];
    data.copy_from_slice(&bytes);

    if write::write_page(&mut reader, page, &data)? {
        println!("Page {page} written.");
        Ok(())
    } else {
        bail!("Write to page {page} failed");
    }
}

fn cmd_felica_read(
    reader_name: &str,
    services_str: &str,
    blocks_str: &str,
    system_code_str: &str,
    output: Option<&std::path::Path>,
) -> Result<()> {
    let reader = connect(reader_name)?;
    let services = parse_u16_list(services_str).context("Failed to parse service codes")?;
    let blocks = parse_u16_list(blocks_str).context("Failed to parse block list")?;
    let system_code = parse_system_code(system_code_str)?;

    let mut client = FelicaClient::new(reader);
    let Some(session) = client.poll_system(system_code)? else {
        bail!("No FeliCa tag answered system code {system_code:04X}");
    };
    println!("IDm: {}", format_hex_spaced(&session.idm));

    let tag = client.read_into_tag(&services, &blocks)?;
    if let Some(map) = tag.sparse_blocks() {
        for (pos, block) in map {
            println!("Block {pos:04X}  {}", format_hex_spaced(block));
        }
    }

    if let Some(path) = output {
        save_dump(&tag, DumpStats::default(), path)?;
    }
    Ok(())
}

fn cmd_felica_write(
    reader_name: &str,
    services_str: &str,
    block_str: &str,
    data_hex: &str,
    system_code_str: &str,
) -> Result<()> {
    let services = parse_u16_list(services_str).context("Failed to parse service codes")?;
    let blocks = parse_u16_list(block_str).context("Failed to parse block number")?;
    if blocks.len() != 1 {
        bail!("felica-write writes exactly one block, got {}", blocks.len());
    }
    let system_code = parse_system_code(system_code_str)?;

    let bytes = parse_hex_exact(data_hex, FELICA_BLOCK_SIZE).context("Block data must be 16 bytes")?;
    let mut block_data = [0u8; FELICA_BLOCK_SIZE];
    block_data.copy_from_slice(&bytes);

    let reader = connect(reader_name)?;
    let mut client = FelicaClient::new(reader);
    if client.poll_system(system_code)?.is_none() {
        bail!("No FeliCa tag answered system code {system_code:04X}");
    }

    client.write(&services, &blocks, &[block_data])?;
    println!("Wrote block {:04X}.", blocks[0]);
    Ok(())
}

fn parse_system_code(s: &str) -> Result<u16> {
    let cleaned = s.trim().trim_start_matches("0x").trim_start_matches("0X");
    if cleaned.is_empty() {
        return Ok(SYSTEM_CODE_WILDCARD);
    }
    u16::from_str_radix(cleaned, 16).with_context(|| format!("Invalid system code: '{s}'"))
}

fn connect(reader_name: &str) -> Result<PcscNfcReader> {
    let mut reader = PcscNfcReader::new().context("Failed to initialize PCSC")?;
    let name = resolve_reader_name(&reader, reader_name)?;
    reader.select_reader(&name);
    Ok(reader)
}

fn resolve_reader_name(reader: &PcscNfcReader, name_or_index: &str) -> Result<String> {
    // Try to parse as index first
    if let Ok(index) = name_or_index.parse::<usize>() {
        let readers = reader.list_readers()?;
        if index < readers.len() {
            return Ok(readers[index].name.clone());
        } else if readers.is_empty() {
            bail!("No PCSC readers found");
        } else {
            bail!(
                "Reader index {} out of range (0-{})",
                index,
                readers.len() - 1
            );
        }
    }

    // Use as reader name directly
    Ok(name_or_index.to_string())
}

fn print_tag(tag: &NfcTag, stats: DumpStats) {
    println!("{} tag", tag.family());
    println!("  UID: {}", format_hex(tag.uid()));
    if tag.family() == TagFamily::MifareClassic {
        println!("  BCC: {:02X}  SAK: {:02X}", tag.bcc(), tag.sak());
    } else {
        println!("  SAK: {:02X}", tag.sak());
    }
    let atqa = tag.atqa();
    println!("  ATQA: {:02X} {:02X}", atqa[0], atqa[1]);
    println!();

    let unit_size = tag.unit_size();
    let mut buf = vec![0u8; unit_size];
    for i in 0..tag.unit_count() {
        if tag.family() == TagFamily::MifareClassic && i % 4 == 0 {
            println!("------------------------Sector {:2}-------------------------", i / 4);
        }
        if tag.get_block(i, &mut buf).is_ok() {
            println!("Block {i:3}  {}", format_hex_spaced(&buf));
        }
    }

    println!();
    println!(
        "Dump finished: {} unit(s), {} unauthenticated, {} unreadable",
        tag.unit_count(),
        stats.unauthenticated,
        stats.unreadable
    );
}
