use anyhow::{bail, Context, Result};

use crate::core::reader::MIFARE_KEY_SIZE;

/// Parse a hex string into bytes
/// Supports various formats:
/// - "0102030A" (pure hex)
/// - "01 02 03 0A" (space-separated)
/// - "0x01,0x02,0x03,0x0A" (0x prefix with commas)
/// - "01:02:03:0A" (colon-separated)
pub fn parse_hex(hex_str: &str) -> Result<Vec<u8>> {
    let cleaned = clean_hex_string(hex_str);

    if cleaned.is_empty() {
        return Ok(Vec::new());
    }

    if cleaned.len() % 2 != 0 {
        bail!(
            "Hex string must have even number of characters: '{}'",
            hex_str
        );
    }

    hex::decode(&cleaned).with_context(|| format!("Invalid hex string: '{hex_str}'"))
}

/// Parse a hex string that must decode to exactly `len` bytes
pub fn parse_hex_exact(hex_str: &str, len: usize) -> Result<Vec<u8>> {
    let bytes = parse_hex(hex_str)?;
    if bytes.len() != len {
        bail!(
            "Expected {} bytes, got {} from '{}'",
            len,
            bytes.len(),
            hex_str
        );
    }
    Ok(bytes)
}

/// Parse a 6-byte Mifare Classic key from hex
pub fn parse_mifare_key(hex_str: &str) -> Result<[u8; MIFARE_KEY_SIZE]> {
    let bytes = parse_hex_exact(hex_str, MIFARE_KEY_SIZE)
        .with_context(|| format!("Invalid Mifare key: '{hex_str}'"))?;
    let mut key = [0u8; MIFARE_KEY_SIZE];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Parse a comma-separated list of 16-bit hex values (service codes or
/// FeliCa block numbers), e.g. "0009,000B"
pub fn parse_u16_list(list_str: &str) -> Result<Vec<u16>> {
    list_str
        .split(',')
        .map(|item| {
            let cleaned = item.trim().trim_start_matches("0x").trim_start_matches("0X");
            u16::from_str_radix(cleaned, 16)
                .with_context(|| format!("Invalid 16-bit hex value: '{item}'"))
        })
        .collect()
}

/// Clean a hex string by removing common separators and prefixes
fn clean_hex_string(hex_str: &str) -> String {
    hex_str
        .trim()
        .replace("0x", "")
        .replace("0X", "")
        .replace(" ", "")
        .replace(",", "")
        .replace(":", "")
        .replace("-", "")
        .replace("\t", "")
        .replace("\n", "")
        .replace("\r", "")
        .to_uppercase()
}

/// Format bytes as a hex string
pub fn format_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Format bytes as a hex string with spaces
pub fn format_hex_spaced(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Format bytes as ASCII, replacing non-printable chars with '.'
pub fn format_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

/// Format bytes in a hex dump style (both hex and ASCII)
pub fn format_hex_dump(bytes: &[u8]) -> String {
    const BYTES_PER_LINE: usize = 16;

    if bytes.is_empty() {
        return String::from("(empty)");
    }

    let mut result = String::new();

    for (i, chunk) in bytes.chunks(BYTES_PER_LINE).enumerate() {
        // Address
        result.push_str(&format!("{:08X}: ", i * BYTES_PER_LINE));

        // Hex bytes
        for (j, &byte) in chunk.iter().enumerate() {
            result.push_str(&format!("{byte:02X} "));
            if j == 7 {
                result.push(' '); // Extra space in the middle
            }
        }

        // Padding for incomplete lines
        let padding_needed = (BYTES_PER_LINE - chunk.len()) * 3;
        if chunk.len() <= 8 {
            result.push(' '); // Account for middle space
        }
        result.push_str(&" ".repeat(padding_needed));

        // ASCII representation
        result.push_str(" |");
        for &byte in chunk {
            if byte.is_ascii_graphic() || byte == b' ' {
                result.push(byte as char);
            } else {
                result.push('.');
            }
        }
        result.push('|');
        result.push('\n');
    }

    result.trim_end().to_string()
}
