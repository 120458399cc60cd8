use anyhow::Result;

mod cli;
mod core;

use cli::commands::run_cli;

fn main() -> Result<()> {
    run_cli()
}

#[cfg(test)]
mod tests {
    use crate::core::utils::*;

    #[test]
    fn test_hex_parsing() {
        assert_eq!(parse_hex("0102030A").unwrap(), vec![0x01, 0x02, 0x03, 0x0A]);
        assert_eq!(parse_hex("01 02 03 0A").unwrap(), vec![0x01, 0x02, 0x03, 0x0A]);
        assert_eq!(parse_hex("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_key_parsing() {
        assert_eq!(parse_mifare_key("FFFFFFFFFFFF").unwrap(), [0xFF; 6]);
        assert!(parse_mifare_key("FFFF").is_err());
    }

    #[test]
    fn test_format_functions() {
        let bytes = vec![0x01, 0x02, 0x03, 0x0A];
        assert_eq!(format_hex(&bytes), "0102030A");
        assert_eq!(format_hex_spaced(&bytes), "01 02 03 0A");
    }
}
