//! Clock programming files
//!
//! The board's clock generator is programmed from a register dump exported
//! by the vendor's clock configuration tool: one `address, data` pair per
//! line. Values may be hex (`0x0B`) or decimal. `#` starts a comment, blank
//! lines are ignored, and a leading `Address,Data` header is tolerated.
//!
//! ```text
//! # Si5338 dump
//! Address,Data
//! 0x06, 0x08
//! 27,0x70
//! ```

use crate::error::{AsocError, Result};
use std::path::{Path, PathBuf};

/// One clock-chip register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockEntry {
    /// Clock-chip register address
    pub address: u16,
    /// Value to write
    pub data: u32,
}

/// Parsed clock file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClockFile {
    /// Writes, in file order
    pub entries: Vec<ClockEntry>,
}

impl ClockFile {
    /// Read and parse a clock file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or a file format
    /// error naming the offending line.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text, path)
    }

    /// Parse clock file text; `origin` is used in error messages.
    ///
    /// # Errors
    ///
    /// Returns a file format error naming the offending line.
    pub fn parse(text: &str, origin: impl Into<PathBuf>) -> Result<Self> {
        let origin = origin.into();
        let mut entries = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if entries.is_empty() && line.to_ascii_lowercase().starts_with("address") {
                continue;
            }
            let mut fields = line.split(',').map(str::trim);
            let (Some(addr), Some(data), None) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(AsocError::file_format(
                    &origin,
                    line_no,
                    format!("expected `address, data`, got `{line}`"),
                ));
            };
            let address = parse_number(addr)
                .and_then(|v| u16::try_from(v).ok())
                .ok_or_else(|| {
                    AsocError::file_format(&origin, line_no, format!("bad address `{addr}`"))
                })?;
            let data = parse_number(data)
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| {
                    AsocError::file_format(&origin, line_no, format!("bad data `{data}`"))
                })?;
            entries.push(ClockEntry { address, data });
        }
        Ok(Self { entries })
    }

    /// Number of register writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the file held no writes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_number(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_radix_with_header_and_comments() {
        let text = "# dump\nAddress,Data\n0x06, 0x08\n\n27,0x70 # tail\n";
        let clk = ClockFile::parse(text, "clk.txt").unwrap();
        assert_eq!(
            clk.entries,
            vec![
                ClockEntry { address: 6, data: 8 },
                ClockEntry { address: 27, data: 0x70 },
            ]
        );
    }

    #[test]
    fn error_names_file_and_line() {
        let err = ClockFile::parse("0x01,0x02\n0x03\n", "board.clk").unwrap_err();
        assert_eq!(
            err.to_string(),
            "board.clk:2: expected `address, data`, got `0x03`"
        );
    }

    #[test]
    fn header_only_accepted_first() {
        let err = ClockFile::parse("1,2\naddress,data\n", "c").unwrap_err();
        assert!(matches!(err, AsocError::FileFormat { line: 2, .. }));
    }

    #[test]
    fn address_must_fit_sixteen_bits() {
        assert!(ClockFile::parse("0x10000, 1\n", "c").is_err());
        assert!(ClockFile::parse("zz, 1\n", "c").is_err());
    }

    #[test]
    fn empty_file_is_empty() {
        assert!(ClockFile::parse("# nothing\n", "c").unwrap().is_empty());
    }
}
