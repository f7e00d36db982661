//! Format identifiers, compression kinds and format resolution
//!
//! A format is resolved from an explicit override when one is given,
//! otherwise from the file extension. Compound extensions such as
//! `.csv.gz` resolve to the inner format.
//!
//! # Examples
//!
//! ```
//! use tabconv::format::{resolve_format, Format};
//!
//! assert_eq!(resolve_format("data.pq".as_ref(), None).unwrap(), Format::Parquet);
//! assert_eq!(resolve_format("data.txt".as_ref(), Some("TSV")).unwrap(), Format::Tsv);
//! ```

use crate::error::{ConvertError, Result};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Tabular file formats known to the converter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Csv,
    Tsv,
    Psv,
    Parquet,
    Orc,
    Feather,
    Sas7bdat,
    Stata,
    Spss,
    Excel,
    Html,
}

impl Format {
    /// Every format, in dispatch table order
    pub const ALL: [Format; 11] = [
        Format::Csv,
        Format::Tsv,
        Format::Psv,
        Format::Parquet,
        Format::Orc,
        Format::Feather,
        Format::Sas7bdat,
        Format::Stata,
        Format::Spss,
        Format::Excel,
        Format::Html,
    ];

    /// Canonical lowercase identifier
    pub fn name(&self) -> &'static str {
        match self {
            Format::Csv => "csv",
            Format::Tsv => "tsv",
            Format::Psv => "psv",
            Format::Parquet => "parquet",
            Format::Orc => "orc",
            Format::Feather => "feather",
            Format::Sas7bdat => "sas7bdat",
            Format::Stata => "stata",
            Format::Spss => "spss",
            Format::Excel => "excel",
            Format::Html => "html",
        }
    }

    /// Field separator for the delimited text formats
    pub fn delimiter(&self) -> Option<u8> {
        match self {
            Format::Csv => Some(b','),
            Format::Tsv => Some(b'\t'),
            Format::Psv => Some(b'|'),
            _ => None,
        }
    }

    /// Match a (lowercased) file extension
    pub fn from_extension(ext: &str) -> Option<Format> {
        let format = match ext {
            "csv" => Format::Csv,
            "tsv" => Format::Tsv,
            "psv" => Format::Psv,
            "parquet" | "pq" => Format::Parquet,
            "orc" => Format::Orc,
            "feather" | "arrow" | "ipc" => Format::Feather,
            "sas7bdat" => Format::Sas7bdat,
            "dta" => Format::Stata,
            "sav" | "zsav" => Format::Spss,
            "xlsx" | "xlsm" | "xls" => Format::Excel,
            "html" | "htm" => Format::Html,
            _ => return None,
        };
        Some(format)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Format {
    type Err = ConvertError;

    /// Parse a format override; identifiers are case-insensitive
    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let format = match lower.as_str() {
            "csv" => Format::Csv,
            "tsv" => Format::Tsv,
            "psv" => Format::Psv,
            "parquet" | "pq" => Format::Parquet,
            "orc" => Format::Orc,
            "feather" | "arrow" | "ipc" => Format::Feather,
            "sas7bdat" | "sas" => Format::Sas7bdat,
            "stata" | "dta" => Format::Stata,
            "spss" | "sav" => Format::Spss,
            "excel" | "xlsx" | "xls" => Format::Excel,
            "html" | "htm" => Format::Html,
            _ => return Err(ConvertError::UnsupportedFormat(s.to_string())),
        };
        Ok(format)
    }
}

/// Wrapper extensions that compress a delimited text file
const COMPRESSED_SUFFIXES: [&str; 3] = ["gz", "zst", "zip"];

/// Resolve the format of `path`, preferring `override_name` when present
pub fn resolve_format(path: &Path, override_name: Option<&str>) -> Result<Format> {
    if let Some(name) = override_name {
        return name.parse();
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_ascii_lowercase())
        .unwrap_or_default();

    let mut parts = file_name.rsplit('.');
    let last = parts.next().filter(|_| file_name.contains('.'));
    let Some(last) = last else {
        return Err(ConvertError::UnsupportedFormat(format!(
            "cannot infer format of '{}' without an extension",
            path.display()
        )));
    };

    if let Some(format) = Format::from_extension(last) {
        return Ok(format);
    }

    if COMPRESSED_SUFFIXES.contains(&last) {
        if let Some(format) = parts.next().and_then(Format::from_extension) {
            if format.delimiter().is_some() {
                return Ok(format);
            }
        }
    }

    Err(ConvertError::UnsupportedFormat(format!(
        "unrecognised extension '.{}' for '{}'",
        last,
        path.display()
    )))
}

/// Compression algorithms selectable for output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    None,
    Gzip,
    Snappy,
    Zstd,
    Lz4,
}

impl Compression {
    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
            Compression::Zstd => "zstd",
            Compression::Lz4 => "lz4",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Compression {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "uncompressed" => Ok(Compression::None),
            "gzip" | "gz" => Ok(Compression::Gzip),
            "snappy" => Ok(Compression::Snappy),
            "zstd" | "zst" => Ok(Compression::Zstd),
            "lz4" => Ok(Compression::Lz4),
            other => Err(ConvertError::InvalidArgument(format!(
                "unknown compression '{}' (expected none, gzip, snappy, zstd or lz4)",
                other
            ))),
        }
    }
}

/// Requested output compression
///
/// `kind: None` means "format default". A `level` without a kind is ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionSpec {
    pub kind: Option<Compression>,
    pub level: Option<u32>,
}

impl CompressionSpec {
    pub fn new(kind: Option<Compression>, level: Option<u32>) -> Self {
        CompressionSpec { kind, level }
    }

    /// Level to use for `kind`, falling back to `default`
    ///
    /// Fails when the requested level lies outside `range`.
    pub fn level_in(&self, range: std::ops::RangeInclusive<u32>, default: u32) -> Result<u32> {
        match self.level {
            None => Ok(default),
            Some(level) if range.contains(&level) => Ok(level),
            Some(level) => Err(ConvertError::InvalidArgument(format!(
                "compression level {} out of range {}..={} for {}",
                level,
                range.start(),
                range.end(),
                self.kind.unwrap_or(Compression::None)
            ))),
        }
    }
}
