//! Delimited text utilities (CSV, TSV, PSV)

mod encoder;
mod parser;

pub use encoder::CsvEncoder;
pub use parser::CsvParser;

// Re-export CompressionMethod from s-zip for convenience
pub use s_zip::CompressionMethod;

/// Leading bytes of a ZIP local file header
pub(crate) const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

/// Leading bytes of a gzip member
pub(crate) const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Leading bytes of a Zstandard frame
pub(crate) const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
