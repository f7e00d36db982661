//! Apache ORC reading and writing
//!
//! A file is the `ORC` magic, a run of stripes, then a tail: file metadata,
//! the footer and an uncompressed postscript whose length is the last byte
//! of the file. The reader decodes one stripe at a time into a record batch.
//! The writer turns every incoming chunk into one stripe (split past
//! [`STRIPE_ROWS`]), so chunks reach the file as they arrive.
//!
//! Flat schemas only: the root struct's children must be primitive columns.
//!
//! # Example
//!
//! ```no_run
//! use tabconv::orc::{OrcReader, OrcSink};
//! use tabconv::format::{Compression, CompressionSpec};
//!
//! let reader = OrcReader::open("events.orc")?;
//! println!("{} rows in {} stripe(s)", reader.row_count(), reader.stripe_count());
//!
//! let spec = CompressionSpec::new(Some(Compression::Zstd), None);
//! let mut sink = OrcSink::create("copy.orc", reader.schema(), &spec)?;
//! for batch in reader.batches(None) {
//!     sink.write(&batch?)?;
//! }
//! sink.close()?;
//! # Ok::<(), tabconv::error::ConvertError>(())
//! ```

mod proto;
pub mod reader;
mod rle;
pub mod writer;

pub use reader::{read_orc, OrcReader};
pub use writer::{open_orc, OrcSink};

use crate::error::{ConvertError, Result};
use std::io::{Read, Write};

pub(crate) const MAGIC: &[u8; 3] = b"ORC";

/// Rows per stripe written
pub const STRIPE_ROWS: usize = 65_536;

/// Compression block size recorded in the postscript
pub(crate) const BLOCK_SIZE: usize = 256 * 1024;

/// Seconds from 1970-01-01 to 2015-01-01, the timestamp stream base
pub(crate) const TIMESTAMP_BASE: i64 = 1_420_070_400;

/// Type kinds of the ORC type tree
pub(crate) mod kind {
    pub const BOOLEAN: u64 = 0;
    pub const BYTE: u64 = 1;
    pub const SHORT: u64 = 2;
    pub const INT: u64 = 3;
    pub const LONG: u64 = 4;
    pub const FLOAT: u64 = 5;
    pub const DOUBLE: u64 = 6;
    pub const STRING: u64 = 7;
    pub const BINARY: u64 = 8;
    pub const TIMESTAMP: u64 = 9;
    pub const STRUCT: u64 = 12;
    pub const DECIMAL: u64 = 14;
    pub const DATE: u64 = 15;
    pub const VARCHAR: u64 = 16;
    pub const CHAR: u64 = 17;
    pub const TIMESTAMP_INSTANT: u64 = 18;
}

/// Stream kinds inside a stripe
pub(crate) mod stream {
    pub const PRESENT: u64 = 0;
    pub const DATA: u64 = 1;
    pub const LENGTH: u64 = 2;
    pub const DICTIONARY_DATA: u64 = 3;
    pub const SECONDARY: u64 = 5;
}

/// Column encodings
pub(crate) mod encoding {
    pub const DIRECT: u64 = 0;
    pub const DICTIONARY: u64 = 1;
    pub const DIRECT_V2: u64 = 2;
    pub const DICTIONARY_V2: u64 = 3;
}

/// Block compression of streams and the file tail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OrcCompression {
    None,
    Zlib,
    Snappy,
    Lzo,
    Lz4,
    Zstd,
}

impl OrcCompression {
    pub(crate) fn from_code(code: u64) -> Result<Self> {
        Ok(match code {
            0 => OrcCompression::None,
            1 => OrcCompression::Zlib,
            2 => OrcCompression::Snappy,
            3 => OrcCompression::Lzo,
            4 => OrcCompression::Lz4,
            5 => OrcCompression::Zstd,
            other => return Err(proto::malformed(&format!("compression code {}", other))),
        })
    }

    pub(crate) fn code(self) -> u64 {
        match self {
            OrcCompression::None => 0,
            OrcCompression::Zlib => 1,
            OrcCompression::Snappy => 2,
            OrcCompression::Lzo => 3,
            OrcCompression::Lz4 => 4,
            OrcCompression::Zstd => 5,
        }
    }
}

fn codec_error(kind: OrcCompression, e: impl std::fmt::Display) -> ConvertError {
    ConvertError::read(format!("Failed to decompress {:?} ORC block: {}", kind, e))
}

/// Undo block compression: 3-byte little-endian headers carrying
/// `length * 2 + is_original`, each followed by its block
pub(crate) fn decompress(kind: OrcCompression, data: &[u8], block_size: usize) -> Result<Vec<u8>> {
    if kind == OrcCompression::None {
        return Ok(data.to_vec());
    }
    let mut out = Vec::with_capacity(data.len() * 2);
    let mut pos = 0;
    while pos < data.len() {
        let header = data
            .get(pos..pos + 3)
            .ok_or_else(|| ConvertError::read("Truncated ORC compression header"))?;
        let header = u32::from(header[0]) | u32::from(header[1]) << 8 | u32::from(header[2]) << 16;
        let len = (header >> 1) as usize;
        pos += 3;
        let block = data
            .get(pos..pos + len)
            .ok_or_else(|| ConvertError::read("Truncated ORC compressed block"))?;
        pos += len;
        if header & 1 == 1 {
            out.extend_from_slice(block);
            continue;
        }
        match kind {
            OrcCompression::Zlib => {
                flate2::read::DeflateDecoder::new(block)
                    .read_to_end(&mut out)
                    .map_err(|e| codec_error(kind, e))?;
            }
            OrcCompression::Snappy => {
                let plain = snap::raw::Decoder::new()
                    .decompress_vec(block)
                    .map_err(|e| codec_error(kind, e))?;
                out.extend(plain);
            }
            OrcCompression::Lz4 => {
                let plain = lz4_flex::block::decompress(block, block_size)
                    .map_err(|e| codec_error(kind, e))?;
                out.extend(plain);
            }
            OrcCompression::Zstd => {
                let plain = zstd::stream::decode_all(block).map_err(|e| codec_error(kind, e))?;
                out.extend(plain);
            }
            OrcCompression::Lzo => {
                return Err(ConvertError::UnsupportedCompression {
                    compression: "lzo".to_string(),
                    format: "orc".to_string(),
                })
            }
            OrcCompression::None => out.extend_from_slice(block),
        }
    }
    Ok(out)
}

/// Block compressor for one output file
#[derive(Debug, Clone, Copy)]
pub(crate) struct Compressor {
    pub(crate) kind: OrcCompression,
    pub(crate) level: u32,
}

impl Compressor {
    pub(crate) fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if self.kind == OrcCompression::None {
            return Ok(data.to_vec());
        }
        let write_error = |e: &dyn std::fmt::Display| {
            ConvertError::Write(format!("Failed to compress ORC block: {}", e))
        };
        let mut out = Vec::with_capacity(data.len() / 2 + 3);
        for block in data.chunks(BLOCK_SIZE) {
            let packed = match self.kind {
                OrcCompression::Zlib => {
                    let level = flate2::Compression::new(self.level);
                    let mut encoder = flate2::write::DeflateEncoder::new(Vec::new(), level);
                    encoder.write_all(block)?;
                    encoder.finish()?
                }
                OrcCompression::Snappy => snap::raw::Encoder::new()
                    .compress_vec(block)
                    .map_err(|e| write_error(&e))?,
                OrcCompression::Lz4 => lz4_flex::block::compress(block),
                OrcCompression::Zstd => {
                    let level = i32::try_from(self.level).unwrap_or(3);
                    zstd::bulk::compress(block, level).map_err(|e| write_error(&e))?
                }
                OrcCompression::Lzo | OrcCompression::None => block.to_vec(),
            };
            let (body, original) = if packed.len() < block.len() {
                (packed.as_slice(), 0)
            } else {
                (block, 1)
            };
            let header = (body.len() as u32) << 1 | original;
            out.extend_from_slice(&header.to_le_bytes()[..3]);
            out.extend_from_slice(body);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_survive_every_codec() -> Result<()> {
        let text: Vec<u8> = b"orc stripe data ".repeat(40_000);
        for kind in [
            OrcCompression::None,
            OrcCompression::Zlib,
            OrcCompression::Snappy,
            OrcCompression::Lz4,
            OrcCompression::Zstd,
        ] {
            let compressor = Compressor { kind, level: 1 };
            let packed = compressor.compress(&text)?;
            if kind != OrcCompression::None {
                assert!(packed.len() < text.len() / 4);
            }
            assert_eq!(decompress(kind, &packed, BLOCK_SIZE)?, text);
        }
        Ok(())
    }

    #[test]
    fn test_incompressible_block_is_stored() -> Result<()> {
        let compressor = Compressor {
            kind: OrcCompression::Zlib,
            level: 6,
        };
        let packed = compressor.compress(b"ab")?;
        // length 2, original flag set
        assert_eq!(&packed[..3], &[0x05, 0x00, 0x00]);
        assert_eq!(decompress(OrcCompression::Zlib, &packed, BLOCK_SIZE)?, b"ab");
        Ok(())
    }

    #[test]
    fn test_lzo_is_unsupported() {
        let block = [0x08, 0x00, 0x00, 1, 2, 3, 4];
        assert!(matches!(
            decompress(OrcCompression::Lzo, &block, BLOCK_SIZE),
            Err(ConvertError::UnsupportedCompression { .. })
        ));
    }
}
