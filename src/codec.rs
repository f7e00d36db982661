//! Reader and writer dispatch
//!
//! One static table maps every [`Format`] to its reader, its writer, whether
//! the writer streams chunks straight to disk, and the compressions it
//! accepts. Formats without an entry fail with `UnsupportedFormat`.

use crate::csv_reader::read_delimited;
use crate::csv_writer::open_delimited;
use crate::error::{ConvertError, Result};
use crate::format::{Compression, CompressionSpec, Format};
use crate::request::{ReadOptions, WriteOptions};
use crate::stream::BatchStream;
use crate::{fast_writer, feather, html, orc, parquet, sas, spss, stata, streaming_reader};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use std::path::Path;

/// Destination for converted batches
pub trait TableSink {
    fn write_batch(&mut self, batch: &RecordBatch) -> Result<()>;

    /// Flush and close the output
    fn finish(self: Box<Self>) -> Result<()>;
}

pub type OpenReader = fn(&Path, &ReadOptions) -> Result<BatchStream>;
pub type OpenWriter = fn(&Path, SchemaRef, &WriteOptions) -> Result<Box<dyn TableSink>>;

/// Dispatch entry for one format
pub struct Codec {
    pub format: Format,
    pub reader: Option<OpenReader>,
    pub writer: Option<OpenWriter>,
    /// Writer persists each chunk as it arrives (otherwise it buffers until finish)
    pub appends: bool,
    pub compressions: &'static [Compression],
}

const TEXT_COMPRESSIONS: &[Compression] = &[Compression::Gzip, Compression::Zstd];
const PARQUET_COMPRESSIONS: &[Compression] = &[
    Compression::Snappy,
    Compression::Gzip,
    Compression::Zstd,
    Compression::Lz4,
];
const FEATHER_COMPRESSIONS: &[Compression] = &[Compression::Lz4, Compression::Zstd];
const ORC_COMPRESSIONS: &[Compression] = &[
    Compression::Gzip,
    Compression::Snappy,
    Compression::Zstd,
    Compression::Lz4,
];

static CODECS: [Codec; 11] = [
    Codec {
        format: Format::Csv,
        reader: Some(read_csv),
        writer: Some(write_csv),
        appends: true,
        compressions: TEXT_COMPRESSIONS,
    },
    Codec {
        format: Format::Tsv,
        reader: Some(read_tsv),
        writer: Some(write_tsv),
        appends: true,
        compressions: TEXT_COMPRESSIONS,
    },
    Codec {
        format: Format::Psv,
        reader: Some(read_psv),
        writer: Some(write_psv),
        appends: true,
        compressions: TEXT_COMPRESSIONS,
    },
    Codec {
        format: Format::Parquet,
        reader: Some(parquet::read_parquet),
        writer: Some(parquet::open_parquet),
        appends: true,
        compressions: PARQUET_COMPRESSIONS,
    },
    Codec {
        format: Format::Orc,
        reader: Some(orc::read_orc),
        writer: Some(orc::open_orc),
        appends: true,
        compressions: ORC_COMPRESSIONS,
    },
    Codec {
        format: Format::Feather,
        reader: Some(feather::read_feather),
        writer: Some(feather::open_feather),
        appends: true,
        compressions: FEATHER_COMPRESSIONS,
    },
    Codec {
        format: Format::Sas7bdat,
        reader: Some(sas::read_sas),
        writer: None,
        appends: false,
        compressions: &[],
    },
    Codec {
        format: Format::Stata,
        reader: Some(stata::read_stata),
        writer: Some(stata::open_stata),
        appends: false,
        compressions: &[],
    },
    Codec {
        format: Format::Spss,
        reader: Some(spss::read_spss),
        writer: None,
        appends: false,
        compressions: &[],
    },
    Codec {
        format: Format::Excel,
        reader: Some(streaming_reader::read_excel),
        writer: Some(fast_writer::open_excel),
        appends: true,
        compressions: &[],
    },
    Codec {
        format: Format::Html,
        reader: Some(html::read_html),
        writer: None,
        appends: false,
        compressions: &[],
    },
];

/// Dispatch entry for `format`
pub fn codec(format: Format) -> &'static Codec {
    &CODECS[format as usize]
}

impl Codec {
    pub fn open_reader(&self, path: &Path, options: &ReadOptions) -> Result<BatchStream> {
        let reader = self.reader.ok_or_else(|| {
            ConvertError::UnsupportedFormat(format!("no reader available for {}", self.format))
        })?;
        log::debug!("Opening {} reader for {}", self.format, path.display());
        reader(path, options)
    }

    pub fn open_writer(
        &self,
        path: &Path,
        schema: SchemaRef,
        options: &WriteOptions,
    ) -> Result<Box<dyn TableSink>> {
        let writer = self.writer.ok_or_else(|| {
            ConvertError::UnsupportedFormat(format!("no writer available for {}", self.format))
        })?;
        log::debug!("Opening {} writer for {}", self.format, path.display());
        writer(path, schema, options)
    }

    /// Fail unless this format can write with `spec`
    ///
    /// `none` and an absent kind are always accepted; a level alone is ignored.
    pub fn check_compression(&self, spec: &CompressionSpec) -> Result<()> {
        match spec.kind {
            None | Some(Compression::None) => Ok(()),
            Some(kind) if self.compressions.contains(&kind) => Ok(()),
            Some(kind) => Err(ConvertError::UnsupportedCompression {
                compression: kind.to_string(),
                format: self.format.to_string(),
            }),
        }
    }
}

fn read_csv(path: &Path, options: &ReadOptions) -> Result<BatchStream> {
    read_delimited(path, b',', options)
}

fn read_tsv(path: &Path, options: &ReadOptions) -> Result<BatchStream> {
    read_delimited(path, b'\t', options)
}

fn read_psv(path: &Path, options: &ReadOptions) -> Result<BatchStream> {
    read_delimited(path, b'|', options)
}

fn write_csv(path: &Path, schema: SchemaRef, options: &WriteOptions) -> Result<Box<dyn TableSink>> {
    Ok(Box::new(open_delimited(path, b',', schema, &options.compression)?))
}

fn write_tsv(path: &Path, schema: SchemaRef, options: &WriteOptions) -> Result<Box<dyn TableSink>> {
    Ok(Box::new(open_delimited(path, b'\t', schema, &options.compression)?))
}

fn write_psv(path: &Path, schema: SchemaRef, options: &WriteOptions) -> Result<Box<dyn TableSink>> {
    Ok(Box::new(open_delimited(path, b'|', schema, &options.compression)?))
}
