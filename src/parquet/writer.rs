//! Streaming Parquet writer

use crate::codec::TableSink;
use crate::error::{ConvertError, Result};
use crate::format::{Compression, CompressionSpec};
use crate::request::WriteOptions;
use ::parquet::arrow::ArrowWriter;
use ::parquet::basic::{Compression as ParquetCompression, GzipLevel, ZstdLevel};
use ::parquet::file::properties::WriterProperties;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use std::fs::File;
use std::path::Path;

/// Parquet output; every batch is handed to the Arrow writer as it arrives
pub struct ParquetSink {
    writer: ArrowWriter<File>,
    rows: usize,
}

impl ParquetSink {
    pub fn create<P: AsRef<Path>>(
        path: P,
        schema: SchemaRef,
        spec: &CompressionSpec,
    ) -> Result<Self> {
        let path = path.as_ref();
        let properties = WriterProperties::builder()
            .set_compression(parquet_compression(spec)?)
            .build();

        let file = File::create(path)
            .map_err(|e| {
                ConvertError::Write(format!("Failed to create {}: {}", path.display(), e))
            })?;
        let writer = ArrowWriter::try_new(file, schema, Some(properties))?;
        Ok(ParquetSink { writer, rows: 0 })
    }

    pub fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        self.writer.write(batch)?;
        self.rows += batch.num_rows();
        Ok(())
    }

    /// Write the footer and close the file
    pub fn close(self) -> Result<()> {
        let rows = self.rows;
        self.writer.close()?;
        log::debug!("Parquet writer closed after {} row(s)", rows);
        Ok(())
    }
}

impl TableSink for ParquetSink {
    fn write_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        self.write(batch)
    }

    fn finish(self: Box<Self>) -> Result<()> {
        self.close()
    }
}

/// Map the requested compression; snappy when none was asked for
fn parquet_compression(spec: &CompressionSpec) -> Result<ParquetCompression> {
    let level_error = |e: ::parquet::errors::ParquetError| {
        ConvertError::InvalidArgument(format!("invalid Parquet compression level: {}", e))
    };
    let compression = match spec.kind {
        None | Some(Compression::Snappy) => ParquetCompression::SNAPPY,
        Some(Compression::None) => ParquetCompression::UNCOMPRESSED,
        Some(Compression::Lz4) => ParquetCompression::LZ4_RAW,
        Some(Compression::Gzip) => {
            let level = match spec.level {
                Some(level) => GzipLevel::try_new(level).map_err(level_error)?,
                None => GzipLevel::default(),
            };
            ParquetCompression::GZIP(level)
        }
        Some(Compression::Zstd) => {
            let level = match spec.level {
                Some(level) => {
                    let level = i32::try_from(level).unwrap_or(i32::MAX);
                    ZstdLevel::try_new(level).map_err(level_error)?
                }
                None => ZstdLevel::default(),
            };
            ParquetCompression::ZSTD(level)
        }
    };
    Ok(compression)
}

pub fn open_parquet(
    path: &Path,
    schema: SchemaRef,
    options: &WriteOptions,
) -> Result<Box<dyn TableSink>> {
    Ok(Box::new(ParquetSink::create(path, schema, &options.compression)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parquet::ParquetReader;
    use arrow::array::{ArrayRef, Float64Array};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_compression_mapping() -> Result<()> {
        assert_eq!(
            parquet_compression(&CompressionSpec::default())?,
            ParquetCompression::SNAPPY
        );
        assert_eq!(
            parquet_compression(&CompressionSpec::new(Some(Compression::None), Some(3)))?,
            ParquetCompression::UNCOMPRESSED
        );
        assert!(matches!(
            parquet_compression(&CompressionSpec::new(Some(Compression::Gzip), Some(42))),
            Err(ConvertError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn test_each_compression_writes_readable_file() -> Result<()> {
        let dir = tempdir()?;
        let batch = RecordBatch::try_from_iter([(
            "x",
            Arc::new(Float64Array::from(vec![1.5, 2.5, 3.5])) as ArrayRef,
        )])?;

        for (i, kind) in [
            Compression::None,
            Compression::Snappy,
            Compression::Gzip,
            Compression::Zstd,
            Compression::Lz4,
        ]
        .into_iter()
        .enumerate()
        {
            let path = dir.path().join(format!("c{}.parquet", i));
            let spec = CompressionSpec::new(Some(kind), None);
            let mut sink = ParquetSink::create(&path, batch.schema(), &spec)?;
            sink.write(&batch)?;
            sink.close()?;
            assert_eq!(ParquetReader::open(&path)?.row_count(), 3);
        }
        Ok(())
    }
}
