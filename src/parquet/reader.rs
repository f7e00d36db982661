//! Parquet file reader with streaming support

use crate::error::{ConvertError, Result};
use crate::request::ReadOptions;
use crate::stream::BatchStream;
use ::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use arrow::datatypes::SchemaRef;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Batch size used when the caller wants the whole file
const DEFAULT_BATCH_SIZE: usize = 65_536;

/// Parquet file handle exposing schema and row count before any data is read
pub struct ParquetReader {
    path: PathBuf,
    schema: SchemaRef,
    row_count: usize,
}

impl ParquetReader {
    /// Open a Parquet file and read its footer
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let builder = Self::builder(&path)?;

        let metadata = builder.metadata();
        let schema = builder.schema().clone();
        let row_count = metadata.file_metadata().num_rows().try_into().unwrap_or(0);

        Ok(Self {
            path,
            schema,
            row_count,
        })
    }

    fn builder(path: &Path) -> Result<ParquetRecordBatchReaderBuilder<File>> {
        let file = File::open(path)?;
        ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| {
            ConvertError::read(format!(
                "Failed to open Parquet file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Get column names from the Parquet schema
    pub fn column_names(&self) -> Vec<String> {
        self.schema
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect()
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Total number of rows according to the footer
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// Stream record batches of at most `batch_size` rows
    pub fn batches(&self, batch_size: Option<usize>) -> Result<BatchStream> {
        let reader = Self::builder(&self.path)?
            .with_batch_size(batch_size.unwrap_or(DEFAULT_BATCH_SIZE))
            .build()
            .map_err(|e| ConvertError::read(format!("Failed to build reader: {}", e)))?;

        let batches = reader.map(|batch| {
            batch.map_err(|e| ConvertError::read(format!("Failed to decode Parquet batch: {}", e)))
        });
        Ok(BatchStream::new(self.schema.clone(), batches))
    }
}

pub fn read_parquet(path: &Path, options: &ReadOptions) -> Result<BatchStream> {
    let reader = ParquetReader::open(path)?;
    log::debug!(
        "Parquet {} has {} row(s) in {} column(s)",
        path.display(),
        reader.row_count(),
        reader.schema().fields().len()
    );
    Ok(reader
        .batches(options.chunk_size)?
        .chunked(options.chunk_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::CompressionSpec;
    use crate::parquet::ParquetSink;
    use arrow::array::{ArrayRef, Int64Array, StringArray};
    use arrow::record_batch::RecordBatch;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn write_sample(path: &Path, rows: i64) -> Result<()> {
        let ids: Vec<i64> = (0..rows).collect();
        let names: Vec<String> = ids.iter().map(|i| format!("row{}", i)).collect();
        let batch = RecordBatch::try_from_iter([
            ("id", Arc::new(Int64Array::from(ids)) as ArrayRef),
            ("name", Arc::new(StringArray::from(names)) as ArrayRef),
        ])?;
        let mut sink = ParquetSink::create(path, batch.schema(), &CompressionSpec::default())?;
        sink.write(&batch)?;
        sink.close()
    }

    #[test]
    fn test_metadata() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("meta.parquet");
        write_sample(&path, 42)?;

        let reader = ParquetReader::open(&path)?;
        assert_eq!(reader.row_count(), 42);
        assert_eq!(reader.column_names(), vec!["id", "name"]);
        Ok(())
    }

    #[test]
    fn test_chunked_and_whole_reads() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("chunks.parquet");
        write_sample(&path, 25)?;

        let options = ReadOptions {
            chunk_size: Some(10),
            ..ReadOptions::default()
        };
        let sizes: Vec<usize> = read_parquet(&path, &options)?
            .map(|b| b.map(|b| b.num_rows()))
            .collect::<Result<_>>()?;
        assert_eq!(sizes, vec![10, 10, 5]);

        let whole: Vec<_> = read_parquet(&path, &ReadOptions::default())?.collect::<Result<_>>()?;
        assert_eq!(whole.len(), 1);
        assert_eq!(whole[0].num_rows(), 25);
        Ok(())
    }

    #[test]
    fn test_not_parquet_is_read_error() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("bogus.parquet");
        std::fs::write(&path, b"definitely not parquet")?;
        assert!(matches!(
            ParquetReader::open(&path),
            Err(ConvertError::Read { .. })
        ));
        Ok(())
    }
}
