//! Feather (Arrow IPC) reading and writing

use crate::codec::TableSink;
use crate::error::{ConvertError, Result};
use crate::format::Compression;
use crate::request::{ReadOptions, WriteOptions};
use crate::stream::BatchStream;
use arrow::datatypes::SchemaRef;
use arrow::ipc::reader::{FileReader, StreamReader};
use arrow::ipc::writer::{FileWriter, IpcWriteOptions};
use arrow::ipc::CompressionType;
use arrow::record_batch::RecordBatch;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::Path;

const FILE_MAGIC: &[u8; 6] = b"ARROW1";

/// Open an IPC file (Feather v2) or, failing the magic check, an IPC stream
pub fn read_feather(path: &Path, options: &ReadOptions) -> Result<BatchStream> {
    let mut magic = [0u8; 6];
    let is_file_format = {
        let mut file = File::open(path)?;
        file.read_exact(&mut magic).is_ok() && &magic == FILE_MAGIC
    };

    let file = File::open(path)?;
    let stream = if is_file_format {
        let reader = FileReader::try_new(BufReader::new(file), None)
            .map_err(|e| ConvertError::read(format!("Failed to open Feather file: {}", e)))?;
        log::debug!("Feather file with {} record batch(es)", reader.num_batches());
        BatchStream::new(reader.schema(), reader.map(map_batch))
    } else {
        let reader = StreamReader::try_new(BufReader::new(file), None)
            .map_err(|e| ConvertError::read(format!("Failed to open Arrow stream: {}", e)))?;
        BatchStream::new(reader.schema(), reader.map(map_batch))
    };
    Ok(stream.chunked(options.chunk_size))
}

fn map_batch(
    batch: std::result::Result<RecordBatch, arrow::error::ArrowError>,
) -> Result<RecordBatch> {
    batch.map_err(|e| ConvertError::read(format!("Failed to decode Arrow batch: {}", e)))
}

/// Feather v2 output, one IPC record batch per chunk
pub struct FeatherSink {
    writer: FileWriter<BufWriter<File>>,
}

impl FeatherSink {
    pub fn create<P: AsRef<Path>>(
        path: P,
        schema: SchemaRef,
        compression: Option<Compression>,
    ) -> Result<Self> {
        let ipc_compression = match compression {
            None | Some(Compression::None) => None,
            Some(Compression::Lz4) => Some(CompressionType::LZ4_FRAME),
            Some(Compression::Zstd) => Some(CompressionType::ZSTD),
            Some(other) => {
                return Err(ConvertError::UnsupportedCompression {
                    compression: other.to_string(),
                    format: "feather".to_string(),
                })
            }
        };
        let options = IpcWriteOptions::default().try_with_compression(ipc_compression)?;

        let path = path.as_ref();
        let file = File::create(path)
            .map_err(|e| {
                ConvertError::Write(format!("Failed to create {}: {}", path.display(), e))
            })?;
        let writer = FileWriter::try_new_with_options(BufWriter::new(file), &schema, options)?;
        Ok(FeatherSink { writer })
    }
}

impl TableSink for FeatherSink {
    fn write_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        self.writer.write(batch)?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.writer.finish()?;
        Ok(())
    }
}

pub fn open_feather(
    path: &Path,
    schema: SchemaRef,
    options: &WriteOptions,
) -> Result<Box<dyn TableSink>> {
    Ok(Box::new(FeatherSink::create(
        path,
        schema,
        options.compression.kind,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, ArrayRef, BooleanArray, Int32Array};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn sample() -> RecordBatch {
        RecordBatch::try_from_iter([
            ("n", Arc::new(Int32Array::from(vec![1, 2, 3, 4])) as ArrayRef),
            (
                "flag",
                Arc::new(BooleanArray::from(vec![Some(true), None, Some(false), None])) as ArrayRef,
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_compressed_roundtrip() -> Result<()> {
        let dir = tempdir()?;
        for kind in [None, Some(Compression::Lz4), Some(Compression::Zstd)] {
            let path = dir.path().join("t.feather");
            let batch = sample();
            let mut sink: Box<dyn TableSink> =
                Box::new(FeatherSink::create(&path, batch.schema(), kind)?);
            sink.write_batch(&batch.slice(0, 2))?;
            sink.write_batch(&batch.slice(2, 2))?;
            sink.finish()?;

            let back = read_feather(&path, &ReadOptions::default())?.collect_batch()?;
            assert_eq!(back.num_rows(), 4);
            assert!(back.column(1).is_null(3));
        }
        Ok(())
    }

    #[test]
    fn test_snappy_rejected() -> Result<()> {
        let dir = tempdir()?;
        let result = FeatherSink::create(
            dir.path().join("x.feather"),
            sample().schema(),
            Some(Compression::Snappy),
        );
        assert!(matches!(
            result,
            Err(ConvertError::UnsupportedCompression { .. })
        ));
        Ok(())
    }
}
