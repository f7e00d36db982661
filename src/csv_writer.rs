//! Delimited text writing with streaming support and compression

use crate::codec::TableSink;
use crate::csv::{CompressionMethod, CsvEncoder};
use crate::error::{ConvertError, Result};
use crate::format::{Compression, CompressionSpec};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;
use s_zip::StreamingZipWriter;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Delimited text writer streaming records to disk, optionally compressed
///
/// Memory stays bounded by one encoded batch regardless of file size.
///
/// # Compression
///
/// - `gzip` → gzip stream (level 0-9, default 6)
/// - `zstd` → Zstandard frame (level 1-21, default 3)
///
/// A target ending in `.zip` gets a ZIP container holding one Deflate
/// (`gzip`) or Zstd (`zstd`) entry instead. Without an explicit compression
/// the kind follows the extension: `.gz`, `.zst` or `.zip`.
///
/// ```no_run
/// use tabconv::csv_writer::CsvWriter;
/// use tabconv::format::{Compression, CompressionSpec};
///
/// let spec = CompressionSpec::new(Some(Compression::Zstd), Some(9));
/// let mut writer = CsvWriter::create("data.csv.zst", b',', &spec)?;
/// writer.write_record(["Name", "Age"])?;
/// writer.write_record(["Alice", "30"])?;
/// writer.save()?;
/// # Ok::<(), tabconv::error::ConvertError>(())
/// ```
pub struct CsvWriter {
    output: Option<Output>,
    row_count: u64,
    buffer: Vec<u8>,
    encoder: CsvEncoder,
}

enum Output {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
    Zstd(zstd::stream::write::Encoder<'static, BufWriter<File>>),
    Zip(StreamingZipWriter<File>),
}

impl Output {
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Output::Plain(w) => w.write_all(data),
            Output::Gzip(w) => w.write_all(data),
            Output::Zstd(w) => w.write_all(data),
            Output::Zip(zip) => zip
                .write_data(data)
                .map_err(|e| std::io::Error::other(e.to_string())),
        }
    }

    fn finish(self) -> Result<()> {
        let flushed = match self {
            Output::Plain(mut w) => w.flush(),
            Output::Gzip(w) => w.finish().and_then(|mut inner| inner.flush()),
            Output::Zstd(w) => w.finish().and_then(|mut inner| inner.flush()),
            Output::Zip(zip) => {
                return zip
                    .finish()
                    .map(|_| ())
                    .map_err(|e| ConvertError::Write(format!("Failed to finish ZIP: {}", e)))
            }
        };
        flushed.map_err(|e| ConvertError::Write(format!("Failed to finish file: {}", e)))
    }
}

/// Compression implied by the file name when none was requested
fn compression_from_extension(path: &Path) -> Option<Compression> {
    let name = path.file_name()?.to_str()?.to_ascii_lowercase();
    if name.ends_with(".gz") || name.ends_with(".zip") {
        Some(Compression::Gzip)
    } else if name.ends_with(".zst") {
        Some(Compression::Zstd)
    } else {
        None
    }
}

fn is_zip_target(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"))
}

impl CsvWriter {
    /// Create a writer; `spec` picks plain, gzip, zstd or ZIP output
    pub fn create<P: AsRef<Path>>(path: P, delimiter: u8, spec: &CompressionSpec) -> Result<Self> {
        let path_ref = path.as_ref();
        let encoder = CsvEncoder::new(delimiter, b'"');
        let kind = spec.kind.or_else(|| compression_from_extension(path_ref));

        let output = match kind {
            Some(Compression::Gzip) if is_zip_target(path_ref) => Output::Zip(Self::zip_container(
                path_ref,
                CompressionMethod::Deflate,
                spec.level_in(0..=9, 6)?,
            )?),
            Some(Compression::Zstd) if is_zip_target(path_ref) => Output::Zip(Self::zip_container(
                path_ref,
                CompressionMethod::Zstd,
                spec.level_in(1..=21, 3)?,
            )?),
            Some(Compression::Gzip) => {
                let level = spec.level_in(0..=9, 6)?;
                Output::Gzip(GzEncoder::new(create_file(path_ref)?, GzLevel::new(level)))
            }
            Some(Compression::Zstd) => {
                let level = spec.level_in(1..=21, 3)?;
                let file = create_file(path_ref)?;
                let encoder = zstd::stream::write::Encoder::new(file, level as i32).map_err(|e| {
                    ConvertError::Write(format!("Failed to start zstd stream: {}", e))
                })?;
                Output::Zstd(encoder)
            }
            Some(Compression::None) | None => Output::Plain(create_file(path_ref)?),
            Some(other) => {
                return Err(ConvertError::UnsupportedCompression {
                    compression: other.to_string(),
                    format: "delimited text".to_string(),
                })
            }
        };

        Ok(CsvWriter {
            output: Some(output),
            row_count: 0,
            buffer: Vec::with_capacity(4096),
            encoder,
        })
    }

    fn zip_container(
        path: &Path,
        method: CompressionMethod,
        level: u32,
    ) -> Result<StreamingZipWriter<File>> {
        let mut zip = StreamingZipWriter::with_method(path, method, level)
            .map_err(|e| ConvertError::Write(format!("Failed to create ZIP writer: {}", e)))?;

        // Entry name: the file name without its container suffix
        let entry_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .map(|s| s.trim_end_matches(".zip").to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "data.csv".to_string());

        zip.start_entry(&entry_name)
            .map_err(|e| ConvertError::Write(format!("Failed to start ZIP entry: {}", e)))?;
        Ok(zip)
    }

    /// Write one record of strings
    pub fn write_record<I, S>(&mut self, fields: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.buffer.clear();
        self.encoder.encode_record(fields, &mut self.buffer);
        self.buffer.push(b'\n');
        self.row_count += 1;
        self.flush_buffer()
    }

    /// Write every row of `batch`; nulls become empty fields
    pub fn write_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        let options = FormatOptions::default().with_null("");
        let formatters = batch
            .columns()
            .iter()
            .map(|column| ArrayFormatter::try_new(column.as_ref(), &options))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        self.buffer.clear();
        let mut field = String::new();
        for row in 0..batch.num_rows() {
            for (i, formatter) in formatters.iter().enumerate() {
                if i > 0 {
                    self.buffer.push(self.delimiter_byte());
                }
                field.clear();
                write!(field, "{}", formatter.value(row))
                    .map_err(|e| ConvertError::Write(format!("Failed to format value: {}", e)))?;
                self.encoder.encode_field(&field, &mut self.buffer);
            }
            self.buffer.push(b'\n');

            // Keep the buffer bounded for wide batches
            if self.buffer.len() >= 1024 * 1024 {
                self.flush_buffer()?;
            }
        }
        self.row_count += batch.num_rows() as u64;
        self.flush_buffer()
    }

    fn delimiter_byte(&self) -> u8 {
        self.encoder.delimiter()
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if let Some(output) = self.output.as_mut() {
            output
                .write_all(&self.buffer)
                .map_err(|e| ConvertError::Write(format!("Failed to write to file: {}", e)))?;
        }
        self.buffer.clear();
        Ok(())
    }

    /// Records written so far, header included
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Finalize the file; must be called to produce a complete compressed stream
    pub fn save(mut self) -> Result<()> {
        match self.output.take() {
            Some(output) => output.finish(),
            None => Ok(()),
        }
    }
}

fn create_file(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path)
        .map_err(|e| ConvertError::Write(format!("Failed to create {}: {}", path.display(), e)))?;
    Ok(BufWriter::with_capacity(64 * 1024, file))
}

impl TableSink for CsvWriter {
    fn write_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        CsvWriter::write_batch(self, batch)
    }

    fn finish(self: Box<Self>) -> Result<()> {
        self.save()
    }
}

/// Create a delimited writer and emit the header row
pub fn open_delimited(
    path: &Path,
    delimiter: u8,
    schema: SchemaRef,
    spec: &CompressionSpec,
) -> Result<CsvWriter> {
    let mut writer = CsvWriter::create(path, delimiter, spec)?;
    writer.write_record(schema.fields().iter().map(|f| f.name().as_str()))?;
    Ok(writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csv_reader::CsvReader;
    use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray};
    use std::io::Read;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn sample_batch() -> RecordBatch {
        RecordBatch::try_from_iter([
            ("id", Arc::new(Int64Array::from(vec![1, 2])) as ArrayRef),
            (
                "name",
                Arc::new(StringArray::from(vec![Some("a,b"), None])) as ArrayRef,
            ),
            ("score", Arc::new(Float64Array::from(vec![1.0, 2.5])) as ArrayRef),
        ])
        .unwrap()
    }

    #[test]
    fn test_batch_to_plain_csv() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("out.csv");
        let batch = sample_batch();

        let mut writer = open_delimited(&path, b',', batch.schema(), &CompressionSpec::default())?;
        writer.write_batch(&batch)?;
        writer.save()?;

        let content = std::fs::read_to_string(&path)?;
        assert_eq!(content, "id,name,score\n1,\"a,b\",1.0\n2,,2.5\n");
        Ok(())
    }

    #[test]
    fn test_gzip_is_a_standard_gzip_stream() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("out.csv.gz");
        let spec = CompressionSpec::new(Some(Compression::Gzip), Some(9));

        let mut writer = CsvWriter::create(&path, b',', &spec)?;
        writer.write_record(["a", "b"])?;
        writer.write_record(["1", "x"])?;
        writer.save()?;

        let bytes = std::fs::read(&path)?;
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        let mut text = String::new();
        flate2::read::GzDecoder::new(bytes.as_slice()).read_to_string(&mut text)?;
        assert_eq!(text, "a,b\n1,x\n");

        let rows: Vec<_> = CsvReader::open(&path)?.collect::<Result<_>>()?;
        assert_eq!(rows, vec![vec!["a", "b"], vec!["1", "x"]]);
        Ok(())
    }

    #[test]
    fn test_zstd_is_a_standard_frame() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("out.csv.zst");
        let spec = CompressionSpec::new(Some(Compression::Zstd), None);

        let mut writer = CsvWriter::create(&path, b',', &spec)?;
        writer.write_record(["a", "b"])?;
        writer.save()?;

        let decoded = zstd::stream::decode_all(std::fs::File::open(&path)?)?;
        assert_eq!(decoded, b"a,b\n");
        let rows: Vec<_> = CsvReader::open(&path)?.collect::<Result<_>>()?;
        assert_eq!(rows, vec![vec!["a", "b"]]);
        Ok(())
    }

    #[test]
    fn test_extension_implies_compression() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("out.tsv.gz");

        let mut writer = CsvWriter::create(&path, b'\t', &CompressionSpec::default())?;
        writer.write_record(["a"])?;
        writer.save()?;
        assert_eq!(&std::fs::read(&path)?[..2], &[0x1f, 0x8b]);

        let plain = dir.path().join("forced.csv.gz");
        let spec = CompressionSpec::new(Some(Compression::None), None);
        let mut writer = CsvWriter::create(&plain, b',', &spec)?;
        writer.write_record(["a"])?;
        writer.save()?;
        assert_eq!(std::fs::read_to_string(&plain)?, "a\n");
        Ok(())
    }

    #[test]
    fn test_zip_target_gets_container() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("out.psv.zip");
        let spec = CompressionSpec::new(Some(Compression::Gzip), Some(9));

        let mut writer = CsvWriter::create(&path, b'|', &spec)?;
        writer.write_record(["a|b", "c"])?;
        writer.save()?;

        assert_eq!(&std::fs::read(&path)?[..4], b"PK\x03\x04");
        let rows: Vec<_> = CsvReader::open(&path)?
            .delimiter(b'|')
            .collect::<Result<_>>()?;
        assert_eq!(rows, vec![vec!["a|b", "c"]]);
        Ok(())
    }

    #[test]
    fn test_snappy_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        let spec = CompressionSpec::new(Some(Compression::Snappy), None);
        assert!(matches!(
            CsvWriter::create(dir.path().join("x.csv"), b',', &spec),
            Err(ConvertError::UnsupportedCompression { .. })
        ));
        Ok(())
    }
}
