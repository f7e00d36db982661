//! Delimited text reading with streaming support and decompression

use crate::csv::{CsvParser, GZIP_MAGIC, ZIP_MAGIC, ZSTD_MAGIC};
use crate::error::{ConvertError, Result};
use crate::infer::text_stream;
use crate::request::ReadOptions;
use crate::stream::BatchStream;
use flate2::read::MultiGzDecoder;
use s_zip::StreamingZipReader;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};

/// Delimited text reader yielding one `Vec<String>` per record
///
/// Gzip streams, Zstandard frames and ZIP containers are detected from the
/// leading bytes, whatever the extension.
///
/// # Examples
///
/// ```no_run
/// use tabconv::csv_reader::CsvReader;
///
/// let mut reader = CsvReader::open("data.tsv")?.delimiter(b'\t');
/// while let Some(record) = reader.read_row()? {
///     println!("{:?}", record);
/// }
/// # Ok::<(), tabconv::error::ConvertError>(())
/// ```
pub struct CsvReader {
    source: Box<dyn BufRead>,
    parser: CsvParser,
    line_buffer: Vec<u8>,
    line_number: u64,
    row_count: u64,
    delimiter: u8,
    quote_char: u8,
}

impl CsvReader {
    /// Open a delimited file, decompressing gzip, zstd or ZIP content
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let mut file = File::open(path_ref)
            .map_err(|e| {
                ConvertError::read(format!("Failed to open {}: {}", path_ref.display(), e))
            })?;

        let mut magic = [0u8; 4];
        let sniffed = read_prefix(&mut file, &mut magic)?;
        drop(file);

        let source: Box<dyn BufRead> = if sniffed == 4 && magic == ZIP_MAGIC {
            Box::new(Cursor::new(Self::read_zip_entry(path_ref)?))
        } else if sniffed >= 2 && magic[..2] == GZIP_MAGIC {
            let file = BufReader::new(File::open(path_ref)?);
            Box::new(BufReader::with_capacity(64 * 1024, MultiGzDecoder::new(file)))
        } else if sniffed == 4 && magic == ZSTD_MAGIC {
            let decoder = zstd::stream::read::Decoder::new(File::open(path_ref)?)
                .map_err(|e| ConvertError::read(format!("Failed to start zstd stream: {}", e)))?;
            Box::new(BufReader::with_capacity(64 * 1024, decoder))
        } else {
            let file = File::open(path_ref)?;
            Box::new(BufReader::with_capacity(64 * 1024, file))
        };

        Ok(CsvReader {
            source,
            parser: CsvParser::new(b',', b'"'),
            line_buffer: Vec::with_capacity(1024),
            line_number: 0,
            row_count: 0,
            delimiter: b',',
            quote_char: b'"',
        })
    }

    fn read_zip_entry(path: &Path) -> Result<Vec<u8>> {
        let mut zip = StreamingZipReader::open(path)
            .map_err(|e| ConvertError::read(format!("Failed to open ZIP: {}", e)))?;

        let entry_name = zip
            .entries()
            .iter()
            .find(|e| {
                let name = e.name.to_ascii_lowercase();
                name.ends_with(".csv") || name.ends_with(".tsv") || name.ends_with(".psv")
            })
            .or_else(|| zip.entries().first())
            .ok_or_else(|| ConvertError::read("No entry found in archive"))?
            .name
            .clone();

        zip.read_entry_by_name(&entry_name)
            .map_err(|e| ConvertError::read(format!("Failed to read ZIP entry: {}", e)))
    }

    /// Set custom delimiter (builder pattern)
    pub fn delimiter(mut self, delim: u8) -> Self {
        self.delimiter = delim;
        self.parser = CsvParser::new(self.delimiter, self.quote_char);
        self
    }

    /// Set custom quote character (builder pattern)
    pub fn quote_char(mut self, quote: u8) -> Self {
        self.quote_char = quote;
        self.parser = CsvParser::new(self.delimiter, self.quote_char);
        self
    }

    /// Read the next record
    ///
    /// Blank lines between records are skipped. Returns `Ok(None)` at EOF.
    pub fn read_row(&mut self) -> Result<Option<Vec<String>>> {
        loop {
            self.line_buffer.clear();
            let bytes_read = self
                .source
                .read_until(b'\n', &mut self.line_buffer)
                .map_err(|e| ConvertError::read(format!("Failed to read line: {}", e)))?;

            if bytes_read == 0 {
                let tail = self.parser.finish();
                if tail.is_some() {
                    self.row_count += 1;
                }
                return Ok(tail);
            }
            self.line_number += 1;

            if self.line_buffer.ends_with(b"\n") {
                self.line_buffer.pop();
                if self.line_buffer.ends_with(b"\r") {
                    self.line_buffer.pop();
                }
            }

            let mut line = std::str::from_utf8(&self.line_buffer).map_err(|e| {
                ConvertError::read(format!(
                    "line {} is not valid UTF-8: {}",
                    self.line_number, e
                ))
            })?;
            if self.line_number == 1 {
                line = line.strip_prefix('\u{feff}').unwrap_or(line);
            }

            if line.is_empty() && !self.parser.is_pending() {
                continue;
            }

            if let Some(fields) = self.parser.push_line(line) {
                self.row_count += 1;
                return Ok(Some(fields));
            }
        }
    }

    /// Number of records read so far
    pub fn row_count(&self) -> u64 {
        self.row_count
    }
}

impl Iterator for CsvReader {
    type Item = Result<Vec<String>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_row().transpose()
    }
}

fn read_prefix(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Open a delimited file as a typed batch stream
///
/// The first record is the header; an empty file yields a stream with no
/// columns and no rows. Chunked reads open the file twice: once to infer
/// column types, once to stream the rows.
pub fn read_delimited(path: &Path, delimiter: u8, options: &ReadOptions) -> Result<BatchStream> {
    let path: PathBuf = path.to_path_buf();
    let open =
        |path: &Path| -> Result<CsvReader> { Ok(CsvReader::open(path)?.delimiter(delimiter)) };

    let header = open(&path)?.read_row()?.unwrap_or_default();
    log::debug!(
        "Reading delimited file {} with {} column(s)",
        path.display(),
        header.len()
    );
    let data_rows = || -> Result<CsvReader> {
        let mut reader = open(&path)?;
        reader.read_row()?;
        Ok(reader)
    };
    text_stream(header, data_rows, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int64Array, StringArray};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_csv(content: &str) -> Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        file.write_all(content.as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    #[test]
    fn test_read_rows() -> Result<()> {
        let file = temp_csv("Name,Age\r\nAlice,30\n\nBob,25\n")?;
        let mut reader = CsvReader::open(file.path())?;
        let rows: Vec<_> = reader.by_ref().collect::<Result<_>>()?;

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], vec!["Name", "Age"]);
        assert_eq!(rows[2], vec!["Bob", "25"]);
        assert_eq!(reader.row_count(), 3);
        Ok(())
    }

    #[test]
    fn test_multiline_quoted_field() -> Result<()> {
        let file = temp_csv("id,note\n1,\"first\n\nsecond\"\n2,plain\n")?;
        let rows: Vec<_> = CsvReader::open(file.path())?.collect::<Result<_>>()?;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1][1], "first\n\nsecond");
        Ok(())
    }

    #[test]
    fn test_bom_is_stripped() -> Result<()> {
        let file = temp_csv("\u{feff}a,b\n1,2\n")?;
        let rows: Vec<_> = CsvReader::open(file.path())?.collect::<Result<_>>()?;
        assert_eq!(rows[0][0], "a");
        Ok(())
    }

    #[test]
    fn test_read_delimited_types_columns() -> Result<()> {
        let file = temp_csv("a\tb\n1\tx\n2\ty\n3\tz\n")?;
        let batch = read_delimited(file.path(), b'\t', &ReadOptions::default())?.collect_batch()?;
        assert_eq!(batch.num_rows(), 3);
        let a = batch.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        let b = batch.column(1).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(a.value(1), 2);
        assert_eq!(b.value(2), "z");
        Ok(())
    }

    #[test]
    fn test_gzip_input_is_decoded() -> Result<()> {
        use flate2::write::GzEncoder;

        // Two concatenated members, as `cat a.gz b.gz` produces
        let mut bytes = Vec::new();
        for part in ["a,b\n1,x\n", "2,y\n"] {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(part.as_bytes())?;
            bytes.extend(encoder.finish()?);
        }
        let mut file = NamedTempFile::new()?;
        file.write_all(&bytes)?;
        file.flush()?;

        let batch = read_delimited(file.path(), b',', &ReadOptions::default())?.collect_batch()?;
        assert_eq!(batch.num_rows(), 2);
        let b = batch.column(1).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(b.value(1), "y");
        Ok(())
    }

    #[test]
    fn test_zstd_input_is_decoded() -> Result<()> {
        let bytes = zstd::stream::encode_all("a\n1\n2\n".as_bytes(), 3)?;
        let mut file = NamedTempFile::new()?;
        file.write_all(&bytes)?;
        file.flush()?;

        let rows: Vec<_> = CsvReader::open(file.path())?.collect::<Result<_>>()?;
        assert_eq!(rows, vec![vec!["a"], vec!["1"], vec!["2"]]);
        Ok(())
    }

    #[test]
    fn test_chunked_read_matches_whole_read() -> Result<()> {
        let file = temp_csv("a,b\n1,x\n2,y\n3,z\nfour,w\n")?;
        let whole = read_delimited(file.path(), b',', &ReadOptions::default())?.collect_batch()?;
        let options = ReadOptions {
            chunk_size: Some(2),
            ..ReadOptions::default()
        };
        let chunked = read_delimited(file.path(), b',', &options)?.collect_batch()?;
        assert_eq!(chunked, whole);
        Ok(())
    }

    #[test]
    fn test_empty_file() -> Result<()> {
        let file = temp_csv("")?;
        let stream = read_delimited(file.path(), b',', &ReadOptions::default())?;
        assert_eq!(stream.schema().fields().len(), 0);
        Ok(())
    }
}
