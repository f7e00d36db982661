//! Conversion requests and per-codec options

use crate::error::{ConvertError, Result};
use crate::format::CompressionSpec;
use crate::schema::SchemaDescription;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Rows sampled by schema export unless the caller asks otherwise
pub const DEFAULT_SCHEMA_SAMPLE_ROWS: usize = 10_000;

/// Half-open row range `[start, end)` over the 0-based data rows
///
/// Parsed from `"START:END"` where either side may be omitted.
///
/// ```
/// use tabconv::request::RowRange;
///
/// let range: RowRange = "10:20".parse().unwrap();
/// assert_eq!(range.start, 10);
/// assert_eq!(range.end, Some(20));
///
/// let tail: RowRange = "5:".parse().unwrap();
/// assert_eq!(tail.end, None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRange {
    pub start: usize,
    pub end: Option<usize>,
}

impl RowRange {
    pub fn new(start: usize, end: Option<usize>) -> Result<Self> {
        if let Some(end) = end {
            if start > end {
                return Err(ConvertError::InvalidArgument(format!(
                    "row range start {} is after end {}",
                    start, end
                )));
            }
        }
        Ok(RowRange { start, end })
    }

    /// Every row
    pub fn full() -> Self {
        RowRange {
            start: 0,
            end: None,
        }
    }

    /// First `n` rows
    pub fn head(n: usize) -> Self {
        RowRange {
            start: 0,
            end: Some(n),
        }
    }
}

impl FromStr for RowRange {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self> {
        let (start, end) = s.split_once(':').ok_or_else(|| {
            ConvertError::InvalidArgument(format!(
                "row range '{}' must look like START:END",
                s
            ))
        })?;

        let parse_bound = |text: &str| -> Result<Option<usize>> {
            let text = text.trim();
            if text.is_empty() {
                return Ok(None);
            }
            text.parse::<usize>().map(Some).map_err(|_| {
                ConvertError::InvalidArgument(format!(
                    "row range bound '{}' is not a non-negative integer",
                    text
                ))
            })
        };

        RowRange::new(parse_bound(start)?.unwrap_or(0), parse_bound(end)?)
    }
}

impl fmt::Display for RowRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}:{}", self.start, end),
            None => write!(f, "{}:", self.start),
        }
    }
}

/// Options handed to a format reader
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Rows per buffer, or `None` for one buffer holding the whole file
    pub chunk_size: Option<usize>,
    /// Excel worksheet to read instead of the first one
    pub sheet_name: Option<String>,
    /// 0-based HTML table index
    pub table_number: usize,
    /// Keep string columns of binary statistical files as raw bytes
    pub keep_bytes: bool,
    /// Stop decoding text sources after this many data rows
    pub row_limit: Option<usize>,
    /// Columns of text sources left as strings for the caller to cast
    pub declared_types: Option<SchemaDescription>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        ReadOptions {
            chunk_size: None,
            sheet_name: None,
            table_number: 0,
            keep_bytes: false,
            row_limit: None,
            declared_types: None,
        }
    }
}

/// Options handed to a format writer
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub compression: CompressionSpec,
    /// Worksheet name for Excel output
    pub sheet_name: Option<String>,
}

/// Everything needed to run one conversion
///
/// # Examples
///
/// ```no_run
/// use tabconv::request::ConversionRequest;
///
/// let request = ConversionRequest::new("data.csv", "data.parquet")
///     .rows("0:1000".parse().unwrap())
///     .input_chunk_size(500);
/// ```
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub input_format: Option<String>,
    pub output_format: Option<String>,
    pub rows: Option<RowRange>,
    pub input_chunk_size: Option<usize>,
    pub output_chunk_size: Option<usize>,
    pub compression: CompressionSpec,
    pub sheet_name: Option<String>,
    pub table_number: Option<usize>,
    pub keep_bytes: bool,
    pub schema_file: Option<PathBuf>,
}

impl ConversionRequest {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(input: P, output: Q) -> Self {
        ConversionRequest {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            input_format: None,
            output_format: None,
            rows: None,
            input_chunk_size: None,
            output_chunk_size: None,
            compression: CompressionSpec::default(),
            sheet_name: None,
            table_number: None,
            keep_bytes: false,
            schema_file: None,
        }
    }

    pub fn input_format(mut self, format: impl Into<String>) -> Self {
        self.input_format = Some(format.into());
        self
    }

    pub fn output_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = Some(format.into());
        self
    }

    pub fn rows(mut self, range: RowRange) -> Self {
        self.rows = Some(range);
        self
    }

    pub fn input_chunk_size(mut self, size: usize) -> Self {
        self.input_chunk_size = Some(size);
        self
    }

    pub fn output_chunk_size(mut self, size: usize) -> Self {
        self.output_chunk_size = Some(size);
        self
    }

    pub fn compression(mut self, compression: CompressionSpec) -> Self {
        self.compression = compression;
        self
    }

    pub fn sheet_name(mut self, name: impl Into<String>) -> Self {
        self.sheet_name = Some(name.into());
        self
    }

    pub fn table_number(mut self, index: usize) -> Self {
        self.table_number = Some(index);
        self
    }

    pub fn keep_bytes(mut self, keep: bool) -> Self {
        self.keep_bytes = keep;
        self
    }

    pub fn schema_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.schema_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Reject sizes that can never make progress
    pub(crate) fn validate(&self) -> Result<()> {
        if self.input_chunk_size == Some(0) {
            return Err(ConvertError::InvalidArgument(
                "input chunk size must be at least 1".to_string(),
            ));
        }
        if self.output_chunk_size == Some(0) {
            return Err(ConvertError::InvalidArgument(
                "output chunk size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Schema export request: sample `sample_rows` rows of `input`, write JSON to `output`
#[derive(Debug, Clone)]
pub struct SchemaRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub input_format: Option<String>,
    pub sample_rows: usize,
    pub sheet_name: Option<String>,
    pub table_number: Option<usize>,
}

impl SchemaRequest {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(input: P, output: Q) -> Self {
        SchemaRequest {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            input_format: None,
            sample_rows: DEFAULT_SCHEMA_SAMPLE_ROWS,
            sheet_name: None,
            table_number: None,
        }
    }

    pub fn input_format(mut self, format: impl Into<String>) -> Self {
        self.input_format = Some(format.into());
        self
    }

    pub fn sample_rows(mut self, rows: usize) -> Self {
        self.sample_rows = rows;
        self
    }

    pub fn sheet_name(mut self, name: impl Into<String>) -> Self {
        self.sheet_name = Some(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_range_forms() -> Result<()> {
        assert_eq!("0:2".parse::<RowRange>()?, RowRange::head(2));
        assert_eq!(":5".parse::<RowRange>()?, RowRange::head(5));
        assert_eq!(
            "7:".parse::<RowRange>()?,
            RowRange {
                start: 7,
                end: None
            }
        );
        assert_eq!(":".parse::<RowRange>()?, RowRange::full());
        Ok(())
    }

    #[test]
    fn test_row_range_rejects_garbage() {
        for bad in ["5", "a:b", "-1:3", "9:2", "1:2:3"] {
            assert!(
                matches!(bad.parse::<RowRange>(), Err(ConvertError::InvalidArgument(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_zero_chunk_size_is_invalid() {
        let request = ConversionRequest::new("a.csv", "b.csv").input_chunk_size(0);
        assert!(matches!(
            request.validate(),
            Err(ConvertError::InvalidArgument(_))
        ));
    }
}
