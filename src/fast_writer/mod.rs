//! Streaming XLSX output
//!
//! Rows are compressed into the worksheet entry as they arrive, so memory
//! stays flat apart from the shared strings table, which is written last.
//!
//! # Example
//!
//! ```no_run
//! use tabconv::fast_writer::{CellStyle, FastWorkbook};
//! use tabconv::types::CellValue;
//!
//! let mut workbook = FastWorkbook::create("out.xlsx", "Sheet1")?;
//! workbook.write_row(&[CellValue::from("name"), CellValue::from("score")], CellStyle::HeaderBold)?;
//! workbook.write_row(&[CellValue::from("Alice"), CellValue::Int(95)], CellStyle::Default)?;
//! workbook.close()?;
//! # Ok::<(), tabconv::error::ConvertError>(())
//! ```

pub mod shared_strings;
pub mod workbook;
pub mod xml_writer;

pub use shared_strings::SharedStrings;
pub use workbook::{CellStyle, FastWorkbook};
pub use xml_writer::XmlWriter;

use crate::codec::TableSink;
use crate::error::{ConvertError, Result};
use crate::request::WriteOptions;
use crate::types::CellValue;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use std::path::Path;

pub const DEFAULT_SHEET_NAME: &str = "Sheet1";

/// Excel rejects sheet names that are empty, longer than 31 characters or contain `[]:*?/\`
pub fn validate_sheet_name(name: &str) -> Result<()> {
    if name.is_empty() || name.chars().count() > 31 {
        return Err(ConvertError::InvalidArgument(format!(
            "sheet name '{}' must be 1 to 31 characters long",
            name
        )));
    }
    if let Some(bad) = name.chars().find(|c| "[]:*?/\\".contains(*c)) {
        return Err(ConvertError::InvalidArgument(format!(
            "sheet name '{}' contains invalid character '{}'",
            name, bad
        )));
    }
    Ok(())
}

/// Worksheet output: header row from the schema, then one row per record
pub struct ExcelSink {
    workbook: FastWorkbook,
}

impl ExcelSink {
    pub fn create<P: AsRef<Path>>(path: P, schema: &SchemaRef, sheet_name: &str) -> Result<Self> {
        validate_sheet_name(sheet_name)?;
        let mut workbook = FastWorkbook::create(path, sheet_name)?;
        let header: Vec<CellValue> = schema
            .fields()
            .iter()
            .map(|f| CellValue::from(f.name().as_str()))
            .collect();
        workbook.write_row(&header, CellStyle::HeaderBold)?;
        Ok(ExcelSink { workbook })
    }
}

impl TableSink for ExcelSink {
    fn write_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        let columns = batch
            .columns()
            .iter()
            .map(CellValue::from_array)
            .collect::<Result<Vec<_>>>()?;
        for row in 0..batch.num_rows() {
            self.workbook
                .write_row(columns.iter().map(|column| &column[row]), CellStyle::Default)?;
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        self.workbook.close()
    }
}

pub fn open_excel(path: &Path, schema: SchemaRef, options: &WriteOptions) -> Result<Box<dyn TableSink>> {
    let sheet_name = options.sheet_name.as_deref().unwrap_or(DEFAULT_SHEET_NAME);
    Ok(Box::new(ExcelSink::create(path, &schema, sheet_name)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ReadOptions;
    use crate::streaming_reader::read_excel;
    use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
    use arrow::datatypes::DataType;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_sheet_names() {
        assert!(validate_sheet_name("Sheet1").is_ok());
        assert!(validate_sheet_name("").is_err());
        assert!(validate_sheet_name("a/b").is_err());
        assert!(validate_sheet_name(&"x".repeat(32)).is_err());
    }

    #[test]
    fn test_typed_roundtrip() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("typed.xlsx");
        let batch = RecordBatch::try_from_iter([
            ("id", Arc::new(Int64Array::from(vec![1, 2, 3])) as ArrayRef),
            ("score", Arc::new(Float64Array::from(vec![Some(1.5), None, Some(3.0)])) as ArrayRef),
            ("ok", Arc::new(BooleanArray::from(vec![true, false, true])) as ArrayRef),
            ("name", Arc::new(StringArray::from(vec!["a", "b", "a"])) as ArrayRef),
        ])?;

        let options = WriteOptions {
            sheet_name: Some("Results".to_string()),
            ..WriteOptions::default()
        };
        let mut sink = open_excel(&path, batch.schema(), &options)?;
        sink.write_batch(&batch.slice(0, 2))?;
        sink.write_batch(&batch.slice(2, 1))?;
        sink.finish()?;

        let read_options = ReadOptions {
            sheet_name: Some("Results".to_string()),
            ..ReadOptions::default()
        };
        let back = read_excel(&path, &read_options)?.collect_batch()?;
        assert_eq!(back.num_rows(), 3);
        assert_eq!(back.schema().field(0).data_type(), &DataType::Int64);
        assert_eq!(back.schema().field(1).data_type(), &DataType::Float64);
        assert_eq!(back.schema().field(2).data_type(), &DataType::Boolean);
        assert_eq!(back.schema().field(3).data_type(), &DataType::Utf8);
        assert!(back.column(1).is_null(1));
        Ok(())
    }

    #[test]
    fn test_unknown_sheet_lists_available() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("one.xlsx");
        let batch = RecordBatch::try_from_iter([(
            "x",
            Arc::new(Int64Array::from(vec![1])) as ArrayRef,
        )])?;
        let mut sink = open_excel(&path, batch.schema(), &WriteOptions::default())?;
        sink.write_batch(&batch)?;
        sink.finish()?;

        let options = ReadOptions {
            sheet_name: Some("Missing".to_string()),
            ..ReadOptions::default()
        };
        match read_excel(&path, &options) {
            Err(ConvertError::Read { message, .. }) => assert!(message.contains("Sheet1")),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        Ok(())
    }
}
