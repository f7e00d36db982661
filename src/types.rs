//! Cell values for worksheet output

use crate::error::Result;
use arrow::array::{Array, ArrayRef, AsArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float64Type, Int64Type, UInt64Type};
use arrow::util::display::{ArrayFormatter, FormatOptions};
use std::fmt;

/// A single worksheet cell
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    /// Empty cell (not written)
    Empty,
    /// Text, stored through the shared strings table
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl CellValue {
    /// Convert cell value to string
    pub fn as_string(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::String(s) => s.clone(),
            CellValue::Int(i) => i.to_string(),
            CellValue::Float(f) => f.to_string(),
            CellValue::Bool(b) => b.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }

    /// Convert one Arrow column into cells
    ///
    /// Integer, float and boolean columns keep their type. Every other type
    /// is rendered as text the way Arrow displays it. Nulls become
    /// [`CellValue::Empty`]; NaN and infinities become text since a
    /// worksheet cannot store them as numbers.
    pub fn from_array(array: &ArrayRef) -> Result<Vec<CellValue>> {
        let cells = match array.data_type() {
            DataType::Null => vec![CellValue::Empty; array.len()],
            DataType::Boolean => array
                .as_boolean()
                .iter()
                .map(|v| v.map_or(CellValue::Empty, CellValue::Bool))
                .collect(),
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32 => cast(array, &DataType::Int64)?
                .as_primitive::<Int64Type>()
                .iter()
                .map(|v| v.map_or(CellValue::Empty, CellValue::Int))
                .collect(),
            DataType::UInt64 => array
                .as_primitive::<UInt64Type>()
                .iter()
                .map(|v| match v {
                    None => CellValue::Empty,
                    Some(v) => i64::try_from(v)
                        .map(CellValue::Int)
                        .unwrap_or(CellValue::Float(v as f64)),
                })
                .collect(),
            DataType::Float16 | DataType::Float32 | DataType::Float64 => {
                cast(array, &DataType::Float64)?
                    .as_primitive::<Float64Type>()
                    .iter()
                    .map(|v| match v {
                        None => CellValue::Empty,
                        Some(f) if f.is_finite() => CellValue::Float(f),
                        Some(f) => CellValue::String(f.to_string()),
                    })
                    .collect()
            }
            _ => {
                let options = FormatOptions::default().with_null("");
                let formatter = ArrayFormatter::try_new(array.as_ref(), &options)?;
                (0..array.len())
                    .map(|i| {
                        if array.is_null(i) {
                            CellValue::Empty
                        } else {
                            CellValue::String(formatter.value(i).to_string())
                        }
                    })
                    .collect()
            }
        };
        Ok(cells)
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::String(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::String(s)
    }
}

impl From<i64> for CellValue {
    fn from(i: i64) -> Self {
        CellValue::Int(i)
    }
}

impl From<f64> for CellValue {
    fn from(f: f64) -> Self {
        CellValue::Float(f)
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        CellValue::Bool(b)
    }
}
