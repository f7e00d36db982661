//! Schema descriptions: export, JSON persistence and type coercion
//!
//! A [`SchemaDescription`] is an ordered `column -> type tag` mapping stored
//! as a flat JSON object:
//!
//! ```json
//! {"id": "int64", "name": "string", "joined": "date32"}
//! ```
//!
//! Applying a description casts the named columns of every batch and passes
//! the remaining columns through untouched.

use crate::error::{ConvertError, Result};
use arrow::array::{Array, ArrayRef};
use arrow::compute::{cast_with_options, CastOptions};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Bad values quoted in a coercion error
const MAX_BAD_SAMPLES: usize = 5;

/// Semantic column type stored in schema files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TypeTag {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    String,
    Binary,
    Date32,
    Date64,
    Timestamp,
    Time32,
    Time64,
}

impl TypeTag {
    pub fn name(&self) -> &'static str {
        match self {
            TypeTag::Bool => "bool",
            TypeTag::Int8 => "int8",
            TypeTag::Int16 => "int16",
            TypeTag::Int32 => "int32",
            TypeTag::Int64 => "int64",
            TypeTag::UInt8 => "uint8",
            TypeTag::UInt16 => "uint16",
            TypeTag::UInt32 => "uint32",
            TypeTag::UInt64 => "uint64",
            TypeTag::Float32 => "float32",
            TypeTag::Float64 => "float64",
            TypeTag::String => "string",
            TypeTag::Binary => "binary",
            TypeTag::Date32 => "date32",
            TypeTag::Date64 => "date64",
            TypeTag::Timestamp => "timestamp",
            TypeTag::Time32 => "time32",
            TypeTag::Time64 => "time64",
        }
    }

    /// Arrow type a column is coerced to
    pub fn data_type(&self) -> DataType {
        match self {
            TypeTag::Bool => DataType::Boolean,
            TypeTag::Int8 => DataType::Int8,
            TypeTag::Int16 => DataType::Int16,
            TypeTag::Int32 => DataType::Int32,
            TypeTag::Int64 => DataType::Int64,
            TypeTag::UInt8 => DataType::UInt8,
            TypeTag::UInt16 => DataType::UInt16,
            TypeTag::UInt32 => DataType::UInt32,
            TypeTag::UInt64 => DataType::UInt64,
            TypeTag::Float32 => DataType::Float32,
            TypeTag::Float64 => DataType::Float64,
            TypeTag::String => DataType::Utf8,
            TypeTag::Binary => DataType::Binary,
            TypeTag::Date32 => DataType::Date32,
            TypeTag::Date64 => DataType::Date64,
            TypeTag::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
            TypeTag::Time32 => DataType::Time32(TimeUnit::Second),
            TypeTag::Time64 => DataType::Time64(TimeUnit::Microsecond),
        }
    }

    /// Tag describing an arrow type; `None` for nested and interval types
    pub fn from_data_type(data_type: &DataType) -> Option<TypeTag> {
        let tag = match data_type {
            DataType::Boolean => TypeTag::Bool,
            DataType::Int8 => TypeTag::Int8,
            DataType::Int16 => TypeTag::Int16,
            DataType::Int32 => TypeTag::Int32,
            DataType::Int64 => TypeTag::Int64,
            DataType::UInt8 => TypeTag::UInt8,
            DataType::UInt16 => TypeTag::UInt16,
            DataType::UInt32 => TypeTag::UInt32,
            DataType::UInt64 => TypeTag::UInt64,
            DataType::Float16 | DataType::Float32 => TypeTag::Float32,
            DataType::Float64 | DataType::Decimal128(_, _) | DataType::Decimal256(_, _) => {
                TypeTag::Float64
            }
            DataType::Null | DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => {
                TypeTag::String
            }
            DataType::Binary
            | DataType::LargeBinary
            | DataType::BinaryView
            | DataType::FixedSizeBinary(_) => TypeTag::Binary,
            DataType::Date32 => TypeTag::Date32,
            DataType::Date64 => TypeTag::Date64,
            DataType::Timestamp(_, _) => TypeTag::Timestamp,
            DataType::Time32(_) => TypeTag::Time32,
            DataType::Time64(_) => TypeTag::Time64,
            DataType::Dictionary(_, value) => return TypeTag::from_data_type(value),
            _ => return None,
        };
        Some(tag)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TypeTag {
    type Err = ConvertError;

    /// Accepts canonical names, common aliases and parameterised spellings
    /// such as `timestamp[ns]`
    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let base = lower.split('[').next().unwrap_or_default().trim();
        let tag = match base {
            "bool" | "boolean" => TypeTag::Bool,
            "int8" => TypeTag::Int8,
            "int16" => TypeTag::Int16,
            "int32" => TypeTag::Int32,
            "int64" | "int" | "integer" => TypeTag::Int64,
            "uint8" => TypeTag::UInt8,
            "uint16" => TypeTag::UInt16,
            "uint32" => TypeTag::UInt32,
            "uint64" => TypeTag::UInt64,
            "float32" | "float16" | "halffloat" => TypeTag::Float32,
            "float64" | "float" | "double" => TypeTag::Float64,
            "string" | "str" | "utf8" | "large_string" | "text" => TypeTag::String,
            "binary" | "bytes" | "large_binary" => TypeTag::Binary,
            "date32" | "date" => TypeTag::Date32,
            "date64" => TypeTag::Date64,
            "timestamp" | "datetime" => TypeTag::Timestamp,
            "time32" => TypeTag::Time32,
            "time64" | "time" => TypeTag::Time64,
            _ => {
                return Err(ConvertError::InvalidArgument(format!(
                    "unknown column type '{}'",
                    s
                )))
            }
        };
        Ok(tag)
    }
}

impl TryFrom<String> for TypeTag {
    type Error = ConvertError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TypeTag> for String {
    fn from(tag: TypeTag) -> Self {
        tag.name().to_string()
    }
}

/// Ordered mapping from column name to type tag
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SchemaDescription {
    columns: IndexMap<String, TypeTag>,
}

#[derive(Deserialize)]
struct FieldEntry {
    name: String,
    #[serde(rename = "type")]
    tag: TypeTag,
}

/// Accepted on-disk shapes: the flat object, or `{"fields": [{name, type}]}`
#[derive(Deserialize)]
#[serde(untagged)]
enum SchemaDocument {
    Fields { fields: Vec<FieldEntry> },
    Columns(IndexMap<String, TypeTag>),
}

impl<'de> Deserialize<'de> for SchemaDescription {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let columns = match SchemaDocument::deserialize(deserializer)? {
            SchemaDocument::Columns(columns) => columns,
            SchemaDocument::Fields { fields } => {
                fields.into_iter().map(|f| (f.name, f.tag)).collect()
            }
        };
        Ok(SchemaDescription { columns })
    }
}

impl SchemaDescription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a column (builder pattern)
    pub fn column(mut self, name: impl Into<String>, tag: TypeTag) -> Self {
        self.columns.insert(name.into(), tag);
        self
    }

    pub fn get(&self, name: &str) -> Option<TypeTag> {
        self.columns.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, TypeTag)> {
        self.columns.iter().map(|(name, tag)| (name.as_str(), *tag))
    }

    /// Describe every field of an arrow schema
    pub fn from_arrow(schema: &Schema) -> Result<Self> {
        let mut columns = IndexMap::with_capacity(schema.fields().len());
        for field in schema.fields() {
            let tag = TypeTag::from_data_type(field.data_type()).ok_or_else(|| {
                ConvertError::SchemaMismatch(format!(
                    "column '{}' has type {} which has no flat schema tag",
                    field.name(),
                    field.data_type()
                ))
            })?;
            columns.insert(field.name().clone(), tag);
        }
        Ok(SchemaDescription { columns })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| ConvertError::InvalidArgument(format!("invalid schema document: {}", e)))
    }

    /// Write the description as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut json = self.to_json()?;
        json.push('\n');
        fs::write(path.as_ref(), json).map_err(|e| {
            ConvertError::Write(format!(
                "Failed to write schema file {}: {}",
                path.as_ref().display(),
                e
            ))
        })
    }

    /// Read a description written by [`SchemaDescription::save`]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConvertError::FileNotFound(path.to_path_buf()));
        }
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            ConvertError::InvalidArgument(format!(
                "invalid schema file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Schema the data will have once this description is applied
    ///
    /// Fails with `SchemaMismatch` when a described column is absent.
    pub fn apply_to_schema(&self, source: &Schema) -> Result<SchemaRef> {
        let missing: Vec<&str> = self
            .columns
            .keys()
            .filter(|name| source.field_with_name(name).is_err())
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            let available: Vec<&str> = source.fields().iter().map(|f| f.name().as_str()).collect();
            return Err(ConvertError::SchemaMismatch(format!(
                "columns {:?} not found in input (available: {:?})",
                missing, available
            )));
        }

        let fields: Vec<Field> = source
            .fields()
            .iter()
            .map(|field| match self.get(field.name()) {
                Some(tag) => Field::new(field.name(), tag.data_type(), true),
                None => field.as_ref().clone(),
            })
            .collect();
        Ok(Arc::new(Schema::new(fields)))
    }
}

/// Cast every column of `batch` to the matching field type of `target`
pub fn coerce_batch(batch: &RecordBatch, target: &SchemaRef) -> Result<RecordBatch> {
    let columns = batch
        .columns()
        .iter()
        .zip(target.fields())
        .map(|(column, field)| coerce_array(column, field.data_type(), field.name()))
        .collect::<Result<Vec<_>>>()?;
    Ok(RecordBatch::try_new(target.clone(), columns)?)
}

/// Cast one column, failing if any present value cannot be represented
///
/// Casting is lenient per value (unparseable values become null); a value
/// that was present before and is null afterwards is reported as a failure.
pub fn coerce_array(array: &ArrayRef, to: &DataType, column: &str) -> Result<ArrayRef> {
    if array.data_type() == to {
        return Ok(array.clone());
    }

    let options = CastOptions {
        safe: true,
        format_options: FormatOptions::default(),
    };
    let cast = match cast_with_options(array, to, &options) {
        Ok(cast) => cast,
        Err(_) => return Err(coercion_error(array, column, to, |i| array.is_valid(i))),
    };

    let lost = |i: usize| array.is_valid(i) && cast.is_null(i);
    if (0..array.len()).any(lost) {
        return Err(coercion_error(array, column, to, lost));
    }
    Ok(cast)
}

fn coercion_error<F>(array: &ArrayRef, column: &str, to: &DataType, failed: F) -> ConvertError
where
    F: Fn(usize) -> bool,
{
    let bad: Vec<usize> = (0..array.len()).filter(|&i| failed(i)).collect();
    let samples = match ArrayFormatter::try_new(array.as_ref(), &FormatOptions::default()) {
        Ok(formatter) => bad
            .iter()
            .take(MAX_BAD_SAMPLES)
            .map(|&i| formatter.value(i).to_string())
            .collect(),
        Err(_) => Vec::new(),
    };
    let target = TypeTag::from_data_type(to)
        .map(|tag| tag.name().to_string())
        .unwrap_or_else(|| to.to_string());
    ConvertError::TypeCoercion {
        column: column.to_string(),
        target,
        failed: bad.len(),
        samples,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};

    fn text_batch() -> RecordBatch {
        RecordBatch::try_from_iter([
            (
                "id",
                Arc::new(StringArray::from(vec![Some("1"), None, Some("3")])) as ArrayRef,
            ),
            (
                "name",
                Arc::new(StringArray::from(vec!["a", "b", "c"])) as ArrayRef,
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_json_keeps_column_order() -> Result<()> {
        let desc = SchemaDescription::new()
            .column("zeta", TypeTag::Int64)
            .column("alpha", TypeTag::String);
        let json = desc.to_json()?;
        assert!(json.find("zeta").unwrap() < json.find("alpha").unwrap());
        assert_eq!(SchemaDescription::from_json(&json)?, desc);
        Ok(())
    }

    #[test]
    fn test_aliases_and_fields_document() -> Result<()> {
        let desc = SchemaDescription::from_json(r#"{"a": "integer", "b": "timestamp[ns]"}"#)?;
        assert_eq!(desc.get("a"), Some(TypeTag::Int64));
        assert_eq!(desc.get("b"), Some(TypeTag::Timestamp));

        let desc = SchemaDescription::from_json(
            r#"{"fields": [{"name": "x", "type": "double"}, {"name": "y", "type": "str"}]}"#,
        )?;
        assert_eq!(
            desc.iter().collect::<Vec<_>>(),
            vec![("x", TypeTag::Float64), ("y", TypeTag::String)]
        );
        Ok(())
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        assert!(SchemaDescription::from_json(r#"{"a": "decimal"}"#).is_err());
    }

    #[test]
    fn test_from_arrow_rejects_nested() {
        let schema = Schema::new(vec![Field::new(
            "xs",
            DataType::List(Arc::new(Field::new("item", DataType::Int32, true))),
            true,
        )]);
        assert!(matches!(
            SchemaDescription::from_arrow(&schema),
            Err(ConvertError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_apply_casts_named_columns_only() -> Result<()> {
        let batch = text_batch();
        let desc = SchemaDescription::new().column("id", TypeTag::Int64);
        let target = desc.apply_to_schema(&batch.schema())?;
        let out = coerce_batch(&batch, &target)?;

        assert_eq!(out.schema().field(0).data_type(), &DataType::Int64);
        assert_eq!(out.schema().field(1).data_type(), &DataType::Utf8);
        let ids = out.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(ids.value(2), 3);
        assert!(ids.is_null(1));
        Ok(())
    }

    #[test]
    fn test_missing_column_is_mismatch() {
        let batch = text_batch();
        let desc = SchemaDescription::new().column("age", TypeTag::Int64);
        let err = desc.apply_to_schema(&batch.schema()).unwrap_err();
        assert!(matches!(err, ConvertError::SchemaMismatch(_)));
        assert!(err.to_string().contains("age"));
    }

    #[test]
    fn test_bad_values_name_column_and_samples() {
        let batch = text_batch();
        let desc = SchemaDescription::new().column("name", TypeTag::Int64);
        let target = desc.apply_to_schema(&batch.schema()).unwrap();
        match coerce_batch(&batch, &target) {
            Err(ConvertError::TypeCoercion {
                column,
                target,
                failed,
                samples,
            }) => {
                assert_eq!(column, "name");
                assert_eq!(target, "int64");
                assert_eq!(failed, 3);
                assert_eq!(samples, vec!["a", "b", "c"]);
            }
            other => panic!("expected coercion error, got {:?}", other),
        }
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            SchemaDescription::load("/definitely/not/here.json"),
            Err(ConvertError::FileNotFound(_))
        ));
    }
}
