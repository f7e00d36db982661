//! Typed batches from text rows
//!
//! CSV, Excel and HTML sources all produce rows of strings. This module turns
//! those rows into typed record batches: empty cells become nulls, column
//! types are inferred from every row of the source and every chunk is cast to
//! that schema.

use crate::error::{ConvertError, Result};
use crate::request::ReadOptions;
use crate::schema::coerce_array;
use crate::stream::BatchStream;
use arrow::array::{ArrayRef, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Tracks which types every value seen so far would fit
#[derive(Debug, Clone)]
pub struct TypeCandidates {
    seen: bool,
    boolean: bool,
    integer: bool,
    float: bool,
    date: bool,
    datetime: bool,
}

impl Default for TypeCandidates {
    fn default() -> Self {
        TypeCandidates {
            seen: false,
            boolean: true,
            integer: true,
            float: true,
            date: true,
            datetime: true,
        }
    }
}

impl TypeCandidates {
    /// Narrow the candidates by one non-empty value
    pub fn observe(&mut self, value: &str) {
        self.seen = true;
        if self.boolean {
            self.boolean =
                value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("false");
        }
        if self.integer {
            let digits = value.strip_prefix('-').unwrap_or(value);
            self.integer = !digits.is_empty()
                && digits.bytes().all(|b| b.is_ascii_digit())
                && value.parse::<i64>().is_ok();
        }
        if self.float {
            self.float = value.bytes().any(|b| b.is_ascii_digit())
                && value
                    .bytes()
                    .all(|b| b.is_ascii_digit() || matches!(b, b'-' | b'+' | b'.' | b'e' | b'E'))
                && value.parse::<f64>().is_ok();
        }
        if self.date {
            self.date = value.len() == 10 && NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok();
        }
        if self.datetime {
            self.datetime = is_datetime(value);
        }
    }

    /// Narrowest type that holds every observed value
    pub fn resolve(&self) -> DataType {
        if !self.seen {
            DataType::Utf8
        } else if self.boolean {
            DataType::Boolean
        } else if self.integer {
            DataType::Int64
        } else if self.float {
            DataType::Float64
        } else if self.date {
            DataType::Date32
        } else if self.datetime {
            DataType::Timestamp(TimeUnit::Microsecond, None)
        } else {
            DataType::Utf8
        }
    }
}

fn is_datetime(value: &str) -> bool {
    DATETIME_FORMATS
        .iter()
        .any(|fmt| NaiveDateTime::parse_from_str(value, fmt).is_ok())
        || DateTime::parse_from_rfc3339(value).is_ok()
        || (value.len() == 10 && NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok())
}

/// Infer one type per column from sampled rows
pub fn infer_types(width: usize, rows: &VecDeque<Vec<String>>) -> Vec<DataType> {
    let mut candidates = vec![TypeCandidates::default(); width];
    for row in rows {
        for (candidate, value) in candidates.iter_mut().zip(row) {
            if !value.is_empty() {
                candidate.observe(value);
            }
        }
    }
    candidates.iter().map(TypeCandidates::resolve).collect()
}

/// Make header names non-empty and unique
///
/// Blank names become `Unnamed: i`; repeats get a `.1`, `.2`, ... suffix.
pub fn normalize_header(header: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(header.len());
    header
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let name = name.trim().to_string();
            let base = if name.is_empty() {
                format!("Unnamed: {}", i)
            } else {
                name
            };
            let mut candidate = base.clone();
            let mut suffix = 1;
            while !seen.insert(candidate.clone()) {
                candidate = format!("{}.{}", base, suffix);
                suffix += 1;
            }
            candidate
        })
        .collect()
}

/// Build a typed stream from a header and a reopenable source of text rows
///
/// `open_rows` yields the data rows (header excluded) each time it is called.
/// With `chunk_size = None` the rows are read once, buffered, and types are
/// inferred from all of them. Otherwise a first pass over the source infers
/// the types in constant memory and a second pass yields batches of at most
/// `chunk_size` rows, so chunked and whole reads agree on every column type.
///
/// Columns named in `declared_types` are not inferred: they stay strings and
/// are cast to the declared type by the caller.
pub fn text_stream<F, I>(
    header: Vec<String>,
    open_rows: F,
    options: &ReadOptions,
) -> Result<BatchStream>
where
    F: Fn() -> Result<I>,
    I: Iterator<Item = Result<Vec<String>>> + 'static,
{
    let header = normalize_header(header);
    let width = header.len();
    let limited = |rows: I| -> Box<dyn Iterator<Item = Result<Vec<String>>>> {
        match options.row_limit {
            Some(limit) => Box::new(rows.take(limit)),
            None => Box::new(rows),
        }
    };

    let mut buffered = VecDeque::new();
    let (mut types, rows, sampled) = match options.chunk_size {
        None => {
            let mut rows = limited(open_rows()?);
            for row in rows.by_ref() {
                match row.and_then(|row| fit_row(row, width, buffered.len(), &header)) {
                    Ok(row) => buffered.push_back(row),
                    Err(e) => return Err(with_partial(e, &header, &buffered)),
                }
            }
            let sampled = buffered.len();
            (infer_types(width, &buffered), rows, sampled)
        }
        Some(_) => {
            let (types, sampled) = infer_pass(limited(open_rows()?), &header);
            (types, limited(open_rows()?), sampled)
        }
    };

    if let Some(declared) = &options.declared_types {
        for (name, data_type) in header.iter().zip(types.iter_mut()) {
            if declared.get(name).is_some() {
                *data_type = DataType::Utf8;
            }
        }
    }

    let fields: Vec<Field> = header
        .iter()
        .zip(&types)
        .map(|(name, data_type)| Field::new(name, data_type.clone(), true))
        .collect();
    let schema = Arc::new(Schema::new(fields));
    log::debug!("Inferred text schema from {} row(s): {:?}", sampled, types);

    let chunks = TextChunks {
        schema: schema.clone(),
        header,
        buffered,
        rows,
        chunk_size: options.chunk_size,
        row_index: 0,
        done: false,
    };
    Ok(BatchStream::new(schema, chunks))
}

/// Observe every row of the source without keeping any
///
/// Stops quietly at the first bad row; the data pass reports it with the
/// rows of the chunk it belongs to.
fn infer_pass(
    rows: impl Iterator<Item = Result<Vec<String>>>,
    header: &[String],
) -> (Vec<DataType>, usize) {
    let width = header.len();
    let mut candidates = vec![TypeCandidates::default(); width];
    let mut seen = 0;
    for row in rows {
        let Ok(row) = row.and_then(|row| fit_row(row, width, seen, header)) else {
            break;
        };
        for (candidate, value) in candidates.iter_mut().zip(&row) {
            if !value.is_empty() {
                candidate.observe(value);
            }
        }
        seen += 1;
    }
    (candidates.iter().map(TypeCandidates::resolve).collect(), seen)
}

/// Pad short rows with empty cells; reject rows with too many fields
fn fit_row(
    mut row: Vec<String>,
    width: usize,
    index: usize,
    header: &[String],
) -> Result<Vec<String>> {
    if row.len() > width {
        // Trailing empty fields are tolerated (e.g. a trailing delimiter)
        while row.len() > width && row.last().is_some_and(|v| v.is_empty()) {
            row.pop();
        }
        if row.len() > width {
            return Err(ConvertError::read(format!(
                "row {} has {} fields, expected {} ({:?})",
                index + 1,
                row.len(),
                width,
                header
            )));
        }
    }
    row.resize(width, String::new());
    Ok(row)
}

fn with_partial(
    error: ConvertError,
    header: &[String],
    rows: &VecDeque<Vec<String>>,
) -> ConvertError {
    if rows.is_empty() {
        return error;
    }
    match text_batch(header, rows.iter()) {
        Ok(batch) => ConvertError::read_with_partial(error.to_string(), batch),
        Err(_) => error,
    }
}

/// Untyped batch of the given rows, all columns as strings
fn text_batch<'a, I>(header: &[String], rows: I) -> Result<RecordBatch>
where
    I: Iterator<Item = &'a Vec<String>> + Clone,
{
    let columns: Vec<ArrayRef> = (0..header.len())
        .map(|col| {
            let values = rows.clone().map(|row| {
                row.get(col)
                    .map(String::as_str)
                    .filter(|value| !value.is_empty())
            });
            Arc::new(StringArray::from_iter(values)) as ArrayRef
        })
        .collect();
    let fields: Vec<Field> = header
        .iter()
        .map(|name| Field::new(name, DataType::Utf8, true))
        .collect();
    let options = RecordBatchOptions::new().with_row_count(Some(rows.count()));
    Ok(RecordBatch::try_new_with_options(
        Arc::new(Schema::new(fields)),
        columns,
        &options,
    )?)
}

struct TextChunks {
    schema: SchemaRef,
    header: Vec<String>,
    buffered: VecDeque<Vec<String>>,
    rows: Box<dyn Iterator<Item = Result<Vec<String>>>>,
    chunk_size: Option<usize>,
    row_index: usize,
    done: bool,
}

impl TextChunks {
    fn next_chunk(&mut self) -> Result<Option<RecordBatch>> {
        let limit = self.chunk_size.unwrap_or(usize::MAX);
        let mut chunk: Vec<Vec<String>> = Vec::new();

        while chunk.len() < limit {
            if let Some(row) = self.buffered.pop_front() {
                chunk.push(row);
                continue;
            }
            match self.rows.next() {
                Some(Ok(row)) => {
                    let index = self.row_index + chunk.len();
                    match fit_row(row, self.header.len(), index, &self.header) {
                        Ok(row) => chunk.push(row),
                        Err(e) => return Err(self.fail(e, &chunk)),
                    }
                }
                Some(Err(e)) => return Err(self.fail(e, &chunk)),
                None => break,
            }
        }

        if chunk.is_empty() && self.chunk_size.is_some() {
            self.done = true;
            return Ok(None);
        }
        if chunk.len() < limit {
            self.done = true;
        }
        self.row_index += chunk.len();

        let raw = text_batch(&self.header, chunk.iter())?;
        let typed = self.type_batch(&raw).map_err(|e| match e {
            ConvertError::TypeCoercion { .. } => {
                ConvertError::read_with_partial(e.to_string(), raw)
            }
            other => other,
        })?;
        Ok(Some(typed))
    }

    /// Stop the stream, attaching the rows of the unfinished chunk
    fn fail(&mut self, error: ConvertError, chunk: &[Vec<String>]) -> ConvertError {
        self.done = true;
        if chunk.is_empty() {
            return error;
        }
        match text_batch(&self.header, chunk.iter()) {
            Ok(partial) => ConvertError::read_with_partial(error.to_string(), partial),
            Err(_) => error,
        }
    }

    fn type_batch(&self, raw: &RecordBatch) -> Result<RecordBatch> {
        let columns = raw
            .columns()
            .iter()
            .zip(self.schema.fields())
            .map(|(column, field)| coerce_array(column, field.data_type(), field.name()))
            .collect::<Result<Vec<_>>>()?;
        let options = RecordBatchOptions::new().with_row_count(Some(raw.num_rows()));
        Ok(RecordBatch::try_new_with_options(
            self.schema.clone(),
            columns,
            &options,
        )?)
    }
}

impl Iterator for TextChunks {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_chunk() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
