//! Stata `.dta` files (releases 117 to 119)
//!
//! The reader decodes a whole file into one batch: numeric variables map to
//! Arrow integers and floats with Stata missing values as nulls, `%td`
//! variables become `Date32`, `%tc` variables become millisecond timestamps
//! and `strN`/`strL` variables become strings (or raw bytes with
//! `keep_bytes`).
//!
//! The writer produces release 118. Stata has no append, so every chunk is
//! buffered and the file is written in one go on `finish`; a failed
//! conversion never leaves a `.dta` behind.

use crate::codec::TableSink;
use crate::error::{ConvertError, Result};
use crate::request::{ReadOptions, WriteOptions};
use crate::stream::BatchStream;
use arrow::array::{
    Array, ArrayRef, AsArray, BinaryArray, Date32Array, Float32Array, Float64Array, Int16Array,
    Int32Array, Int8Array, StringArray, TimestampMillisecondArray,
};
use arrow::compute::{cast, concat_batches};
use arrow::datatypes::{
    DataType, Field, Float32Type, Float64Type, Int64Type, Schema, SchemaRef, TimeUnit, UInt64Type,
};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow::util::display::{ArrayFormatter, FormatOptions};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// Days from 1960-01-01 (Stata epoch) to 1970-01-01
const STATA_EPOCH_DAYS: i64 = 3653;
/// Milliseconds from 1960-01-01 to 1970-01-01
const STATA_EPOCH_MS: i64 = STATA_EPOCH_DAYS * 86_400_000;

const TYPE_STRL: u16 = 32768;
const TYPE_DOUBLE: u16 = 65526;
const TYPE_FLOAT: u16 = 65527;
const TYPE_LONG: u16 = 65528;
const TYPE_INT: u16 = 65529;
const TYPE_BYTE: u16 = 65530;
const MAX_STR_WIDTH: usize = 2045;

const BYTE_MAX: i8 = 100;
const INT_MAX: i16 = 32740;
const LONG_MAX: i32 = 2_147_483_620;
const BYTE_MISSING: i8 = 101;
const INT_MISSING: i16 = 32741;
const LONG_MISSING: i32 = 2_147_483_621;
const FLOAT_MISSING_BITS: u32 = 0x7F00_0000;
const DOUBLE_MISSING_BITS: u64 = 0x7FE0_0000_0000_0000;

fn truncated() -> ConvertError {
    ConvertError::read("Stata file is truncated")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    fn uint(self, bytes: &[u8]) -> u64 {
        let fold = |acc: u64, b: &u8| (acc << 8) | u64::from(*b);
        match self {
            ByteOrder::Big => bytes.iter().fold(0, fold),
            ByteOrder::Little => bytes.iter().rev().fold(0, fold),
        }
    }

    fn i16(self, b: &[u8]) -> i16 {
        self.uint(&b[..2]) as u16 as i16
    }

    fn i32(self, b: &[u8]) -> i32 {
        self.uint(&b[..4]) as u32 as i32
    }

    fn f32(self, b: &[u8]) -> f32 {
        f32::from_bits(self.uint(&b[..4]) as u32)
    }

    fn f64(self, b: &[u8]) -> f64 {
        f64::from_bits(self.uint(&b[..8]))
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(truncated)?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn expect(&mut self, tag: &str) -> Result<()> {
        let found = self.take(tag.len())?;
        if found != tag.as_bytes() {
            return Err(ConvertError::read(format!(
                "Malformed Stata file: expected {} at byte {}",
                tag,
                self.pos - tag.len()
            )));
        }
        Ok(())
    }

    fn uint(&mut self, n: usize) -> Result<u64> {
        let order = self.order;
        Ok(order.uint(self.take(n)?))
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        let pos = usize::try_from(pos).map_err(|_| truncated())?;
        if pos > self.data.len() {
            return Err(truncated());
        }
        self.pos = pos;
        Ok(())
    }
}

/// Storage type of one Stata variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VarType {
    Str(usize),
    StrL,
    Double,
    Float,
    Long,
    Int,
    Byte,
}

impl VarType {
    fn from_code(code: u16) -> Result<Self> {
        Ok(match code {
            1..=2045 => VarType::Str(code as usize),
            TYPE_STRL => VarType::StrL,
            TYPE_DOUBLE => VarType::Double,
            TYPE_FLOAT => VarType::Float,
            TYPE_LONG => VarType::Long,
            TYPE_INT => VarType::Int,
            TYPE_BYTE => VarType::Byte,
            other => {
                return Err(ConvertError::read(format!(
                    "Unknown Stata variable type {}",
                    other
                )))
            }
        })
    }

    fn code(self) -> u16 {
        match self {
            VarType::Str(width) => width as u16,
            VarType::StrL => TYPE_STRL,
            VarType::Double => TYPE_DOUBLE,
            VarType::Float => TYPE_FLOAT,
            VarType::Long => TYPE_LONG,
            VarType::Int => TYPE_INT,
            VarType::Byte => TYPE_BYTE,
        }
    }

    fn width(self) -> usize {
        match self {
            VarType::Str(width) => width,
            VarType::StrL | VarType::Double => 8,
            VarType::Float | VarType::Long => 4,
            VarType::Int => 2,
            VarType::Byte => 1,
        }
    }
}

/// Decoded `.dta` file
pub struct StataReader {
    data: Vec<u8>,
    release: u16,
    order: ByteOrder,
    row_count: u64,
    names: Vec<String>,
    types: Vec<VarType>,
    formats: Vec<String>,
    data_offset: u64,
    strls_offset: u64,
}

impl StataReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        Self::from_bytes(data)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if !data.starts_with(b"<stata_dta>") {
            return Err(ConvertError::read(
                "Not a Stata 117+ file (releases before Stata 13 are not supported)",
            ));
        }
        let mut cur = Cursor {
            data: &data,
            pos: 0,
            order: ByteOrder::Little,
        };
        cur.expect("<stata_dta><header><release>")?;
        let release: u16 = std::str::from_utf8(cur.take(3)?)
            .ok()
            .and_then(|r| r.parse().ok())
            .ok_or_else(|| ConvertError::read("Invalid Stata release"))?;
        if !(117..=119).contains(&release) {
            return Err(ConvertError::read(format!(
                "Unsupported Stata release {}",
                release
            )));
        }
        cur.expect("</release><byteorder>")?;
        cur.order = match cur.take(3)? {
            b"LSF" => ByteOrder::Little,
            b"MSF" => ByteOrder::Big,
            _ => return Err(ConvertError::read("Invalid Stata byte order")),
        };
        cur.expect("</byteorder><K>")?;
        let nvar = cur.uint(if release == 119 { 4 } else { 2 })? as usize;
        cur.expect("</K><N>")?;
        let row_count = cur.uint(if release == 117 { 4 } else { 8 })?;
        cur.expect("</N><label>")?;
        let label_len = cur.uint(if release == 117 { 1 } else { 2 })? as usize;
        cur.take(label_len)?;
        cur.expect("</label><timestamp>")?;
        let stamp_len = cur.uint(1)? as usize;
        cur.take(stamp_len)?;
        cur.expect("</timestamp></header><map>")?;
        let mut map = [0u64; 14];
        for slot in map.iter_mut() {
            *slot = cur.uint(8)?;
        }
        cur.expect("</map>")?;

        cur.seek(map[2])?;
        cur.expect("<variable_types>")?;
        let types = (0..nvar)
            .map(|_| VarType::from_code(cur.uint(2)? as u16))
            .collect::<Result<Vec<_>>>()?;

        let name_len = if release == 117 { 33 } else { 129 };
        cur.seek(map[3])?;
        cur.expect("<varnames>")?;
        let names = (0..nvar)
            .map(|_| cur.take(name_len).map(c_string))
            .collect::<Result<Vec<_>>>()?;

        let format_len = if release == 117 { 49 } else { 57 };
        cur.seek(map[5])?;
        cur.expect("<formats>")?;
        let formats = (0..nvar)
            .map(|_| cur.take(format_len).map(c_string))
            .collect::<Result<Vec<_>>>()?;

        log::debug!(
            "Stata release {} ({:?} endian): {} variable(s), {} observation(s)",
            release,
            cur.order,
            nvar,
            row_count
        );

        let order = cur.order;
        Ok(StataReader {
            release,
            order,
            row_count,
            names,
            types,
            formats,
            data_offset: map[9],
            strls_offset: map[10],
            data,
        })
    }

    pub fn release(&self) -> u16 {
        self.release
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn variable_names(&self) -> &[String] {
        &self.names
    }

    /// Read the long-string (GSO) table keyed by (variable, observation)
    fn read_strls(&self) -> Result<HashMap<(u64, u64), &[u8]>> {
        let mut strls = HashMap::new();
        if !self.types.contains(&VarType::StrL) {
            return Ok(strls);
        }
        let mut cur = Cursor {
            data: &self.data,
            pos: 0,
            order: self.order,
        };
        cur.seek(self.strls_offset)?;
        cur.expect("<strls>")?;
        while self.data.get(cur.pos..cur.pos + 3) == Some(b"GSO".as_slice()) {
            cur.take(3)?;
            let v = cur.uint(4)?;
            let o = cur.uint(if self.release == 117 { 4 } else { 8 })?;
            let kind = cur.uint(1)?;
            let len = cur.uint(4)? as usize;
            let mut contents = cur.take(len)?;
            // 130: null-terminated text
            if kind == 130 {
                contents = contents.strip_suffix(&[0]).unwrap_or(contents);
            }
            strls.insert((v, o), contents);
        }
        Ok(strls)
    }

    fn strl_key(&self, cell: &[u8]) -> (u64, u64) {
        let split = match self.release {
            117 => 4,
            118 => 2,
            _ => 3,
        };
        let (v, o) = cell.split_at(split);
        (self.order.uint(v), self.order.uint(o))
    }

    /// Decode up to `limit` observations into one batch
    pub fn to_batch(&self, keep_bytes: bool, limit: Option<usize>) -> Result<RecordBatch> {
        let rows = usize::try_from(self.row_count)
            .map_err(|_| ConvertError::read("Stata file has too many observations"))?;
        let rows = limit.map_or(rows, |l| l.min(rows));
        let record_width: usize = self.types.iter().map(|t| t.width()).sum();

        let start = usize::try_from(self.data_offset).map_err(|_| truncated())? + "<data>".len();
        if self.data.get(start - "<data>".len()..start) != Some(b"<data>".as_slice()) {
            return Err(ConvertError::read("Malformed Stata file: missing <data>"));
        }
        let end = start
            .checked_add(record_width * rows)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(truncated)?;
        let records = &self.data[start..end];
        let strls = self.read_strls()?;

        let mut fields = Vec::with_capacity(self.types.len());
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(self.types.len());
        let mut offset = 0;
        for (index, var_type) in self.types.iter().enumerate() {
            let width = var_type.width();
            let cells = (0..rows).map(move |row| {
                let at = row * record_width + offset;
                &records[at..at + width]
            });
            let format = &self.formats[index];
            let column = self.decode_column(*var_type, format, cells, &strls, keep_bytes);
            fields.push(Field::new(&self.names[index], column.data_type().clone(), true));
            columns.push(column);
            offset += width;
        }

        let schema = Arc::new(Schema::new(fields));
        let options = RecordBatchOptions::new().with_row_count(Some(rows));
        Ok(RecordBatch::try_new_with_options(schema, columns, &options)?)
    }

    fn decode_column<'b, I>(
        &self,
        var_type: VarType,
        format: &str,
        cells: I,
        strls: &HashMap<(u64, u64), &[u8]>,
        keep_bytes: bool,
    ) -> ArrayRef
    where
        I: Iterator<Item = &'b [u8]>,
    {
        let order = self.order;
        match var_type {
            VarType::Str(_) | VarType::StrL => {
                let values: Vec<&[u8]> = cells
                    .map(|cell| match var_type {
                        VarType::StrL => {
                            let key = self.strl_key(cell);
                            strls.get(&key).copied().unwrap_or(&[])
                        }
                        _ => cell.split(|b| *b == 0).next().unwrap_or(&[]),
                    })
                    .collect();
                if keep_bytes {
                    Arc::new(BinaryArray::from_iter_values(values))
                } else {
                    Arc::new(StringArray::from_iter_values(values.into_iter().map(decode_text)))
                }
            }
            _ => {
                let values = cells.map(|cell| read_number(var_type, order, cell));
                if is_date_format(format) {
                    let days: Date32Array = values
                        .map(|v| v.map(|v| (v.floor() as i64 - STATA_EPOCH_DAYS) as i32))
                        .collect();
                    return Arc::new(days);
                }
                if is_datetime_format(format) {
                    let ms: TimestampMillisecondArray = values
                        .map(|v| v.map(|v| v as i64 - STATA_EPOCH_MS))
                        .collect();
                    return Arc::new(ms);
                }
                match var_type {
                    VarType::Byte => {
                        Arc::new(values.map(|v| v.map(|v| v as i8)).collect::<Int8Array>())
                    }
                    VarType::Int => {
                        Arc::new(values.map(|v| v.map(|v| v as i16)).collect::<Int16Array>())
                    }
                    VarType::Long => {
                        Arc::new(values.map(|v| v.map(|v| v as i32)).collect::<Int32Array>())
                    }
                    VarType::Float => {
                        Arc::new(values.map(|v| v.map(|v| v as f32)).collect::<Float32Array>())
                    }
                    _ => Arc::new(values.collect::<Float64Array>()),
                }
            }
        }
    }
}

/// Numeric cell as f64, `None` for any of Stata's missing values
fn read_number(var_type: VarType, order: ByteOrder, cell: &[u8]) -> Option<f64> {
    match var_type {
        VarType::Byte => {
            let v = cell[0] as i8;
            (v <= BYTE_MAX).then_some(f64::from(v))
        }
        VarType::Int => {
            let v = order.i16(cell);
            (v <= INT_MAX).then_some(f64::from(v))
        }
        VarType::Long => {
            let v = order.i32(cell);
            (v <= LONG_MAX).then_some(f64::from(v))
        }
        VarType::Float => {
            let v = order.f32(cell);
            (v.is_finite() && v < f32::from_bits(FLOAT_MISSING_BITS)).then_some(f64::from(v))
        }
        VarType::Double => {
            let v = order.f64(cell);
            (v.is_finite() && v < f64::from_bits(DOUBLE_MISSING_BITS)).then_some(v)
        }
        VarType::Str(_) | VarType::StrL => None,
    }
}

fn is_date_format(format: &str) -> bool {
    format.starts_with("%td") || format.starts_with("%-td") || format.starts_with("%d")
}

fn is_datetime_format(format: &str) -> bool {
    format.starts_with("%tc") || format.starts_with("%tC") || format.starts_with("%-tc")
}

fn c_string(bytes: &[u8]) -> String {
    decode_text(bytes.split(|b| *b == 0).next().unwrap_or(&[]))
}

/// UTF-8 when valid, otherwise Latin-1 (release 117 files carry no encoding)
fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|b| char::from(*b)).collect(),
    }
}

pub fn read_stata(path: &Path, options: &ReadOptions) -> Result<BatchStream> {
    let reader = StataReader::open(path)?;
    let batch = reader.to_batch(options.keep_bytes, options.row_limit)?;
    Ok(BatchStream::once(batch).chunked(options.chunk_size))
}

/// One column laid out for writing
enum ColumnData {
    Byte(Vec<Option<i8>>),
    Int(Vec<Option<i16>>),
    Long(Vec<Option<i32>>),
    Float(Vec<Option<f32>>),
    Double(Vec<Option<f64>>),
    Text(Vec<Vec<u8>>),
}

struct PlannedColumn {
    var_type: VarType,
    format: String,
    data: ColumnData,
}

impl PlannedColumn {
    fn numeric(var_type: VarType, format: &str, data: ColumnData) -> Self {
        PlannedColumn {
            var_type,
            format: format.to_string(),
            data,
        }
    }

    fn plan(array: &ArrayRef) -> Result<Self> {
        let column = match array.data_type() {
            DataType::Boolean => {
                let values = array.as_boolean().iter().map(|v| v.map(i8::from)).collect();
                Self::numeric(VarType::Byte, "%8.0g", ColumnData::Byte(values))
            }
            DataType::UInt64
                if array
                    .as_primitive::<UInt64Type>()
                    .iter()
                    .flatten()
                    .any(|v| v > i64::MAX as u64) =>
            {
                let values = array
                    .as_primitive::<UInt64Type>()
                    .iter()
                    .map(|v| v.map(|v| v as f64))
                    .collect();
                Self::numeric(VarType::Double, "%10.0g", ColumnData::Double(values))
            }
            dt if dt.is_integer() => {
                let ints = cast(array, &DataType::Int64)?;
                Self::plan_integers(ints.as_primitive::<Int64Type>().iter().collect())
            }
            DataType::Float16 | DataType::Float32 => {
                let floats = cast(array, &DataType::Float32)?;
                let values = floats
                    .as_primitive::<Float32Type>()
                    .iter()
                    .map(|v| v.filter(|v| v.is_finite()))
                    .collect();
                Self::numeric(VarType::Float, "%9.0g", ColumnData::Float(values))
            }
            DataType::Float64 => {
                let values = array
                    .as_primitive::<Float64Type>()
                    .iter()
                    .map(|v| v.filter(|v| v.is_finite()))
                    .collect();
                Self::numeric(VarType::Double, "%10.0g", ColumnData::Double(values))
            }
            DataType::Date32 | DataType::Date64 => {
                let days = cast(&cast(array, &DataType::Date32)?, &DataType::Int32)?;
                let values = days
                    .as_primitive::<arrow::datatypes::Int32Type>()
                    .iter()
                    .map(|d| {
                        d.and_then(|d| i32::try_from(i64::from(d) + STATA_EPOCH_DAYS).ok())
                            .filter(|d| *d <= LONG_MAX)
                    })
                    .collect();
                Self::numeric(VarType::Long, "%td", ColumnData::Long(values))
            }
            DataType::Timestamp(_, tz) => {
                let millis = cast(array, &DataType::Timestamp(TimeUnit::Millisecond, tz.clone()))?;
                let raw = cast(&millis, &DataType::Int64)?;
                let values = raw
                    .as_primitive::<Int64Type>()
                    .iter()
                    .map(|v| v.map(|ms| (ms + STATA_EPOCH_MS) as f64))
                    .collect();
                Self::numeric(VarType::Double, "%tc", ColumnData::Double(values))
            }
            DataType::Binary | DataType::LargeBinary => {
                let bytes = cast(array, &DataType::Binary)?;
                let values = bytes
                    .as_binary::<i32>()
                    .iter()
                    .map(|v| v.unwrap_or_default().to_vec())
                    .collect();
                Self::text(values)
            }
            _ => {
                let options = FormatOptions::default().with_null("");
                let formatter = ArrayFormatter::try_new(array.as_ref(), &options)?;
                let values = (0..array.len())
                    .map(|i| formatter.value(i).to_string().into_bytes())
                    .collect();
                Self::text(values)
            }
        };
        Ok(column)
    }

    /// Smallest Stata integer type that holds every value, double past `long`
    fn plan_integers(values: Vec<Option<i64>>) -> Self {
        let (min, max) = values
            .iter()
            .flatten()
            .fold((0i64, 0i64), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
        if min >= -127 && max <= i64::from(BYTE_MAX) {
            let data = values.into_iter().map(|v| v.map(|v| v as i8)).collect();
            Self::numeric(VarType::Byte, "%8.0g", ColumnData::Byte(data))
        } else if min >= -32767 && max <= i64::from(INT_MAX) {
            let data = values.into_iter().map(|v| v.map(|v| v as i16)).collect();
            Self::numeric(VarType::Int, "%8.0g", ColumnData::Int(data))
        } else if min >= -2_147_483_647 && max <= i64::from(LONG_MAX) {
            let data = values.into_iter().map(|v| v.map(|v| v as i32)).collect();
            Self::numeric(VarType::Long, "%12.0g", ColumnData::Long(data))
        } else {
            let data = values.into_iter().map(|v| v.map(|v| v as f64)).collect();
            Self::numeric(VarType::Double, "%10.0g", ColumnData::Double(data))
        }
    }

    fn text(values: Vec<Vec<u8>>) -> Self {
        let longest = values.iter().map(Vec::len).max().unwrap_or(0);
        let (var_type, format) = if longest > MAX_STR_WIDTH {
            (VarType::StrL, "%9s".to_string())
        } else {
            let width = longest.max(1);
            (VarType::Str(width), format!("%{}s", width.min(2045)))
        };
        PlannedColumn {
            var_type,
            format,
            data: ColumnData::Text(values),
        }
    }
}

/// Make column names legal Stata variable names
///
/// Names keep ASCII letters, digits and `_`, must not start with a digit,
/// are at most 32 characters, avoid reserved words and stay unique.
pub fn sanitize_names<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    const RESERVED: &[&str] = &[
        "_all", "_b", "byte", "_coef", "_cons", "double", "float", "if", "in", "int", "long",
        "_n", "_N", "_pi", "_pred", "_rc", "_skip", "strL", "using", "with",
    ];
    let mut seen = HashSet::new();
    let mut result = Vec::with_capacity(names.len());
    for original in names {
        let original = original.as_ref();
        let mut name: String = original
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        if name.is_empty()
            || name.starts_with(|c: char| c.is_ascii_digit())
            || RESERVED.contains(&name.as_str())
        {
            name.insert(0, '_');
        }
        name.truncate(32);

        let mut candidate = name.clone();
        let mut suffix = 1;
        while !seen.insert(candidate.clone()) {
            let tag = format!("_{}", suffix);
            let keep = 32usize.saturating_sub(tag.len()).min(name.len());
            candidate = format!("{}{}", &name[..keep], tag);
            suffix += 1;
        }
        if candidate != original {
            log::warn!("Renamed column '{}' to '{}' for Stata", original, candidate);
        }
        result.push(candidate);
    }
    result
}

fn open_tag(out: &mut Vec<u8>, tag: &str) {
    out.push(b'<');
    out.extend_from_slice(tag.as_bytes());
    out.push(b'>');
}

fn close_tag(out: &mut Vec<u8>, tag: &str) {
    out.extend_from_slice(b"</");
    out.extend_from_slice(tag.as_bytes());
    out.push(b'>');
}

fn fixed(out: &mut Vec<u8>, text: &str, width: usize) {
    let bytes = text.as_bytes();
    let len = bytes.len().min(width - 1);
    out.extend_from_slice(&bytes[..len]);
    out.resize(out.len() + width - len, 0);
}

/// Encode a complete release 118 little-endian file
pub fn encode_dta(batch: &RecordBatch) -> Result<Vec<u8>> {
    let schema = batch.schema();
    if schema.fields().len() > 32_767 {
        return Err(ConvertError::Write(
            "Stata files hold at most 32767 variables".to_string(),
        ));
    }
    let names = sanitize_names(
        &schema
            .fields()
            .iter()
            .map(|f| f.name().as_str())
            .collect::<Vec<_>>(),
    );
    let columns = batch
        .columns()
        .iter()
        .map(PlannedColumn::plan)
        .collect::<Result<Vec<_>>>()?;
    let rows = batch.num_rows();
    let nvar = columns.len();

    let mut out = Vec::new();
    let mut map = [0u64; 14];

    out.extend_from_slice(b"<stata_dta><header><release>118</release><byteorder>LSF</byteorder>");
    open_tag(&mut out, "K");
    out.extend_from_slice(&(nvar as u16).to_le_bytes());
    close_tag(&mut out, "K");
    open_tag(&mut out, "N");
    out.extend_from_slice(&(rows as u64).to_le_bytes());
    close_tag(&mut out, "N");
    open_tag(&mut out, "label");
    out.extend_from_slice(&0u16.to_le_bytes());
    close_tag(&mut out, "label");
    open_tag(&mut out, "timestamp");
    let stamp = chrono::Utc::now().format("%d %b %Y %H:%M").to_string();
    out.push(stamp.len() as u8);
    out.extend_from_slice(stamp.as_bytes());
    close_tag(&mut out, "timestamp");
    close_tag(&mut out, "header");

    // The map is patched once every section offset is known
    map[1] = out.len() as u64;
    open_tag(&mut out, "map");
    let map_at = out.len();
    out.resize(out.len() + 14 * 8, 0);
    close_tag(&mut out, "map");

    map[2] = out.len() as u64;
    open_tag(&mut out, "variable_types");
    for column in &columns {
        out.extend_from_slice(&column.var_type.code().to_le_bytes());
    }
    close_tag(&mut out, "variable_types");

    map[3] = out.len() as u64;
    open_tag(&mut out, "varnames");
    for name in &names {
        fixed(&mut out, name, 129);
    }
    close_tag(&mut out, "varnames");

    map[4] = out.len() as u64;
    open_tag(&mut out, "sortlist");
    out.resize(out.len() + (nvar + 1) * 2, 0);
    close_tag(&mut out, "sortlist");

    map[5] = out.len() as u64;
    open_tag(&mut out, "formats");
    for column in &columns {
        fixed(&mut out, &column.format, 57);
    }
    close_tag(&mut out, "formats");

    map[6] = out.len() as u64;
    open_tag(&mut out, "value_label_names");
    out.resize(out.len() + nvar * 129, 0);
    close_tag(&mut out, "value_label_names");

    map[7] = out.len() as u64;
    open_tag(&mut out, "variable_labels");
    out.resize(out.len() + nvar * 321, 0);
    close_tag(&mut out, "variable_labels");

    map[8] = out.len() as u64;
    out.extend_from_slice(b"<characteristics></characteristics>");

    map[9] = out.len() as u64;
    open_tag(&mut out, "data");
    for row in 0..rows {
        for (var, column) in columns.iter().enumerate() {
            match &column.data {
                ColumnData::Byte(v) => out.push(v[row].unwrap_or(BYTE_MISSING) as u8),
                ColumnData::Int(v) => {
                    out.extend_from_slice(&v[row].unwrap_or(INT_MISSING).to_le_bytes())
                }
                ColumnData::Long(v) => {
                    out.extend_from_slice(&v[row].unwrap_or(LONG_MISSING).to_le_bytes())
                }
                ColumnData::Float(v) => {
                    let bits = v[row].map_or(FLOAT_MISSING_BITS, f32::to_bits);
                    out.extend_from_slice(&bits.to_le_bytes());
                }
                ColumnData::Double(v) => {
                    let bits = v[row].map_or(DOUBLE_MISSING_BITS, f64::to_bits);
                    out.extend_from_slice(&bits.to_le_bytes());
                }
                ColumnData::Text(v) => match column.var_type {
                    VarType::StrL if v[row].is_empty() => out.extend_from_slice(&[0; 8]),
                    VarType::StrL => {
                        out.extend_from_slice(&(var as u16 + 1).to_le_bytes());
                        out.extend_from_slice(&((row as u64) + 1).to_le_bytes()[..6]);
                    }
                    _ => {
                        let width = column.var_type.width();
                        out.extend_from_slice(&v[row]);
                        out.resize(out.len() + width - v[row].len(), 0);
                    }
                },
            }
        }
    }
    close_tag(&mut out, "data");

    map[10] = out.len() as u64;
    open_tag(&mut out, "strls");
    for (var, column) in columns.iter().enumerate() {
        if let (VarType::StrL, ColumnData::Text(values)) = (column.var_type, &column.data) {
            for (row, value) in values.iter().enumerate().filter(|(_, v)| !v.is_empty()) {
                out.extend_from_slice(b"GSO");
                out.extend_from_slice(&(var as u32 + 1).to_le_bytes());
                out.extend_from_slice(&(row as u64 + 1).to_le_bytes());
                out.push(130);
                out.extend_from_slice(&(value.len() as u32 + 1).to_le_bytes());
                out.extend_from_slice(value);
                out.push(0);
            }
        }
    }
    close_tag(&mut out, "strls");

    map[11] = out.len() as u64;
    out.extend_from_slice(b"<value_labels></value_labels>");
    map[12] = out.len() as u64;
    close_tag(&mut out, "stata_dta");
    map[13] = out.len() as u64;

    for (i, offset) in map.iter().enumerate() {
        let at = map_at + i * 8;
        out[at..at + 8].copy_from_slice(&offset.to_le_bytes());
    }
    Ok(out)
}

/// Buffers every batch; the file is only written by `finish`
pub struct StataSink {
    path: std::path::PathBuf,
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

impl StataSink {
    pub fn new<P: AsRef<Path>>(path: P, schema: SchemaRef) -> Self {
        StataSink {
            path: path.as_ref().to_path_buf(),
            schema,
            batches: Vec::new(),
        }
    }
}

impl TableSink for StataSink {
    fn write_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        self.batches.push(batch.clone());
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let batch = concat_batches(&self.schema, &self.batches)?;
        let bytes = encode_dta(&batch)?;
        std::fs::write(&self.path, bytes).map_err(|e| {
            ConvertError::Write(format!("Failed to write {}: {}", self.path.display(), e))
        })?;
        log::debug!("Stata file written with {} observation(s)", batch.num_rows());
        Ok(())
    }
}

pub fn open_stata(
    path: &Path,
    schema: SchemaRef,
    _options: &WriteOptions,
) -> Result<Box<dyn TableSink>> {
    Ok(Box::new(StataSink::new(path, schema)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{BooleanArray, Int64Array, UInt8Array};
    use tempfile::tempdir;

    fn sample() -> RecordBatch {
        RecordBatch::try_from_iter([
            ("id", Arc::new(Int64Array::from(vec![Some(1), None, Some(300)])) as ArrayRef),
            ("small", Arc::new(UInt8Array::from(vec![1, 2, 3])) as ArrayRef),
            (
                "ratio",
                Arc::new(Float64Array::from(vec![Some(0.5), Some(f64::NAN), None])) as ArrayRef,
            ),
            ("flag", Arc::new(BooleanArray::from(vec![true, false, true])) as ArrayRef),
            ("when", Arc::new(Date32Array::from(vec![Some(0), Some(19723), None])) as ArrayRef),
            (
                "name",
                Arc::new(StringArray::from(vec![Some("ä"), None, Some("long text")])) as ArrayRef,
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_roundtrip_types_and_missing() -> Result<()> {
        let bytes = encode_dta(&sample())?;
        let reader = StataReader::from_bytes(bytes)?;
        assert_eq!(reader.release(), 118);
        assert_eq!(reader.row_count(), 3);

        let batch = reader.to_batch(false, None)?;
        let schema = batch.schema();
        assert_eq!(schema.field(0).data_type(), &DataType::Int16);
        assert_eq!(schema.field(1).data_type(), &DataType::Int8);
        assert_eq!(schema.field(2).data_type(), &DataType::Float64);
        assert_eq!(schema.field(4).data_type(), &DataType::Date32);
        assert_eq!(schema.field(5).data_type(), &DataType::Utf8);

        let ids = batch.column(0).as_primitive::<arrow::datatypes::Int16Type>();
        assert_eq!(ids.value(2), 300);
        assert!(ids.is_null(1));
        assert!(batch.column(2).is_null(1));
        assert!(batch.column(2).is_null(2));

        let dates = batch.column(4).as_primitive::<arrow::datatypes::Date32Type>();
        assert_eq!(dates.value(1), 19723);
        assert!(dates.is_null(2));

        let names = batch.column(5).as_string::<i32>();
        assert_eq!(names.value(0), "ä");
        assert_eq!(names.value(1), "");
        assert_eq!(names.value(2), "long text");
        Ok(())
    }

    #[test]
    fn test_strl_and_keep_bytes() -> Result<()> {
        let long = "x".repeat(3000);
        let batch = RecordBatch::try_from_iter([(
            "notes",
            Arc::new(StringArray::from(vec![long.as_str(), "", "short"])) as ArrayRef,
        )])?;
        let reader = StataReader::from_bytes(encode_dta(&batch)?)?;

        let text = reader.to_batch(false, None)?;
        let notes = text.column(0).as_string::<i32>();
        assert_eq!(notes.value(0).len(), 3000);
        assert_eq!(notes.value(1), "");
        assert_eq!(notes.value(2), "short");

        let raw = reader.to_batch(true, Some(1))?;
        assert_eq!(raw.num_rows(), 1);
        assert_eq!(raw.schema().field(0).data_type(), &DataType::Binary);
        Ok(())
    }

    #[test]
    fn test_name_sanitizing() {
        let long = "a".repeat(40);
        let names = sanitize_names(&["first name", "1st", "in", "first_name", long.as_str()]);
        assert_eq!(names[0], "first_name");
        assert_eq!(names[1], "_1st");
        assert_eq!(names[2], "_in");
        assert_eq!(names[3], "first_name_1");
        assert_eq!(names[4].len(), 32);
    }

    #[test]
    fn test_sink_writes_only_on_finish() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("out.dta");
        let batch = sample();
        let mut sink = open_stata(&path, batch.schema(), &WriteOptions::default())?;
        sink.write_batch(&batch.slice(0, 2))?;
        sink.write_batch(&batch.slice(2, 1))?;
        assert!(!path.exists());
        sink.finish()?;

        let options = ReadOptions {
            chunk_size: Some(2),
            ..ReadOptions::default()
        };
        let sizes: Vec<usize> = read_stata(&path, &options)?
            .map(|b| b.map(|b| b.num_rows()))
            .collect::<Result<_>>()?;
        assert_eq!(sizes, vec![2, 1]);
        Ok(())
    }

    #[test]
    fn test_rejects_old_release() {
        assert!(matches!(
            StataReader::from_bytes(vec![114, 2, 1, 0]),
            Err(ConvertError::Read { .. })
        ));
    }
}
