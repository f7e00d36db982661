//! SPSS `.sav` system files (read only)
//!
//! Supports uncompressed and bytecode-compressed files in either byte order,
//! long variable names, the character encoding record and SPSS date formats.
//! System-missing values and user-defined numeric missing values become
//! nulls. Zlib-compressed `.zsav` files are inflated block by block from
//! the index in their trailer.

use crate::error::{ConvertError, Result};
use crate::request::ReadOptions;
use crate::stream::BatchStream;
use arrow::array::{
    ArrayRef, BinaryArray, Date32Array, Float64Array, StringArray, TimestampMillisecondArray,
};
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use flate2::read::ZlibDecoder;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

/// Seconds from 1582-10-14 (SPSS epoch) to 1970-01-01
const SPSS_EPOCH_SECONDS: f64 = 12_219_379_200.0;
const SYSMIS: f64 = -f64::MAX;
const HEADER_LEN: usize = 176;

/// Print format types that hold a calendar date
const DATE_FORMATS: &[u32] = &[20, 23, 24, 28, 29, 30, 38, 39];
/// Print format types that hold a date and time
const DATETIME_FORMATS: &[u32] = &[22, 41];

fn truncated() -> ConvertError {
    ConvertError::read("SPSS file is truncated")
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    big_endian: bool,
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

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn i32(&mut self) -> Result<i32> {
        let bytes = self.array::<4>()?;
        Ok(if self.big_endian {
            i32::from_be_bytes(bytes)
        } else {
            i32::from_le_bytes(bytes)
        })
    }

    fn i64(&mut self) -> Result<i64> {
        let bytes = self.array::<8>()?;
        Ok(if self.big_endian {
            i64::from_be_bytes(bytes)
        } else {
            i64::from_le_bytes(bytes)
        })
    }

    /// Non-negative 64-bit offset or size
    fn offset(&mut self) -> Result<usize> {
        usize::try_from(self.i64()?).map_err(|_| ConvertError::read("Negative offset in SPSS file"))
    }

    fn f64(&mut self) -> Result<f64> {
        let bytes = self.array::<8>()?;
        Ok(self.decode_f64(bytes))
    }

    fn decode_f64(&self, bytes: [u8; 8]) -> f64 {
        if self.big_endian {
            f64::from_be_bytes(bytes)
        } else {
            f64::from_le_bytes(bytes)
        }
    }

    fn encode_f64(&self, value: f64) -> [u8; 8] {
        if self.big_endian {
            value.to_be_bytes()
        } else {
            value.to_le_bytes()
        }
    }

    /// Non-negative count field
    fn count(&mut self) -> Result<usize> {
        usize::try_from(self.i32()?).map_err(|_| ConvertError::read("Negative count in SPSS file"))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum MissingValues {
    None,
    Discrete(Vec<f64>),
    Range { low: f64, high: f64, discrete: Option<f64> },
}

impl MissingValues {
    fn contains(&self, value: f64) -> bool {
        match self {
            MissingValues::None => false,
            MissingValues::Discrete(values) => values.contains(&value),
            MissingValues::Range { low, high, discrete } => {
                (*low..=*high).contains(&value) || *discrete == Some(value)
            }
        }
    }
}

/// One dictionary variable (continuation records folded in)
#[derive(Debug, Clone)]
struct Variable {
    name: String,
    /// 0 for numeric, otherwise the string width in bytes
    width: usize,
    /// Index of the first 8-byte slot in a case
    slot: usize,
    slots: usize,
    format_type: u32,
    missing: MissingValues,
}

/// Parsed `.sav` file
pub struct SpssReader {
    data: Vec<u8>,
    big_endian: bool,
    compression: i32,
    bias: f64,
    case_count: Option<usize>,
    slots_per_case: usize,
    variables: Vec<Variable>,
    utf8: bool,
    data_start: usize,
}

impl SpssReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_bytes(std::fs::read(path.as_ref())?)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(truncated());
        }
        let zlib_magic = match &data[..4] {
            b"$FL2" => false,
            b"$FL3" => true,
            _ => return Err(ConvertError::read("Not an SPSS system file")),
        };

        // layout_code is 2 or 3 in the file's own byte order
        let layout = i32::from_le_bytes([data[64], data[65], data[66], data[67]]);
        let big_endian = !matches!(layout, 2 | 3);

        let mut cur = Cursor {
            data: &data,
            pos: 64,
            big_endian,
        };
        cur.i32()?;
        let nominal_case_size = cur.i32()?;
        let compression = cur.i32()?;
        if (compression == 2) != zlib_magic || !(0..=2).contains(&compression) {
            return Err(ConvertError::read(format!(
                "Unexpected SPSS compression code {}",
                compression
            )));
        }
        let _weight_index = cur.i32()?;
        let ncases = cur.i32()?;
        let bias = cur.f64()?;
        cur.pos = HEADER_LEN;

        let mut variables: Vec<Variable> = Vec::new();
        let mut slot = 0usize;
        let mut long_names = HashMap::new();
        let mut encoding: Option<String> = None;

        loop {
            match cur.i32()? {
                2 => {
                    let var_type = cur.i32()?;
                    let has_label = cur.i32()?;
                    let n_missing = cur.i32()?;
                    let print = cur.i32()? as u32;
                    let _write = cur.i32()?;
                    let name = String::from_utf8_lossy(cur.take(8)?).trim_end().to_string();
                    if has_label == 1 {
                        let len = cur.count()?;
                        cur.take(len.div_ceil(4) * 4)?;
                    }
                    let mut missing_values = Vec::with_capacity(n_missing.unsigned_abs() as usize);
                    for _ in 0..n_missing.unsigned_abs() {
                        missing_values.push(cur.f64()?);
                    }

                    if var_type == -1 {
                        // Continuation of the previous string variable
                        if let Some(last) = variables.last_mut() {
                            last.slots += 1;
                        }
                        slot += 1;
                        continue;
                    }
                    let missing = match (var_type, n_missing) {
                        (0, 1..=3) => MissingValues::Discrete(missing_values),
                        (0, -2) => MissingValues::Range {
                            low: missing_values[0],
                            high: missing_values[1],
                            discrete: None,
                        },
                        (0, -3) => MissingValues::Range {
                            low: missing_values[0],
                            high: missing_values[1],
                            discrete: Some(missing_values[2]),
                        },
                        _ => MissingValues::None,
                    };
                    variables.push(Variable {
                        name,
                        width: usize::try_from(var_type).unwrap_or(0),
                        slot,
                        slots: 1,
                        format_type: (print >> 16) & 0xFF,
                        missing,
                    });
                    slot += 1;
                }
                3 => {
                    let count = cur.count()?;
                    for _ in 0..count {
                        cur.take(8)?;
                        let len = cur.take(1)?[0] as usize;
                        cur.take((len + 1).div_ceil(8) * 8 - 1)?;
                    }
                    // Value labels are always followed by the variable index record
                    if cur.i32()? != 4 {
                        return Err(ConvertError::read("Malformed SPSS value label record"));
                    }
                    let vars = cur.count()?;
                    cur.take(vars * 4)?;
                }
                6 => {
                    let lines = cur.count()?;
                    cur.take(lines * 80)?;
                }
                7 => {
                    let subtype = cur.i32()?;
                    let size = cur.count()?;
                    let count = cur.count()?;
                    let payload = cur.take(size * count)?;
                    match subtype {
                        13 => {
                            for pair in String::from_utf8_lossy(payload).split('\t') {
                                if let Some((short, long)) = pair.split_once('=') {
                                    long_names.insert(short.to_string(), long.to_string());
                                }
                            }
                        }
                        20 => encoding = Some(String::from_utf8_lossy(payload).trim().to_string()),
                        _ => log::debug!("Skipping SPSS extension record subtype {}", subtype),
                    }
                }
                999 => {
                    cur.i32()?;
                    break;
                }
                other => {
                    return Err(ConvertError::read(format!(
                        "Unknown SPSS record type {} at byte {}",
                        other,
                        cur.pos - 4
                    )))
                }
            }
        }

        for variable in &mut variables {
            if let Some(long) = long_names.get(&variable.name) {
                variable.name = long.clone();
            }
        }

        let utf8 = encoding
            .as_deref()
            .is_none_or(|e| e.eq_ignore_ascii_case("utf-8") || e.eq_ignore_ascii_case("utf8"));
        let slots_per_case = if nominal_case_size > 0 {
            nominal_case_size as usize
        } else {
            slot
        };
        log::debug!(
            "SPSS file: {} variable(s), {} slot(s) per case, compression {}, encoding {:?}",
            variables.len(),
            slots_per_case,
            compression,
            encoding
        );

        let data_start = cur.pos;
        Ok(SpssReader {
            big_endian,
            compression,
            bias,
            case_count: usize::try_from(ncases).ok(),
            slots_per_case,
            variables,
            utf8,
            data_start,
            data,
        })
    }

    pub fn variable_names(&self) -> Vec<&str> {
        self.variables.iter().map(|v| v.name.as_str()).collect()
    }

    /// Raw case data, decompressed when needed
    fn case_bytes(&self) -> Result<Vec<u8>> {
        let body = &self.data[self.data_start..];
        match self.compression {
            0 => Ok(body.to_vec()),
            1 => self.expand_bytecode(body),
            _ => self.expand_bytecode(&self.inflate_blocks()?),
        }
    }

    /// Concatenated zlib blocks listed in the `.zsav` trailer
    fn inflate_blocks(&self) -> Result<Vec<u8>> {
        let mut cur = Cursor {
            data: &self.data,
            pos: self.data_start,
            big_endian: self.big_endian,
        };
        let _zheader_offset = cur.offset()?;
        let trailer_offset = cur.offset()?;
        let _trailer_len = cur.offset()?;

        cur.pos = trailer_offset;
        let _bias = cur.i64()?;
        let _zero = cur.i64()?;
        let _block_size = cur.count()?;
        let blocks = cur.count()?;

        let mut out = Vec::new();
        for _ in 0..blocks {
            let _uncompressed_offset = cur.offset()?;
            let compressed_offset = cur.offset()?;
            let uncompressed_size = cur.count()?;
            let compressed_size = cur.count()?;
            let block = compressed_offset
                .checked_add(compressed_size)
                .and_then(|end| self.data.get(compressed_offset..end))
                .ok_or_else(truncated)?;
            let before = out.len();
            ZlibDecoder::new(block)
                .read_to_end(&mut out)
                .map_err(|e| ConvertError::read(format!("Corrupt .zsav block: {}", e)))?;
            if out.len() - before != uncompressed_size {
                return Err(ConvertError::read(format!(
                    ".zsav block inflated to {} bytes, expected {}",
                    out.len() - before,
                    uncompressed_size
                )));
            }
        }
        Ok(out)
    }

    /// Undo bytecode compression: 8 command bytes, then the raw slots they ask for
    fn expand_bytecode(&self, body: &[u8]) -> Result<Vec<u8>> {
        let cur = Cursor {
            data: body,
            pos: 0,
            big_endian: self.big_endian,
        };
        let mut out = Vec::with_capacity(body.len() * 2);
        let mut pos = 0;
        'blocks: while pos + 8 <= body.len() {
            let commands = &body[pos..pos + 8];
            pos += 8;
            for &code in commands {
                match code {
                    0 => {}
                    252 => break 'blocks,
                    253 => {
                        let raw = body.get(pos..pos + 8).ok_or_else(truncated)?;
                        out.extend_from_slice(raw);
                        pos += 8;
                    }
                    254 => out.extend_from_slice(b"        "),
                    255 => out.extend_from_slice(&cur.encode_f64(SYSMIS)),
                    n => out.extend_from_slice(&cur.encode_f64(f64::from(n) - self.bias)),
                }
            }
        }
        Ok(out)
    }

    fn decode_text(&self, bytes: &[u8]) -> String {
        match std::str::from_utf8(bytes) {
            Ok(text) if self.utf8 => text.to_string(),
            _ => bytes.iter().map(|b| char::from(*b)).collect(),
        }
    }

    /// Decode up to `limit` cases into one batch
    pub fn to_batch(&self, keep_bytes: bool, limit: Option<usize>) -> Result<RecordBatch> {
        let cases = self.case_bytes()?;
        let case_len = self.slots_per_case * 8;
        let mut rows = if case_len == 0 { 0 } else { cases.len() / case_len };
        if let Some(count) = self.case_count {
            rows = rows.min(count);
        }
        if let Some(limit) = limit {
            rows = rows.min(limit);
        }

        let cur = Cursor {
            data: &cases,
            pos: 0,
            big_endian: self.big_endian,
        };
        let mut fields = Vec::with_capacity(self.variables.len());
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(self.variables.len());
        for variable in &self.variables {
            let start = variable.slot * 8;
            let cell = |row: usize| {
                let at = row * case_len + start;
                &cases[at..at + variable.slots * 8]
            };

            let column: ArrayRef = if variable.width > 0 {
                let values = (0..rows).map(|row| {
                    let raw = cell(row);
                    let raw = &raw[..variable.width.min(raw.len())];
                    let end = raw.iter().rposition(|b| *b != b' ' && *b != 0).map_or(0, |i| i + 1);
                    &raw[..end]
                });
                if keep_bytes {
                    Arc::new(BinaryArray::from_iter_values(values))
                } else {
                    Arc::new(StringArray::from_iter_values(values.map(|v| self.decode_text(v))))
                }
            } else {
                let values = (0..rows).map(|row| {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(&cell(row)[..8]);
                    let value = cur.decode_f64(bytes);
                    (value != SYSMIS && !value.is_nan() && !variable.missing.contains(value))
                        .then_some(value)
                });
                if DATE_FORMATS.contains(&variable.format_type) {
                    let days = |secs: f64| ((secs - SPSS_EPOCH_SECONDS) / 86_400.0).floor() as i32;
                    Arc::new(values.map(|v| v.map(days)).collect::<Date32Array>())
                } else if DATETIME_FORMATS.contains(&variable.format_type) {
                    let millis = |secs: f64| ((secs - SPSS_EPOCH_SECONDS) * 1000.0).round() as i64;
                    Arc::new(
                        values
                            .map(|v| v.map(millis))
                            .collect::<TimestampMillisecondArray>(),
                    )
                } else {
                    Arc::new(values.collect::<Float64Array>())
                }
            };
            fields.push(Field::new(&variable.name, column.data_type().clone(), true));
            columns.push(column);
        }

        let options = RecordBatchOptions::new().with_row_count(Some(rows));
        Ok(RecordBatch::try_new_with_options(
            Arc::new(Schema::new(fields)),
            columns,
            &options,
        )?)
    }
}

pub fn read_spss(path: &Path, options: &ReadOptions) -> Result<BatchStream> {
    let reader = SpssReader::open(path)?;
    let batch = reader.to_batch(options.keep_bytes, options.row_limit)?;
    Ok(BatchStream::once(batch).chunked(options.chunk_size))
}
