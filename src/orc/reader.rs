//! ORC file reader, one stripe per batch

use super::proto::{fields, malformed};
use super::rle::{decode_bools, decode_bytes, decode_ints, IntRle};
use super::{decompress, encoding, kind, stream, OrcCompression, MAGIC, TIMESTAMP_BASE};
use crate::error::{ConvertError, Result};
use crate::request::ReadOptions;
use crate::stream::BatchStream;
use arrow::array::{
    ArrayRef, BinaryArray, BooleanArray, Date32Array, Decimal128Array, Float32Array, Float64Array,
    Int16Array, Int32Array, Int64Array, Int8Array, StringArray, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Location and size of one stripe
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct StripeInfo {
    pub(crate) offset: u64,
    pub(crate) index_length: u64,
    pub(crate) data_length: u64,
    pub(crate) footer_length: u64,
    pub(crate) rows: u64,
}

impl StripeInfo {
    fn parse(data: &[u8]) -> Result<Self> {
        let mut info = StripeInfo::default();
        for field in fields(data) {
            let (number, value) = field?;
            match number {
                1 => info.offset = value.uint()?,
                2 => info.index_length = value.uint()?,
                3 => info.data_length = value.uint()?,
                4 => info.footer_length = value.uint()?,
                5 => info.rows = value.uint()?,
                _ => {}
            }
        }
        Ok(info)
    }
}

/// One node of the ORC type tree
#[derive(Debug, Clone, Default)]
struct OrcType {
    kind: u64,
    subtypes: Vec<u64>,
    field_names: Vec<String>,
    precision: u64,
    scale: u64,
}

impl OrcType {
    fn parse(data: &[u8]) -> Result<Self> {
        let mut ty = OrcType::default();
        for field in fields(data) {
            let (number, value) = field?;
            match number {
                1 => ty.kind = value.uint()?,
                2 => value.uints(&mut ty.subtypes)?,
                3 => ty.field_names.push(value.string()?),
                5 => ty.precision = value.uint()?,
                6 => ty.scale = value.uint()?,
                _ => {}
            }
        }
        Ok(ty)
    }
}

/// Leaf column of the root struct
#[derive(Debug, Clone)]
struct Column {
    id: u32,
    kind: u64,
    data_type: DataType,
}

fn arrow_type(name: &str, ty: &OrcType) -> Result<DataType> {
    let data_type = match ty.kind {
        kind::BOOLEAN => DataType::Boolean,
        kind::BYTE => DataType::Int8,
        kind::SHORT => DataType::Int16,
        kind::INT => DataType::Int32,
        kind::LONG => DataType::Int64,
        kind::FLOAT => DataType::Float32,
        kind::DOUBLE => DataType::Float64,
        kind::STRING | kind::VARCHAR | kind::CHAR => DataType::Utf8,
        kind::BINARY => DataType::Binary,
        kind::DATE => DataType::Date32,
        kind::TIMESTAMP => DataType::Timestamp(TimeUnit::Microsecond, None),
        kind::TIMESTAMP_INSTANT => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        kind::DECIMAL => {
            let precision = if ty.precision == 0 { 38 } else { ty.precision.min(38) };
            DataType::Decimal128(precision as u8, ty.scale.min(38) as i8)
        }
        other => {
            return Err(ConvertError::read(format!(
                "ORC column '{}' has unsupported type kind {} (only flat schemas are read)",
                name, other
            )))
        }
    };
    Ok(data_type)
}

/// Open ORC file with its tail decoded
pub struct OrcReader {
    path: PathBuf,
    file: File,
    compression: OrcCompression,
    block_size: usize,
    schema: SchemaRef,
    columns: Vec<Column>,
    stripes: Vec<StripeInfo>,
    row_count: u64,
}

impl OrcReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let len = file.metadata()?.len();
        let not_orc = || ConvertError::read(format!("{} is not an ORC file", path.display()));

        let mut head = [0u8; 3];
        if len < 4 || file.read_exact(&mut head).is_err() || &head != MAGIC {
            return Err(not_orc());
        }

        let mut ps_len = [0u8; 1];
        file.seek(SeekFrom::Start(len - 1))?;
        file.read_exact(&mut ps_len)?;
        let ps_len = u64::from(ps_len[0]);
        if ps_len + 4 > len {
            return Err(not_orc());
        }
        let postscript = read_at(&mut file, len - 1 - ps_len, ps_len)?;

        let mut footer_length = 0;
        let mut compression = OrcCompression::None;
        let mut block_size = super::BLOCK_SIZE;
        for field in fields(&postscript) {
            let (number, value) = field?;
            match number {
                1 => footer_length = value.uint()?,
                2 => compression = OrcCompression::from_code(value.uint()?)?,
                3 => block_size = value.uint()? as usize,
                8000 if value.bytes()? != MAGIC => return Err(not_orc()),
                _ => {}
            }
        }
        if footer_length + ps_len + 4 > len {
            return Err(malformed("footer longer than the file"));
        }

        let raw_footer = read_at(&mut file, len - 1 - ps_len - footer_length, footer_length)?;
        let footer = decompress(compression, &raw_footer, block_size)?;
        let mut types = Vec::new();
        let mut stripes = Vec::new();
        let mut row_count = 0;
        for field in fields(&footer) {
            let (number, value) = field?;
            match number {
                3 => stripes.push(StripeInfo::parse(value.bytes()?)?),
                4 => types.push(OrcType::parse(value.bytes()?)?),
                6 => row_count = value.uint()?,
                _ => {}
            }
        }

        let root = types.first().ok_or_else(|| malformed("empty type tree"))?;
        if root.kind != kind::STRUCT {
            return Err(ConvertError::read("ORC root type is not a struct"));
        }
        let mut fields_out = Vec::with_capacity(root.subtypes.len());
        let mut columns = Vec::with_capacity(root.subtypes.len());
        for (i, id) in root.subtypes.iter().enumerate() {
            let name = root
                .field_names
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("_col{}", i));
            let ty = types
                .get(*id as usize)
                .ok_or_else(|| malformed("subtype outside the type tree"))?;
            let data_type = arrow_type(&name, ty)?;
            fields_out.push(Field::new(name, data_type.clone(), true));
            columns.push(Column {
                id: *id as u32,
                kind: ty.kind,
                data_type,
            });
        }

        log::debug!(
            "ORC {} has {} row(s) in {} stripe(s), {:?} compression",
            path.display(),
            row_count,
            stripes.len(),
            compression
        );
        Ok(OrcReader {
            path,
            file,
            compression,
            block_size,
            schema: Arc::new(Schema::new(fields_out)),
            columns,
            stripes,
            row_count,
        })
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// Total number of rows according to the footer
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// Decode stripes lazily, stopping after `limit` rows
    pub fn batches(self, limit: Option<usize>) -> BatchStream {
        let schema = self.schema.clone();
        let stripes = OrcStripes {
            remaining: limit.unwrap_or(usize::MAX),
            next: 0,
            reader: self,
        };
        BatchStream::new(schema, stripes)
    }

    fn read_stripe(&mut self, stripe: StripeInfo) -> Result<RecordBatch> {
        let body_len = stripe.index_length + stripe.data_length;
        let bytes = read_at(&mut self.file, stripe.offset, body_len + stripe.footer_length)
            .map_err(|_| {
                ConvertError::read(format!(
                    "ORC stripe at offset {} of {} is truncated",
                    stripe.offset,
                    self.path.display()
                ))
            })?;
        let footer = decompress(self.compression, &bytes[body_len as usize..], self.block_size)?;

        let mut streams = HashMap::new();
        let mut encodings = Vec::new();
        let mut at = 0usize;
        for field in fields(&footer) {
            let (number, value) = field?;
            match number {
                1 => {
                    let (mut stream_kind, mut column, mut length) = (0, 0, 0);
                    for field in fields(value.bytes()?) {
                        let (number, value) = field?;
                        match number {
                            1 => stream_kind = value.uint()?,
                            2 => column = value.uint()?,
                            3 => length = value.uint()? as usize,
                            _ => {}
                        }
                    }
                    streams.insert((column as u32, stream_kind), (at, length));
                    at += length;
                }
                2 => {
                    let mut column_encoding = encoding::DIRECT;
                    for field in fields(value.bytes()?) {
                        let (number, value) = field?;
                        if number == 1 {
                            column_encoding = value.uint()?;
                        }
                    }
                    encodings.push(column_encoding);
                }
                _ => {}
            }
        }

        let stripe_data = StripeData {
            bytes: &bytes[..body_len as usize],
            streams,
            encodings,
            compression: self.compression,
            block_size: self.block_size,
            rows: stripe.rows as usize,
        };
        let arrays = self
            .columns
            .iter()
            .map(|column| stripe_data.column(column))
            .collect::<Result<Vec<_>>>()?;
        let options = RecordBatchOptions::new().with_row_count(Some(stripe.rows as usize));
        Ok(RecordBatch::try_new_with_options(
            self.schema.clone(),
            arrays,
            &options,
        )?)
    }
}

fn read_at(file: &mut File, offset: u64, len: u64) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

struct OrcStripes {
    reader: OrcReader,
    next: usize,
    remaining: usize,
}

impl Iterator for OrcStripes {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining > 0 {
            let stripe = *self.reader.stripes.get(self.next)?;
            self.next += 1;
            if stripe.rows == 0 {
                continue;
            }
            let batch = match self.reader.read_stripe(stripe) {
                Ok(batch) => batch,
                Err(e) => {
                    self.remaining = 0;
                    return Some(Err(e));
                }
            };
            let batch = batch.slice(0, batch.num_rows().min(self.remaining));
            self.remaining -= batch.num_rows();
            return Some(Ok(batch));
        }
        None
    }
}

/// Raw streams of one stripe
struct StripeData<'a> {
    bytes: &'a [u8],
    streams: HashMap<(u32, u64), (usize, usize)>,
    encodings: Vec<u64>,
    compression: OrcCompression,
    block_size: usize,
    rows: usize,
}

impl StripeData<'_> {
    /// Decompressed stream, empty when the writer left it out
    fn stream(&self, column: u32, kind: u64) -> Result<Option<Vec<u8>>> {
        let Some(&(at, len)) = self.streams.get(&(column, kind)) else {
            return Ok(None);
        };
        let raw = self
            .bytes
            .get(at..at + len)
            .ok_or_else(|| malformed("stream outside its stripe"))?;
        decompress(self.compression, raw, self.block_size).map(Some)
    }

    fn data(&self, column: u32, kind: u64) -> Result<Vec<u8>> {
        Ok(self.stream(column, kind)?.unwrap_or_default())
    }

    fn ints(&self, column: u32, kind: u64, signed: bool) -> Result<Vec<i64>> {
        let rle = match self.encodings.get(column as usize) {
            Some(&encoding::DIRECT_V2) | Some(&encoding::DICTIONARY_V2) => IntRle::V2,
            _ => IntRle::V1,
        };
        decode_ints(&self.data(column, kind)?, signed, rle)
    }

    fn column(&self, column: &Column) -> Result<ArrayRef> {
        let id = column.id;
        let bits = match self.stream(id, stream::PRESENT)? {
            Some(data) => Some(decode_bools(&data, self.rows)?),
            None => None,
        };
        let present = bits.as_deref();
        let rows = self.rows;
        let values = present.map_or(rows, |bits| bits.iter().filter(|b| **b).count());

        let array: ArrayRef = match column.kind {
            kind::BOOLEAN => {
                let data = decode_bools(&self.data(id, stream::DATA)?, values)?;
                Arc::new(fill(present, rows, data)?.collect::<BooleanArray>())
            }
            kind::BYTE => {
                let data = decode_bytes(&self.data(id, stream::DATA)?)?;
                let data: Vec<i8> = data.into_iter().map(|b| b as i8).collect();
                Arc::new(fill(present, rows, data)?.collect::<Int8Array>())
            }
            kind::SHORT => {
                let data = self.ints(id, stream::DATA, true)?;
                let data: Vec<i16> = data.into_iter().map(|v| v as i16).collect();
                Arc::new(fill(present, rows, data)?.collect::<Int16Array>())
            }
            kind::INT => {
                let data = self.ints(id, stream::DATA, true)?;
                let data: Vec<i32> = data.into_iter().map(|v| v as i32).collect();
                Arc::new(fill(present, rows, data)?.collect::<Int32Array>())
            }
            kind::LONG => {
                let data = self.ints(id, stream::DATA, true)?;
                Arc::new(fill(present, rows, data)?.collect::<Int64Array>())
            }
            kind::DATE => {
                let data = self.ints(id, stream::DATA, true)?;
                let data: Vec<i32> = data.into_iter().map(|v| v as i32).collect();
                Arc::new(fill(present, rows, data)?.collect::<Date32Array>())
            }
            kind::FLOAT => {
                let data: Vec<f32> = self
                    .data(id, stream::DATA)?
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect();
                Arc::new(fill(present, rows, data)?.collect::<Float32Array>())
            }
            kind::DOUBLE => {
                let data: Vec<f64> = self
                    .data(id, stream::DATA)?
                    .chunks_exact(8)
                    .map(|b| {
                        let mut buf = [0u8; 8];
                        buf.copy_from_slice(b);
                        f64::from_le_bytes(buf)
                    })
                    .collect();
                Arc::new(fill(present, rows, data)?.collect::<Float64Array>())
            }
            kind::BINARY => {
                let data = self.byte_strings(id, values)?;
                Arc::new(fill(present, rows, data)?.collect::<BinaryArray>())
            }
            kind::STRING | kind::VARCHAR | kind::CHAR => {
                let data: Vec<String> = self
                    .byte_strings(id, values)?
                    .into_iter()
                    .map(|b| match String::from_utf8(b) {
                        Ok(text) => text,
                        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
                    })
                    .collect();
                Arc::new(fill(present, rows, data)?.collect::<StringArray>())
            }
            kind::TIMESTAMP | kind::TIMESTAMP_INSTANT => {
                let seconds = self.ints(id, stream::DATA, true)?;
                let nanos = self.ints(id, stream::SECONDARY, false)?;
                let data: Vec<i64> = seconds
                    .iter()
                    .zip(&nanos)
                    .map(|(s, n)| timestamp_micros(*s, *n as u64))
                    .collect();
                let array = fill(present, rows, data)?.collect::<TimestampMicrosecondArray>();
                match &column.data_type {
                    DataType::Timestamp(_, Some(tz)) => Arc::new(array.with_timezone(tz.clone())),
                    _ => Arc::new(array),
                }
            }
            kind::DECIMAL => {
                let DataType::Decimal128(precision, scale) = column.data_type else {
                    return Err(malformed("decimal column without precision"));
                };
                let mantissas = unbounded_ints(&self.data(id, stream::DATA)?, values)?;
                let scales = self.ints(id, stream::SECONDARY, true)?;
                let data: Vec<i128> = mantissas
                    .iter()
                    .zip(&scales)
                    .map(|(m, s)| rescale(*m, *s, i64::from(scale)))
                    .collect();
                let array = fill(present, rows, data)?.collect::<Decimal128Array>();
                Arc::new(array.with_precision_and_scale(precision, scale)?)
            }
            other => {
                return Err(ConvertError::read(format!("Unexpected ORC type kind {}", other)))
            }
        };
        Ok(array)
    }

    /// Values of a string or binary column, direct or dictionary encoded
    fn byte_strings(&self, id: u32, values: usize) -> Result<Vec<Vec<u8>>> {
        let lengths = self.ints(id, stream::LENGTH, false)?;
        let dictionary = matches!(
            self.encodings.get(id as usize),
            Some(&encoding::DICTIONARY) | Some(&encoding::DICTIONARY_V2)
        );
        if !dictionary {
            let blob = self.data(id, stream::DATA)?;
            let cells = split(&blob, lengths.get(..values).unwrap_or(&lengths))?;
            return Ok(cells.into_iter().map(<[u8]>::to_vec).collect());
        }

        let blob = self.data(id, stream::DICTIONARY_DATA)?;
        let entries = split(&blob, &lengths)?;
        self.ints(id, stream::DATA, false)?
            .iter()
            .take(values)
            .map(|index| {
                entries
                    .get(*index as usize)
                    .map(|entry| entry.to_vec())
                    .ok_or_else(|| malformed("dictionary index out of range"))
            })
            .collect()
    }
}

/// Cut `blob` into consecutive pieces of the given lengths
fn split<'a>(blob: &'a [u8], lengths: &[i64]) -> Result<Vec<&'a [u8]>> {
    let mut at = 0usize;
    lengths
        .iter()
        .map(|len| {
            let end = at + usize::try_from(*len).map_err(|_| malformed("negative length"))?;
            let piece = blob.get(at..end).ok_or_else(|| malformed("string data too short"))?;
            at = end;
            Ok(piece)
        })
        .collect()
}

/// Scatter non-null values over the rows marked present
fn fill<'p, T: 'p>(
    present: Option<&'p [bool]>,
    rows: usize,
    data: Vec<T>,
) -> Result<Box<dyn Iterator<Item = Option<T>> + 'p>> {
    let needed = present.map_or(rows, |bits| bits.iter().filter(|b| **b).count());
    if data.len() < needed {
        return Err(ConvertError::read(format!(
            "ORC column holds {} value(s) for {} present row(s)",
            data.len(),
            needed
        )));
    }
    let mut data = data.into_iter();
    Ok(match present {
        None => Box::new(data.take(rows).map(Some)),
        Some(bits) => Box::new(bits.iter().map(move |b| if *b { data.next() } else { None })),
    })
}

/// Seconds since the 2015 base plus encoded nanoseconds, as epoch microseconds
fn timestamp_micros(seconds: i64, encoded_nanos: u64) -> i64 {
    let zeros = encoded_nanos & 7;
    let mut nanos = (encoded_nanos >> 3) as i64;
    if zeros != 0 {
        nanos *= 10i64.pow(zeros as u32 + 1);
    }
    let mut seconds = seconds + TIMESTAMP_BASE;
    if seconds < 0 && nanos > 0 {
        seconds -= 1;
    }
    seconds * 1_000_000 + nanos / 1_000
}

/// Zigzag varints of up to 128 bits
fn unbounded_ints(data: &[u8], count: usize) -> Result<Vec<i128>> {
    let mut out = Vec::with_capacity(count);
    let mut pos = 0;
    while out.len() < count {
        let mut raw = 0u128;
        let mut shift = 0;
        loop {
            let byte = *data.get(pos).ok_or_else(|| malformed("truncated decimal"))?;
            pos += 1;
            if shift < 128 {
                raw |= u128::from(byte & 0x7f) << shift;
            }
            shift += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }
        out.push(((raw >> 1) as i128) ^ -((raw & 1) as i128));
    }
    Ok(out)
}

fn rescale(mantissa: i128, from: i64, to: i64) -> i128 {
    match to - from {
        0 => mantissa,
        up if up > 0 => mantissa.saturating_mul(10i128.saturating_pow(up as u32)),
        down => mantissa / 10i128.pow((-down).min(38) as u32),
    }
}

pub fn read_orc(path: &Path, options: &ReadOptions) -> Result<BatchStream> {
    let reader = OrcReader::open(path)?;
    Ok(reader.batches(options.row_limit).chunked(options.chunk_size))
}
