//! ORC file writer, one stripe per chunk
//!
//! Columns are written with direct encodings and version 1 integer RLE.
//! Types ORC has no primitive for (times, durations, nested values) are
//! written as strings in their display form.

use super::proto::MessageWriter;
use super::reader::StripeInfo;
use super::rle::{encode_bools, encode_bytes, encode_ints};
use super::{encoding, kind, stream, Compressor, OrcCompression, MAGIC, STRIPE_ROWS};
use super::TIMESTAMP_BASE;
use crate::codec::TableSink;
use crate::error::{ConvertError, Result};
use crate::format::{Compression, CompressionSpec};
use crate::request::WriteOptions;
use arrow::array::{Array, ArrayRef, AsArray};
use arrow::compute::cast;
use arrow::datatypes::{
    DataType, Decimal128Type, Float32Type, Float64Type, Int32Type, Int64Type, Int8Type, SchemaRef,
    TimeUnit,
};
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// ORC type kind for an Arrow column
fn orc_kind(data_type: &DataType) -> u64 {
    match data_type {
        DataType::Boolean => kind::BOOLEAN,
        DataType::Int8 => kind::BYTE,
        DataType::Int16 | DataType::UInt8 => kind::SHORT,
        DataType::Int32 | DataType::UInt16 => kind::INT,
        DataType::Int64 | DataType::UInt32 | DataType::UInt64 => kind::LONG,
        DataType::Float16 | DataType::Float32 => kind::FLOAT,
        DataType::Float64 => kind::DOUBLE,
        DataType::Binary
        | DataType::LargeBinary
        | DataType::BinaryView
        | DataType::FixedSizeBinary(_) => kind::BINARY,
        DataType::Date32 | DataType::Date64 => kind::DATE,
        DataType::Timestamp(_, None) => kind::TIMESTAMP,
        DataType::Timestamp(_, Some(_)) => kind::TIMESTAMP_INSTANT,
        DataType::Decimal128(_, scale) if *scale >= 0 => kind::DECIMAL,
        _ => kind::STRING,
    }
}

/// Encoded streams of one column in one stripe
struct ColumnStreams {
    streams: Vec<(u64, Vec<u8>)>,
    values: u64,
}

fn encode_column(array: &ArrayRef) -> Result<ColumnStreams> {
    let mut streams = Vec::new();
    if array.null_count() > 0 {
        let present: Vec<bool> = (0..array.len()).map(|i| array.is_valid(i)).collect();
        streams.push((stream::PRESENT, encode_bools(&present)));
    }
    let valid = |i: &usize| array.is_valid(*i);

    match orc_kind(array.data_type()) {
        kind::BOOLEAN => {
            let values = array.as_boolean();
            let bits: Vec<bool> = (0..array.len()).filter(valid).map(|i| values.value(i)).collect();
            streams.push((stream::DATA, encode_bools(&bits)));
        }
        kind::BYTE => {
            let values = array.as_primitive::<Int8Type>();
            let bytes: Vec<u8> = values.iter().flatten().map(|v| v as u8).collect();
            streams.push((stream::DATA, encode_bytes(&bytes)));
        }
        kind::SHORT | kind::INT | kind::LONG => {
            let ints = cast(array, &DataType::Int64)?;
            let values: Vec<i64> = ints.as_primitive::<Int64Type>().iter().flatten().collect();
            streams.push((stream::DATA, encode_ints(&values, true)));
        }
        kind::FLOAT => {
            let floats = cast(array, &DataType::Float32)?;
            let mut data = Vec::new();
            for v in floats.as_primitive::<Float32Type>().iter().flatten() {
                data.extend_from_slice(&v.to_le_bytes());
            }
            streams.push((stream::DATA, data));
        }
        kind::DOUBLE => {
            let mut data = Vec::new();
            for v in array.as_primitive::<Float64Type>().iter().flatten() {
                data.extend_from_slice(&v.to_le_bytes());
            }
            streams.push((stream::DATA, data));
        }
        kind::DATE => {
            let days = cast(&cast(array, &DataType::Date32)?, &DataType::Int32)?;
            let values: Vec<i64> = days
                .as_primitive::<Int32Type>()
                .iter()
                .flatten()
                .map(i64::from)
                .collect();
            streams.push((stream::DATA, encode_ints(&values, true)));
        }
        kind::TIMESTAMP | kind::TIMESTAMP_INSTANT => {
            let DataType::Timestamp(unit, _) = array.data_type() else {
                return Err(ConvertError::Write("timestamp column without unit".to_string()));
            };
            let per_second: i64 = match unit {
                TimeUnit::Second => 1,
                TimeUnit::Millisecond => 1_000,
                TimeUnit::Microsecond => 1_000_000,
                TimeUnit::Nanosecond => 1_000_000_000,
            };
            let raw = cast(array, &DataType::Int64)?;
            let (seconds, nanos): (Vec<i64>, Vec<i64>) = raw
                .as_primitive::<Int64Type>()
                .iter()
                .flatten()
                .map(|v| {
                    let nanos = v.rem_euclid(per_second) * (1_000_000_000 / per_second);
                    (orc_seconds(v.div_euclid(per_second), nanos), encode_nanos(nanos))
                })
                .unzip();
            streams.push((stream::DATA, encode_ints(&seconds, true)));
            streams.push((stream::SECONDARY, encode_ints(&nanos, false)));
        }
        kind::DECIMAL => {
            let DataType::Decimal128(_, scale) = array.data_type() else {
                return Err(ConvertError::Write("decimal column without scale".to_string()));
            };
            let mut data = Vec::new();
            let mut scales = Vec::new();
            for v in array.as_primitive::<Decimal128Type>().iter().flatten() {
                let mut raw = ((v << 1) ^ (v >> 127)) as u128;
                while raw >= 0x80 {
                    data.push((raw as u8) | 0x80);
                    raw >>= 7;
                }
                data.push(raw as u8);
                scales.push(i64::from(*scale));
            }
            streams.push((stream::DATA, data));
            streams.push((stream::SECONDARY, encode_ints(&scales, true)));
        }
        kind::BINARY => {
            let bytes = cast(array, &DataType::Binary)?;
            let (data, lengths) = concat(bytes.as_binary::<i32>().iter().flatten());
            streams.push((stream::DATA, data));
            streams.push((stream::LENGTH, encode_ints(&lengths, false)));
        }
        _ => {
            let (data, lengths) = match array.data_type() {
                DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => {
                    let text = cast(array, &DataType::Utf8)?;
                    concat(text.as_string::<i32>().iter().flatten().map(str::as_bytes))
                }
                _ => {
                    let options = FormatOptions::default();
                    let formatter = ArrayFormatter::try_new(array.as_ref(), &options)?;
                    let text: Vec<String> = (0..array.len())
                        .filter(valid)
                        .map(|i| formatter.value(i).to_string())
                        .collect();
                    concat(text.iter().map(String::as_bytes))
                }
            };
            streams.push((stream::DATA, data));
            streams.push((stream::LENGTH, encode_ints(&lengths, false)));
        }
    }

    Ok(ColumnStreams {
        streams,
        values: (array.len() - array.null_count()) as u64,
    })
}

fn concat<'a>(values: impl Iterator<Item = &'a [u8]>) -> (Vec<u8>, Vec<i64>) {
    let mut data = Vec::new();
    let mut lengths = Vec::new();
    for v in values {
        data.extend_from_slice(v);
        lengths.push(v.len() as i64);
    }
    (data, lengths)
}

/// Seconds relative to the 2015 base, rounded toward zero the way readers expect
fn orc_seconds(epoch_seconds: i64, nanos: i64) -> i64 {
    let truncated = if epoch_seconds < 0 && nanos > 0 {
        epoch_seconds + 1
    } else {
        epoch_seconds
    };
    truncated - TIMESTAMP_BASE
}

/// Nanoseconds with trailing decimal zeros folded into the low three bits
fn encode_nanos(nanos: i64) -> i64 {
    if nanos == 0 {
        return 0;
    }
    let mut value = nanos;
    let mut zeros = 0;
    while value % 10 == 0 && zeros < 8 {
        value /= 10;
        zeros += 1;
    }
    if zeros >= 2 {
        (value << 3) | (zeros - 1)
    } else {
        nanos << 3
    }
}

/// ORC output, one stripe per chunk
pub struct OrcSink {
    writer: BufWriter<File>,
    schema: SchemaRef,
    compressor: Compressor,
    offset: u64,
    stripes: Vec<StripeInfo>,
    rows: u64,
    /// Non-null values and null presence per column
    stats: Vec<(u64, bool)>,
}

impl OrcSink {
    pub fn create<P: AsRef<Path>>(
        path: P,
        schema: SchemaRef,
        spec: &CompressionSpec,
    ) -> Result<Self> {
        let compressor = match spec.kind {
            None | Some(Compression::None) => Compressor {
                kind: OrcCompression::None,
                level: 0,
            },
            Some(Compression::Gzip) => Compressor {
                kind: OrcCompression::Zlib,
                level: spec.level_in(0..=9, 6)?,
            },
            Some(Compression::Zstd) => Compressor {
                kind: OrcCompression::Zstd,
                level: spec.level_in(1..=21, 3)?,
            },
            Some(Compression::Snappy) => Compressor {
                kind: OrcCompression::Snappy,
                level: 0,
            },
            Some(Compression::Lz4) => Compressor {
                kind: OrcCompression::Lz4,
                level: 0,
            },
        };

        let path = path.as_ref();
        let file = File::create(path)
            .map_err(|e| {
                ConvertError::Write(format!("Failed to create {}: {}", path.display(), e))
            })?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        log::debug!(
            "Writing ORC {} with {:?} compression",
            path.display(),
            compressor.kind
        );

        Ok(OrcSink {
            writer,
            stats: vec![(0, false); schema.fields().len()],
            schema,
            compressor,
            offset: MAGIC.len() as u64,
            stripes: Vec::new(),
            rows: 0,
        })
    }

    /// Append `batch` as one or more stripes
    pub fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        if batch.schema().fields().len() != self.schema.fields().len() {
            return Err(ConvertError::SchemaMismatch(format!(
                "batch has {} column(s), ORC output has {}",
                batch.num_columns(),
                self.schema.fields().len()
            )));
        }
        let mut start = 0;
        while start < batch.num_rows() {
            let len = STRIPE_ROWS.min(batch.num_rows() - start);
            self.write_stripe(&batch.slice(start, len))?;
            start += len;
        }
        Ok(())
    }

    fn write_stripe(&mut self, batch: &RecordBatch) -> Result<()> {
        let mut data = Vec::new();
        let mut stream_infos = MessageWriter::new();
        for (i, array) in batch.columns().iter().enumerate() {
            let column = encode_column(array)?;
            let stats = &mut self.stats[i];
            stats.0 += column.values;
            stats.1 |= array.null_count() > 0;
            for (stream_kind, raw) in column.streams {
                let packed = self.compressor.compress(&raw)?;
                let mut info = MessageWriter::new();
                info.uint(1, stream_kind)
                    .uint(2, i as u64 + 1)
                    .uint(3, packed.len() as u64);
                stream_infos.message(1, &info);
                data.extend(packed);
            }
        }

        let mut direct = MessageWriter::new();
        direct.uint(1, encoding::DIRECT);
        for _ in 0..=batch.num_columns() {
            stream_infos.message(2, &direct);
        }
        stream_infos.bytes(3, b"UTC");
        let footer = self.compressor.compress(&stream_infos.finish())?;

        self.writer.write_all(&data)?;
        self.writer.write_all(&footer)?;
        let stripe = StripeInfo {
            offset: self.offset,
            index_length: 0,
            data_length: data.len() as u64,
            footer_length: footer.len() as u64,
            rows: batch.num_rows() as u64,
        };
        self.offset += stripe.data_length + stripe.footer_length;
        self.rows += stripe.rows;
        self.stripes.push(stripe);
        Ok(())
    }

    /// Write the file tail and close the file
    pub fn close(mut self) -> Result<()> {
        let mut footer = MessageWriter::new();
        footer
            .uint(1, MAGIC.len() as u64)
            .uint(2, self.offset - MAGIC.len() as u64);
        for stripe in &self.stripes {
            let mut info = MessageWriter::new();
            info.uint(1, stripe.offset)
                .uint(2, stripe.index_length)
                .uint(3, stripe.data_length)
                .uint(4, stripe.footer_length)
                .uint(5, stripe.rows);
            footer.message(3, &info);
        }

        let fields = self.schema.fields();
        let mut root = MessageWriter::new();
        root.uint(1, kind::STRUCT)
            .packed(2, &(1..=fields.len() as u64).collect::<Vec<_>>());
        for field in fields {
            root.bytes(3, field.name().as_bytes());
        }
        footer.message(4, &root);
        for field in fields {
            let mut ty = MessageWriter::new();
            ty.uint(1, orc_kind(field.data_type()));
            if let DataType::Decimal128(precision, scale) = field.data_type() {
                if *scale >= 0 {
                    ty.uint(5, u64::from(*precision)).uint(6, *scale as u64);
                }
            }
            footer.message(4, &ty);
        }
        footer.uint(6, self.rows);

        let mut root_stats = MessageWriter::new();
        root_stats.uint(1, self.rows).uint(10, 0);
        footer.message(7, &root_stats);
        for (values, has_null) in &self.stats {
            let mut stats = MessageWriter::new();
            stats.uint(1, *values).uint(10, u64::from(*has_null));
            footer.message(7, &stats);
        }
        footer.uint(8, 0);
        let footer = self.compressor.compress(&footer.finish())?;

        let mut postscript = MessageWriter::new();
        postscript
            .uint(1, footer.len() as u64)
            .uint(2, self.compressor.kind.code());
        if self.compressor.kind != OrcCompression::None {
            postscript.uint(3, super::BLOCK_SIZE as u64);
        }
        postscript
            .packed(4, &[0, 12])
            .uint(5, 0)
            .uint(6, 1)
            .bytes(8000, MAGIC);
        let postscript = postscript.finish();

        self.writer.write_all(&footer)?;
        self.writer.write_all(&postscript)?;
        self.writer.write_all(&[postscript.len() as u8])?;
        self.writer.flush()?;
        log::debug!(
            "ORC output closed: {} row(s) in {} stripe(s)",
            self.rows,
            self.stripes.len()
        );
        Ok(())
    }
}

impl TableSink for OrcSink {
    fn write_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        self.write(batch)
    }

    fn finish(self: Box<Self>) -> Result<()> {
        self.close()
    }
}

pub fn open_orc(
    path: &Path,
    schema: SchemaRef,
    options: &WriteOptions,
) -> Result<Box<dyn TableSink>> {
    Ok(Box::new(OrcSink::create(path, schema, &options.compression)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orc::{read_orc, OrcReader};
    use crate::request::ReadOptions;
    use arrow::array::{
        BinaryArray, BooleanArray, Date32Array, Decimal128Array, Float64Array, Int16Array,
        Int64Array, StringArray, Time32SecondArray, TimestampMillisecondArray, UInt8Array,
    };
    use arrow::datatypes::{Date32Type, Int16Type, TimestampMicrosecondType};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn sample() -> RecordBatch {
        let name = StringArray::from(vec![Some("ann"), None, Some(""), Some("dée")]);
        let score = Float64Array::from(vec![Some(1.5), Some(-0.25), None, Some(1e10)]);
        let ok = BooleanArray::from(vec![Some(true), Some(false), None, Some(true)]);
        let day = Date32Array::from(vec![Some(0), Some(19_000), Some(-1), None]);
        RecordBatch::try_from_iter([
            ("id", Arc::new(Int64Array::from(vec![1, -2, 300, 4])) as ArrayRef),
            ("name", Arc::new(name) as ArrayRef),
            ("score", Arc::new(score) as ArrayRef),
            ("ok", Arc::new(ok) as ArrayRef),
            ("day", Arc::new(day) as ArrayRef),
        ])
        .unwrap()
    }

    fn write(path: &Path, batches: &[RecordBatch], spec: &CompressionSpec) -> Result<()> {
        let mut sink = OrcSink::create(path, batches[0].schema(), spec)?;
        for batch in batches {
            sink.write(batch)?;
        }
        sink.close()
    }

    #[test]
    fn test_roundtrip_every_compression() -> Result<()> {
        let dir = tempdir()?;
        let batch = sample();
        for kind in [
            None,
            Some(Compression::Gzip),
            Some(Compression::Zstd),
            Some(Compression::Snappy),
            Some(Compression::Lz4),
        ] {
            let path = dir.path().join("t.orc");
            write(&path, &[batch.clone()], &CompressionSpec::new(kind, None))?;

            let back = read_orc(&path, &ReadOptions::default())?.collect_batch()?;
            assert_eq!(back.schema(), batch.schema());
            assert_eq!(back, batch);
        }
        Ok(())
    }

    #[test]
    fn test_each_chunk_is_a_stripe() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("chunks.orc");
        let batch = sample();
        write(&path, &[batch.slice(0, 3), batch.slice(3, 1)], &CompressionSpec::default())?;

        let reader = OrcReader::open(&path)?;
        assert_eq!(reader.row_count(), 4);
        assert_eq!(reader.stripe_count(), 2);

        let options = ReadOptions {
            chunk_size: Some(2),
            ..ReadOptions::default()
        };
        let sizes: Vec<usize> = read_orc(&path, &options)?
            .map(|b| b.map(|b| b.num_rows()))
            .collect::<Result<_>>()?;
        assert_eq!(sizes, vec![2, 1, 1]);

        let limited = ReadOptions {
            row_limit: Some(3),
            ..ReadOptions::default()
        };
        assert_eq!(read_orc(&path, &limited)?.collect_batch()?, batch.slice(0, 3));
        Ok(())
    }

    #[test]
    fn test_timestamps_keep_sub_second_values() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("ts.orc");
        let millis = vec![Some(1_700_000_000_123), Some(-1_500), None, Some(0)];
        let batch = RecordBatch::try_from_iter([(
            "at",
            Arc::new(TimestampMillisecondArray::from(millis)) as ArrayRef,
        )])?;
        write(&path, &[batch], &CompressionSpec::default())?;

        let back = read_orc(&path, &ReadOptions::default())?.collect_batch()?;
        let at = back.column(0).as_primitive::<TimestampMicrosecondType>();
        assert_eq!(at.value(0), 1_700_000_000_123_000);
        assert_eq!(at.value(1), -1_500_000);
        assert!(at.is_null(2));
        assert_eq!(at.value(3), 0);
        Ok(())
    }

    #[test]
    fn test_other_types_are_widened() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("wide.orc");
        let decimals = Decimal128Array::from(vec![Some(12_345), None, Some(-5)])
            .with_precision_and_scale(10, 2)?;
        let batch = RecordBatch::try_from_iter([
            ("small", Arc::new(UInt8Array::from(vec![1, 2, 255])) as ArrayRef),
            ("price", Arc::new(decimals.clone()) as ArrayRef),
            ("at", Arc::new(Time32SecondArray::from(vec![0, 61, 3600])) as ArrayRef),
            (
                "raw",
                Arc::new(BinaryArray::from(vec![Some(&b"\x00\xff"[..]), None, Some(&b""[..])]))
                    as ArrayRef,
            ),
        ])?;
        write(&path, &[batch], &CompressionSpec::default())?;

        let back = read_orc(&path, &ReadOptions::default())?.collect_batch()?;
        let small = back.column(0).as_primitive::<Int16Type>();
        assert_eq!(small, &Int16Array::from(vec![1, 2, 255]));
        assert_eq!(back.column(1).as_primitive::<Decimal128Type>(), &decimals);
        let at = back.column(2).as_string::<i32>();
        assert_eq!(at.value(1), "00:01:01");
        let raw = back.column(3).as_binary::<i32>();
        assert_eq!(raw.value(0), b"\x00\xff");
        assert!(raw.is_null(1));
        Ok(())
    }

    #[test]
    fn test_empty_output_keeps_schema() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("empty.orc");
        let batch = sample();
        OrcSink::create(&path, batch.schema(), &CompressionSpec::default())?.close()?;

        let stream = read_orc(&path, &ReadOptions::default())?;
        assert_eq!(stream.schema(), batch.schema());
        assert_eq!(stream.collect_batch()?.num_rows(), 0);
        Ok(())
    }

    #[test]
    fn test_encode_nanos() {
        assert_eq!(encode_nanos(0), 0);
        assert_eq!(encode_nanos(1_000), (1 << 3) | 2);
        assert_eq!(encode_nanos(123_000_000), (123 << 3) | 5);
        assert_eq!(encode_nanos(7), 7 << 3);
        assert_eq!(encode_nanos(10), 10 << 3);
    }

    #[test]
    fn test_zstd_days_and_level_check() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("days.orc");
        write(&path, &[sample()], &CompressionSpec::new(Some(Compression::Zstd), Some(19)))?;
        let back = read_orc(&path, &ReadOptions::default())?.collect_batch()?;
        let days = back.column(4).as_primitive::<Date32Type>();
        assert_eq!(days.value(1), 19_000);
        assert_eq!(days.value(2), -1);
        assert!(days.is_null(3));

        let too_high = CompressionSpec::new(Some(Compression::Gzip), Some(12));
        assert!(matches!(
            OrcSink::create(&path, sample().schema(), &too_high),
            Err(ConvertError::InvalidArgument(_))
        ));
        Ok(())
    }
}
