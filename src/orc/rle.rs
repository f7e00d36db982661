//! Run-length codecs of ORC column streams
//!
//! Streams are decoded whole, one stripe at a time. The writer emits byte
//! RLE, boolean RLE and integer RLE version 1; the reader also understands
//! integer RLE version 2 as written by current Java and C++ writers.

use super::proto::read_varint;
use crate::error::{ConvertError, Result};

fn corrupt(what: &str) -> ConvertError {
    ConvertError::read(format!("Malformed ORC stream: {}", what))
}

fn byte_at(data: &[u8], pos: usize) -> Result<u8> {
    data.get(pos).copied().ok_or_else(|| corrupt("run past end of stream"))
}

fn varint_at(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut rest = data.get(*pos..).ok_or_else(|| corrupt("run past end of stream"))?;
    let value = read_varint(&mut rest).map_err(|_| corrupt("truncated varint"))?;
    *pos = data.len() - rest.len();
    Ok(value)
}

pub(crate) fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub(crate) fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Integer RLE flavour, chosen by the column encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IntRle {
    V1,
    V2,
}

pub(crate) fn decode_bytes(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let header = data[pos];
        pos += 1;
        if header < 0x80 {
            let value = byte_at(data, pos)?;
            pos += 1;
            out.resize(out.len() + usize::from(header) + 3, value);
        } else {
            let count = 256 - usize::from(header);
            let literal = data
                .get(pos..pos + count)
                .ok_or_else(|| corrupt("byte literals past end of stream"))?;
            out.extend_from_slice(literal);
            pos += count;
        }
    }
    Ok(out)
}

/// First `count` bits, most significant bit of each byte first
pub(crate) fn decode_bools(data: &[u8], count: usize) -> Result<Vec<bool>> {
    let bytes = decode_bytes(data)?;
    if bytes.len() * 8 < count {
        return Err(corrupt("boolean stream shorter than its column"));
    }
    Ok((0..count)
        .map(|i| bytes[i / 8] & (0x80 >> (i % 8)) != 0)
        .collect())
}

pub(crate) fn decode_ints(data: &[u8], signed: bool, rle: IntRle) -> Result<Vec<i64>> {
    match rle {
        IntRle::V1 => decode_v1(data, signed),
        IntRle::V2 => decode_v2(data, signed),
    }
}

fn decode_v1(data: &[u8], signed: bool) -> Result<Vec<i64>> {
    let value = |raw: u64| if signed { unzigzag(raw) } else { raw as i64 };
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let header = data[pos];
        pos += 1;
        if header < 0x80 {
            let delta = i64::from(byte_at(data, pos)? as i8);
            pos += 1;
            let base = value(varint_at(data, &mut pos)?);
            for i in 0..i64::from(header) + 3 {
                out.push(base.wrapping_add(i.wrapping_mul(delta)));
            }
        } else {
            for _ in 0..256 - usize::from(header) {
                out.push(value(varint_at(data, &mut pos)?));
            }
        }
    }
    Ok(out)
}

/// Bit width of a five-bit encoded width code
fn decode_width(code: u8) -> u32 {
    match code {
        0..=23 => u32::from(code) + 1,
        24 => 26,
        25 => 28,
        26 => 30,
        27 => 32,
        28 => 40,
        29 => 48,
        30 => 56,
        _ => 64,
    }
}

fn closest_fixed_bits(bits: u32) -> u32 {
    match bits {
        0 => 1,
        1..=24 => bits,
        25..=26 => 26,
        27..=28 => 28,
        29..=30 => 30,
        31..=32 => 32,
        33..=40 => 40,
        41..=48 => 48,
        49..=56 => 56,
        _ => 64,
    }
}

/// Big-endian bit-packed values
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    bit: u32,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8], pos: usize) -> Self {
        BitReader { data, pos, bit: 0 }
    }

    fn read(&mut self, width: u32) -> Result<u64> {
        let mut value = 0u64;
        let mut left = width;
        while left > 0 {
            let byte = byte_at(self.data, self.pos)?;
            let available = 8 - self.bit;
            let take = available.min(left);
            let bits = (u64::from(byte) >> (available - take)) & ((1u64 << take) - 1);
            value = (value << take) | bits;
            left -= take;
            self.bit += take;
            if self.bit == 8 {
                self.bit = 0;
                self.pos += 1;
            }
        }
        Ok(value)
    }

    /// Byte position after the last partially read byte
    fn end(&self) -> usize {
        if self.bit > 0 {
            self.pos + 1
        } else {
            self.pos
        }
    }
}

fn big_endian(data: &[u8], pos: usize, width: usize) -> Result<u64> {
    let bytes = data
        .get(pos..pos + width)
        .ok_or_else(|| corrupt("run past end of stream"))?;
    Ok(bytes.iter().fold(0, |acc, b| (acc << 8) | u64::from(*b)))
}

fn decode_v2(data: &[u8], signed: bool) -> Result<Vec<i64>> {
    let value = |raw: u64| if signed { unzigzag(raw) } else { raw as i64 };
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let first = data[pos];
        let run_length = || -> Result<usize> {
            Ok(((usize::from(first & 1) << 8) | usize::from(byte_at(data, pos + 1)?)) + 1)
        };
        match first >> 6 {
            // short repeat
            0 => {
                let width = usize::from((first >> 3) & 7) + 1;
                let count = usize::from(first & 7) + 3;
                let repeated = value(big_endian(data, pos + 1, width)?);
                out.resize(out.len() + count, repeated);
                pos += 1 + width;
            }
            // direct
            1 => {
                let width = decode_width((first >> 1) & 0x1f);
                let count = run_length()?;
                let mut bits = BitReader::new(data, pos + 2);
                for _ in 0..count {
                    out.push(value(bits.read(width)?));
                }
                pos = bits.end();
            }
            // patched base
            2 => {
                let width = decode_width((first >> 1) & 0x1f);
                let count = run_length()?;
                let third = byte_at(data, pos + 2)?;
                let fourth = byte_at(data, pos + 3)?;
                let base_width = usize::from((third >> 5) & 7) + 1;
                let patch_width = decode_width(third & 0x1f);
                let gap_width = u32::from((fourth >> 5) & 7) + 1;
                let patch_count = usize::from(fourth & 0x1f);
                pos += 4;

                let raw_base = big_endian(data, pos, base_width)?;
                let sign = 1u64 << (base_width * 8 - 1);
                let base = if raw_base & sign != 0 {
                    -((raw_base & !sign) as i64)
                } else {
                    raw_base as i64
                };
                pos += base_width;

                let mut bits = BitReader::new(data, pos);
                let mut values = (0..count)
                    .map(|_| bits.read(width))
                    .collect::<Result<Vec<u64>>>()?;
                pos = bits.end();

                let entry_width = closest_fixed_bits(gap_width + patch_width);
                let patch_mask = if patch_width >= 64 {
                    u64::MAX
                } else {
                    (1u64 << patch_width) - 1
                };
                let mut bits = BitReader::new(data, pos);
                let mut index = 0usize;
                for _ in 0..patch_count {
                    let entry = bits.read(entry_width)?;
                    let gap = (entry >> patch_width) as usize;
                    let patch = entry & patch_mask;
                    index += gap;
                    if gap == 255 && patch == 0 {
                        continue;
                    }
                    let slot = values
                        .get_mut(index)
                        .ok_or_else(|| corrupt("patch past end of run"))?;
                    *slot |= patch.checked_shl(width).unwrap_or(0);
                }
                pos = bits.end();
                out.extend(values.into_iter().map(|v| base.wrapping_add(v as i64)));
            }
            // delta
            _ => {
                let code = (first >> 1) & 0x1f;
                let width = if code == 0 { 0 } else { decode_width(code) };
                let count = run_length()?;
                pos += 2;
                let base = value(varint_at(data, &mut pos)?);
                let delta = unzigzag(varint_at(data, &mut pos)?);
                out.push(base);
                let mut previous = base;
                if count > 1 {
                    previous = previous.wrapping_add(delta);
                    out.push(previous);
                }
                let mut bits = BitReader::new(data, pos);
                for _ in 2..count {
                    let step = if width == 0 {
                        delta
                    } else if delta < 0 {
                        -(bits.read(width)? as i64)
                    } else {
                        bits.read(width)? as i64
                    };
                    previous = previous.wrapping_add(step);
                    out.push(previous);
                }
                pos = bits.end();
            }
        }
    }
    Ok(out)
}

fn flush_bytes(out: &mut Vec<u8>, literal: &[u8]) {
    for chunk in literal.chunks(128) {
        out.push((256 - chunk.len()) as u8);
        out.extend_from_slice(chunk);
    }
}

pub(crate) fn encode_bytes(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < data.len() {
        let mut run = 1;
        while i + run < data.len() && data[i + run] == data[i] && run < 130 {
            run += 1;
        }
        if run >= 3 {
            flush_bytes(&mut out, &data[start..i]);
            out.push((run - 3) as u8);
            out.push(data[i]);
            i += run;
            start = i;
        } else {
            i += 1;
        }
    }
    flush_bytes(&mut out, &data[start..]);
    out
}

pub(crate) fn encode_bools(values: &[bool]) -> Vec<u8> {
    let bytes: Vec<u8> = values
        .chunks(8)
        .map(|bits| {
            bits.iter()
                .enumerate()
                .fold(0u8, |acc, (i, b)| if *b { acc | (0x80 >> i) } else { acc })
        })
        .collect();
    encode_bytes(&bytes)
}

/// Integer RLE version 1: runs with a constant small delta, literals otherwise
pub(crate) fn encode_ints(values: &[i64], signed: bool) -> Vec<u8> {
    let raw = |v: i64| if signed { zigzag(v) } else { v as u64 };
    let flush = |out: &mut Vec<u8>, literal: &[i64]| {
        for chunk in literal.chunks(128) {
            out.push((256 - chunk.len()) as u8);
            for v in chunk {
                super::proto::write_varint(out, raw(*v));
            }
        }
    };
    let step = |i: usize| values[i + 1].checked_sub(values[i]);

    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < values.len() {
        let delta = if i + 2 < values.len() { step(i) } else { None };
        match delta {
            Some(delta) if (-128..=127).contains(&delta) && step(i + 1) == Some(delta) => {
                let mut run = 3;
                while i + run < values.len() && run < 130 && step(i + run - 1) == Some(delta) {
                    run += 1;
                }
                flush(&mut out, &values[start..i]);
                out.push((run - 3) as u8);
                out.push(delta as i8 as u8);
                super::proto::write_varint(&mut out, raw(values[i]));
                i += run;
                start = i;
            }
            _ => i += 1,
        }
    }
    flush(&mut out, &values[start..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_runs() -> Result<()> {
        assert_eq!(decode_bytes(&[0x61, 0x00])?, vec![0u8; 100]);
        assert_eq!(decode_bytes(&[0xfe, 0x44, 0x45])?, vec![0x44, 0x45]);
        assert!(decode_bytes(&[0xfd, 0x01]).is_err());

        let mut data = vec![7u8; 200];
        data.extend(0..=255u8);
        assert_eq!(decode_bytes(&encode_bytes(&data))?, data);
        Ok(())
    }

    #[test]
    fn test_booleans() -> Result<()> {
        let mut expected = vec![true];
        expected.extend([false; 7]);
        assert_eq!(decode_bools(&[0xff, 0x80], 8)?, expected);

        let values: Vec<bool> = (0..21).map(|i| i % 3 == 0).collect();
        assert_eq!(decode_bools(&encode_bools(&values), 21)?, values);
        assert!(decode_bools(&[0xff, 0x80], 9).is_err());
        Ok(())
    }

    #[test]
    fn test_integer_v1() -> Result<()> {
        assert_eq!(decode_ints(&[0x61, 0x00, 0x07], false, IntRle::V1)?, vec![7; 100]);
        let down: Vec<i64> = (1..=100).rev().collect();
        assert_eq!(decode_ints(&[0x61, 0xff, 0x64], false, IntRle::V1)?, down);
        assert_eq!(
            decode_ints(&[0xfb, 0x02, 0x03, 0x06, 0x07, 0x0b], false, IntRle::V1)?,
            vec![2, 3, 6, 7, 11]
        );

        let values = vec![-5, 1, 2, 3, 4, 1 << 40, i64::MIN, i64::MAX, 0, 0, 0, -300];
        assert_eq!(decode_ints(&encode_ints(&values, true), true, IntRle::V1)?, values);
        Ok(())
    }

    #[test]
    fn test_integer_v2() -> Result<()> {
        assert_eq!(decode_ints(&[0x0a, 0x27, 0x10], false, IntRle::V2)?, vec![10_000; 5]);
        assert_eq!(
            decode_ints(
                &[0x5e, 0x03, 0x5c, 0xa1, 0xab, 0x1e, 0xde, 0xad, 0xbe, 0xef],
                false,
                IntRle::V2
            )?,
            vec![23713, 43806, 57005, 48879]
        );
        assert_eq!(
            decode_ints(
                &[0xc6, 0x09, 0x02, 0x02, 0x22, 0x42, 0x42, 0x46],
                false,
                IntRle::V2
            )?,
            vec![2, 3, 5, 7, 11, 13, 17, 19, 23, 29]
        );

        let patched = [
            0x8e, 0x13, 0x2b, 0x21, 0x07, 0xd0, 0x1e, 0x00, 0x14, 0x70, 0x28, 0x32, 0x3c, 0x46,
            0x50, 0x5a, 0x64, 0x6e, 0x78, 0x82, 0x8c, 0x96, 0xa0, 0xaa, 0xb4, 0xbe, 0xfc, 0xe8,
        ];
        let mut expected = vec![2030, 2000, 2020, 1_000_000];
        expected.extend((2040..=2190).step_by(10));
        assert_eq!(decode_ints(&patched, false, IntRle::V2)?, expected);
        Ok(())
    }

    #[test]
    fn test_signed_short_repeat() -> Result<()> {
        // zigzag(-3) = 5, one byte wide, repeated 3 times
        assert_eq!(decode_ints(&[0x00, 0x05], true, IntRle::V2)?, vec![-3; 3]);
        Ok(())
    }
}
