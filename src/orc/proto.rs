//! Protocol buffer wire format for ORC metadata
//!
//! Only the subset ORC tails use: varints, length-delimited fields and the
//! two fixed-width wire types (skipped on read). Messages are decoded field
//! by field into the small structs in [`super::reader`] and
//! encoded with [`MessageWriter`].

use crate::error::{ConvertError, Result};

pub(crate) fn malformed(what: &str) -> ConvertError {
    ConvertError::read(format!("Malformed ORC metadata: {}", what))
}

/// One decoded field value
#[derive(Debug, Clone, Copy)]
pub(crate) enum Value<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
    Fixed,
}

impl<'a> Value<'a> {
    pub(crate) fn uint(self) -> Result<u64> {
        match self {
            Value::Varint(v) => Ok(v),
            _ => Err(malformed("expected an integer field")),
        }
    }

    pub(crate) fn bytes(self) -> Result<&'a [u8]> {
        match self {
            Value::Bytes(b) => Ok(b),
            _ => Err(malformed("expected a length-delimited field")),
        }
    }

    pub(crate) fn string(self) -> Result<String> {
        Ok(String::from_utf8_lossy(self.bytes()?).into_owned())
    }

    /// Repeated integers, packed or one per field occurrence
    pub(crate) fn uints(self, out: &mut Vec<u64>) -> Result<()> {
        match self {
            Value::Varint(v) => out.push(v),
            Value::Bytes(mut data) => {
                while !data.is_empty() {
                    out.push(read_varint(&mut data)?);
                }
            }
            Value::Fixed => return Err(malformed("expected integers")),
        }
        Ok(())
    }
}

pub(crate) fn read_varint(data: &mut &[u8]) -> Result<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let (&byte, rest) = data.split_first().ok_or_else(|| malformed("truncated varint"))?;
        *data = rest;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(malformed("varint longer than ten bytes"))
}

/// Iterate over `(field number, value)` pairs of one message
pub(crate) struct Fields<'a> {
    data: &'a [u8],
}

pub(crate) fn fields(data: &[u8]) -> Fields<'_> {
    Fields { data }
}

impl<'a> Fields<'a> {
    fn field(&mut self) -> Result<(u32, Value<'a>)> {
        let key = read_varint(&mut self.data)?;
        let number = (key >> 3) as u32;
        let value = match key & 7 {
            0 => Value::Varint(read_varint(&mut self.data)?),
            1 | 5 => {
                let width = if key & 7 == 1 { 8 } else { 4 };
                if self.data.len() < width {
                    return Err(malformed("truncated fixed field"));
                }
                self.data = &self.data[width..];
                Value::Fixed
            }
            2 => {
                let len = read_varint(&mut self.data)? as usize;
                if self.data.len() < len {
                    return Err(malformed("truncated length-delimited field"));
                }
                let (bytes, rest) = self.data.split_at(len);
                self.data = rest;
                Value::Bytes(bytes)
            }
            other => return Err(malformed(&format!("unsupported wire type {}", other))),
        };
        Ok((number, value))
    }
}

impl<'a> Iterator for Fields<'a> {
    type Item = Result<(u32, Value<'a>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        let field = self.field();
        if field.is_err() {
            self.data = &[];
        }
        Some(field)
    }
}

pub(crate) fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Encoder for one message, fields appended in call order
#[derive(Debug, Default)]
pub(crate) struct MessageWriter {
    buf: Vec<u8>,
}

impl MessageWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn uint(&mut self, field: u32, value: u64) -> &mut Self {
        write_varint(&mut self.buf, u64::from(field) << 3);
        write_varint(&mut self.buf, value);
        self
    }

    pub(crate) fn bytes(&mut self, field: u32, value: &[u8]) -> &mut Self {
        write_varint(&mut self.buf, (u64::from(field) << 3) | 2);
        write_varint(&mut self.buf, value.len() as u64);
        self.buf.extend_from_slice(value);
        self
    }

    pub(crate) fn message(&mut self, field: u32, value: &MessageWriter) -> &mut Self {
        self.bytes(field, &value.buf)
    }

    pub(crate) fn packed(&mut self, field: u32, values: &[u64]) -> &mut Self {
        let mut packed = Vec::new();
        for v in values {
            write_varint(&mut packed, *v);
        }
        self.bytes(field, &packed)
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_fields() -> Result<()> {
        let mut inner = MessageWriter::new();
        inner.uint(1, 7);
        let mut msg = MessageWriter::new();
        msg.uint(1, 300)
            .bytes(3, b"utc")
            .packed(4, &[0, 12])
            .message(5, &inner)
            .uint(8000, 1);
        let buf = msg.finish();

        let mut seen = Vec::new();
        for field in fields(&buf) {
            let (number, value) = field?;
            match number {
                1 => assert_eq!(value.uint()?, 300),
                3 => assert_eq!(value.string()?, "utc"),
                4 => {
                    let mut versions = Vec::new();
                    value.uints(&mut versions)?;
                    assert_eq!(versions, vec![0, 12]);
                }
                5 => {
                    let (n, v) = fields(value.bytes()?).next().unwrap()?;
                    assert_eq!((n, v.uint()?), (1, 7));
                }
                _ => {}
            }
            seen.push(number);
        }
        assert_eq!(seen, vec![1, 3, 4, 5, 8000]);
        Ok(())
    }

    #[test]
    fn test_truncated_input_fails() {
        let mut data: &[u8] = &[0x80, 0x80];
        assert!(read_varint(&mut data).is_err());
        let broken = [0x1a, 0x05, b'a'];
        assert!(fields(&broken).next().unwrap().is_err());
    }
}
