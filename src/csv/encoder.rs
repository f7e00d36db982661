//! Delimited record encoding with RFC 4180-like quoting

/// Encoder that appends quoted/escaped records to a byte buffer
pub struct CsvEncoder {
    delimiter: u8,
    quote_char: u8,
}

impl CsvEncoder {
    pub fn new(delimiter: u8, quote_char: u8) -> Self {
        Self {
            delimiter,
            quote_char,
        }
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    /// Append one record (no line terminator) to `buffer`
    pub fn encode_record<I, S>(&self, fields: I, buffer: &mut Vec<u8>)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for (i, field) in fields.into_iter().enumerate() {
            if i > 0 {
                buffer.push(self.delimiter);
            }
            self.encode_field(field.as_ref(), buffer);
        }
    }

    /// Append one field, quoting it when needed
    pub fn encode_field(&self, field: &str, buffer: &mut Vec<u8>) {
        if !self.needs_quoting(field) {
            buffer.extend_from_slice(field.as_bytes());
            return;
        }

        buffer.push(self.quote_char);
        for byte in field.bytes() {
            if byte == self.quote_char {
                buffer.push(self.quote_char);
            }
            buffer.push(byte);
        }
        buffer.push(self.quote_char);
    }

    fn needs_quoting(&self, field: &str) -> bool {
        field
            .bytes()
            .any(|b| b == self.delimiter || b == self.quote_char || b == b'\n' || b == b'\r')
    }
}
