//! Buffered XML writer with minimal allocations

use crate::error::Result;
use std::io::Write;

const DECLARATION: &[u8] = b"<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n";

/// XML writer that batches small writes into one buffer
pub struct XmlWriter<W: Write> {
    writer: W,
    buffer: Vec<u8>,
    flush_threshold: usize,
    numbers: itoa::Buffer,
}

impl<W: Write> XmlWriter<W> {
    pub fn new(writer: W) -> Self {
        Self::with_capacity(writer, 8192)
    }

    pub fn with_capacity(writer: W, capacity: usize) -> Self {
        XmlWriter {
            writer,
            buffer: Vec::with_capacity(capacity),
            flush_threshold: capacity / 2,
            numbers: itoa::Buffer::new(),
        }
    }

    #[inline]
    fn auto_flush(&mut self) -> Result<()> {
        if self.buffer.len() >= self.flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    #[inline]
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        self.auto_flush()
    }

    #[inline]
    pub fn write_str(&mut self, s: &str) -> Result<()> {
        self.write_raw(s.as_bytes())
    }

    /// `<?xml ...?>` header
    pub fn declaration(&mut self) -> Result<()> {
        self.write_raw(DECLARATION)
    }

    /// Open a start tag; attributes may follow until `close_start_tag`
    #[inline]
    pub fn start_element(&mut self, name: &str) -> Result<()> {
        self.buffer.push(b'<');
        self.write_str(name)
    }

    #[inline]
    pub fn close_start_tag(&mut self) -> Result<()> {
        self.write_raw(b">")
    }

    /// Close a start tag as self-closing (`/>`)
    #[inline]
    pub fn close_empty(&mut self) -> Result<()> {
        self.write_raw(b"/>")
    }

    #[inline]
    pub fn end_element(&mut self, name: &str) -> Result<()> {
        self.buffer.extend_from_slice(b"</");
        self.buffer.extend_from_slice(name.as_bytes());
        self.write_raw(b">")
    }

    #[inline]
    pub fn attribute(&mut self, name: &str, value: &str) -> Result<()> {
        self.buffer.push(b' ');
        self.buffer.extend_from_slice(name.as_bytes());
        self.buffer.extend_from_slice(b"=\"");
        self.write_escaped(value)?;
        self.write_raw(b"\"")
    }

    #[inline]
    pub fn attribute_int(&mut self, name: &str, value: u64) -> Result<()> {
        self.buffer.push(b' ');
        self.buffer.extend_from_slice(name.as_bytes());
        self.buffer.extend_from_slice(b"=\"");
        let digits = self.numbers.format(value);
        self.buffer.extend_from_slice(digits.as_bytes());
        self.write_raw(b"\"")
    }

    /// Write an integer as text content
    #[inline]
    pub fn write_int(&mut self, value: i64) -> Result<()> {
        let digits = self.numbers.format(value);
        self.buffer.extend_from_slice(digits.as_bytes());
        self.auto_flush()
    }

    /// Write text content with XML escaping; control characters XML 1.0 forbids are dropped
    pub fn write_escaped(&mut self, text: &str) -> Result<()> {
        for ch in text.chars() {
            match ch {
                '&' => self.buffer.extend_from_slice(b"&amp;"),
                '<' => self.buffer.extend_from_slice(b"&lt;"),
                '>' => self.buffer.extend_from_slice(b"&gt;"),
                '"' => self.buffer.extend_from_slice(b"&quot;"),
                '\'' => self.buffer.extend_from_slice(b"&apos;"),
                c if (c as u32) < 0x20 && !matches!(c, '\t' | '\n' | '\r') => continue,
                c => {
                    let mut buf = [0u8; 4];
                    self.buffer
                        .extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
        self.auto_flush()
    }

    /// Push buffered bytes into the underlying writer
    pub fn flush(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.writer.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Flush and return the underlying writer
    pub fn into_inner(mut self) -> Result<W> {
        self.flush()?;
        Ok(self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elements_and_attributes() -> Result<()> {
        let mut output = Vec::new();
        let mut writer = XmlWriter::new(&mut output);

        writer.start_element("row")?;
        writer.attribute_int("r", 12)?;
        writer.close_start_tag()?;
        writer.start_element("c")?;
        writer.attribute("t", "s")?;
        writer.close_empty()?;
        writer.write_int(-3)?;
        writer.end_element("row")?;
        writer.flush()?;

        assert_eq!(
            String::from_utf8(output).unwrap(),
            "<row r=\"12\"><c t=\"s\"/>-3</row>"
        );
        Ok(())
    }

    #[test]
    fn test_escaping_drops_control_chars() -> Result<()> {
        let writer = {
            let mut writer = XmlWriter::new(Vec::new());
            writer.write_escaped("<a>&\"b\"\u{1}\ttab")?;
            writer
        };
        let output = writer.into_inner()?;
        assert_eq!(
            String::from_utf8(output).unwrap(),
            "&lt;a&gt;&amp;&quot;b&quot;\ttab"
        );
        Ok(())
    }
}
