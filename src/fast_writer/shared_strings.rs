//! Shared strings table (`xl/sharedStrings.xml`)

use super::xml_writer::XmlWriter;
use crate::error::Result;
use indexmap::IndexSet;
use std::io::Write;

/// Deduplicated workbook strings in first-seen order
#[derive(Debug, Default)]
pub struct SharedStrings {
    strings: IndexSet<String>,
    references: u64,
}

impl SharedStrings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `s` in the table, inserting it when new
    pub fn add_string(&mut self, s: &str) -> usize {
        self.references += 1;
        match self.strings.get_index_of(s) {
            Some(index) => index,
            None => self.strings.insert_full(s.to_string()).0,
        }
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn write_xml<W: Write>(&self, xml: &mut XmlWriter<W>) -> Result<()> {
        xml.declaration()?;
        xml.start_element("sst")?;
        xml.attribute(
            "xmlns",
            "http://schemas.openxmlformats.org/spreadsheetml/2006/main",
        )?;
        xml.attribute_int("count", self.references)?;
        xml.attribute_int("uniqueCount", self.strings.len() as u64)?;
        xml.close_start_tag()?;
        for s in &self.strings {
            xml.write_str("<si><t")?;
            if s.starts_with(char::is_whitespace) || s.ends_with(char::is_whitespace) {
                xml.attribute("xml:space", "preserve")?;
            }
            xml.close_start_tag()?;
            xml.write_escaped(s)?;
            xml.write_str("</t></si>")?;
        }
        xml.end_element("sst")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_and_xml() -> Result<()> {
        let mut sst = SharedStrings::new();
        assert_eq!(sst.add_string("a"), 0);
        assert_eq!(sst.add_string(" b"), 1);
        assert_eq!(sst.add_string("a"), 0);
        assert_eq!(sst.len(), 2);

        let mut xml = XmlWriter::new(Vec::new());
        sst.write_xml(&mut xml)?;
        let text = String::from_utf8(xml.into_inner()?).unwrap();
        assert!(text.contains("count=\"3\" uniqueCount=\"2\""));
        assert!(text.contains("<si><t>a</t></si><si><t xml:space=\"preserve\"> b</t></si>"));
        Ok(())
    }
}
