//! Single-sheet workbook streamed into a ZIP container

use super::shared_strings::SharedStrings;
use super::xml_writer::XmlWriter;
use crate::error::{ConvertError, Result};
use crate::types::CellValue;
use s_zip::{CompressionMethod, StreamingZipWriter};
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

/// Worksheet limits of the XLSX format
pub const MAX_ROWS: u32 = 1_048_576;
pub const MAX_COLUMNS: usize = 16_384;

const SPREADSHEET_NS: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";
const RELATIONSHIPS_NS: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";

/// Cell style indices in the generated styles.xml
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellStyle {
    Default = 0,
    HeaderBold = 1,
}

/// `io::Write` view of the ZIP entry currently open
struct EntryWriter<'a>(&'a mut StreamingZipWriter<File>);

impl Write for EntryWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .write_data(buf)
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Workbook with one worksheet; rows go straight into the compressed sheet entry
pub struct FastWorkbook {
    zip: StreamingZipWriter<File>,
    shared_strings: SharedStrings,
    row_xml: XmlWriter<Vec<u8>>,
    cell_ref_cache: Vec<String>,
    current_row: u32,
}

impl FastWorkbook {
    /// Create the file, write the package parts and open the worksheet
    pub fn create<P: AsRef<Path>>(path: P, sheet_name: &str) -> Result<Self> {
        let path = path.as_ref();
        let zip = StreamingZipWriter::with_method(path, CompressionMethod::Deflate, 6)
            .map_err(|e| {
                ConvertError::Write(format!("Failed to create {}: {}", path.display(), e))
            })?;

        let mut workbook = FastWorkbook {
            zip,
            shared_strings: SharedStrings::new(),
            row_xml: XmlWriter::with_capacity(Vec::with_capacity(64 * 1024), 64 * 1024),
            cell_ref_cache: (0..100).map(col_to_letter).collect(),
            current_row: 0,
        };

        workbook.write_part("[Content_Types].xml", CONTENT_TYPES.as_bytes())?;
        workbook.write_part("_rels/.rels", ROOT_RELS.as_bytes())?;
        let core = core_props();
        workbook.write_part("docProps/core.xml", core.as_bytes())?;
        workbook.write_part("docProps/app.xml", APP_PROPS.as_bytes())?;
        workbook.write_part("xl/styles.xml", STYLES.as_bytes())?;
        workbook.write_part("xl/_rels/workbook.xml.rels", WORKBOOK_RELS.as_bytes())?;

        let mut xml = XmlWriter::new(Vec::new());
        xml.declaration()?;
        xml.start_element("workbook")?;
        xml.attribute("xmlns", SPREADSHEET_NS)?;
        xml.attribute("xmlns:r", RELATIONSHIPS_NS)?;
        xml.close_start_tag()?;
        xml.write_str("<sheets>")?;
        xml.start_element("sheet")?;
        xml.attribute("name", sheet_name)?;
        xml.attribute_int("sheetId", 1)?;
        xml.attribute("r:id", "rId1")?;
        xml.close_empty()?;
        xml.write_str("</sheets>")?;
        xml.end_element("workbook")?;
        let bytes = xml.into_inner()?;
        workbook.write_part("xl/workbook.xml", &bytes)?;

        workbook.start_entry("xl/worksheets/sheet1.xml")?;
        let mut xml = XmlWriter::new(EntryWriter(&mut workbook.zip));
        xml.declaration()?;
        xml.start_element("worksheet")?;
        xml.attribute("xmlns", SPREADSHEET_NS)?;
        xml.attribute("xmlns:r", RELATIONSHIPS_NS)?;
        xml.close_start_tag()?;
        xml.write_str("<sheetData>")?;
        xml.flush()?;

        Ok(workbook)
    }

    fn start_entry(&mut self, name: &str) -> Result<()> {
        self.zip
            .start_entry(name)
            .map_err(|e| ConvertError::Write(format!("Failed to start ZIP entry {}: {}", name, e)))
    }

    fn write_part(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.start_entry(name)?;
        self.zip
            .write_data(data)
            .map_err(|e| ConvertError::Write(format!("Failed to write {}: {}", name, e)))
    }

    /// Rows written so far
    pub fn row_count(&self) -> u32 {
        self.current_row
    }

    /// Append one row; empty cells are skipped
    pub fn write_row<'a, I>(&mut self, cells: I, style: CellStyle) -> Result<()>
    where
        I: IntoIterator<Item = &'a CellValue>,
    {
        if self.current_row >= MAX_ROWS {
            return Err(ConvertError::Write(format!(
                "Excel worksheets hold at most {} rows",
                MAX_ROWS
            )));
        }
        self.current_row += 1;
        let row_num = self.current_row;

        let xml = &mut self.row_xml;
        xml.start_element("row")?;
        xml.attribute_int("r", row_num as u64)?;
        xml.close_start_tag()?;

        for (col_idx, cell) in cells.into_iter().enumerate() {
            if col_idx >= MAX_COLUMNS {
                return Err(ConvertError::Write(format!(
                    "Excel worksheets hold at most {} columns",
                    MAX_COLUMNS
                )));
            }
            if cell.is_empty() {
                continue;
            }

            xml.write_str("<c r=\"")?;
            match self.cell_ref_cache.get(col_idx) {
                Some(letters) => xml.write_str(letters)?,
                None => xml.write_str(&col_to_letter(col_idx))?,
            }
            xml.write_int(row_num as i64)?;
            xml.write_raw(b"\"")?;
            if style != CellStyle::Default {
                xml.attribute_int("s", style as u64)?;
            }

            match cell {
                CellValue::String(s) => {
                    let index = self.shared_strings.add_string(s);
                    xml.write_str(" t=\"s\"><v>")?;
                    xml.write_int(index as i64)?;
                }
                CellValue::Int(n) => {
                    xml.write_str("><v>")?;
                    xml.write_int(*n)?;
                }
                CellValue::Float(f) => {
                    xml.write_str("><v>")?;
                    xml.write_str(&f.to_string())?;
                }
                CellValue::Bool(b) => {
                    xml.write_str(" t=\"b\"><v>")?;
                    xml.write_raw(if *b { b"1" } else { b"0" })?;
                }
                CellValue::Empty => {}
            }
            xml.write_str("</v></c>")?;
        }
        xml.end_element("row")?;

        // Hand the finished row to the compressor
        xml.flush()?;
        let bytes = xml.get_mut();
        self.zip
            .write_data(bytes)
            .map_err(|e| ConvertError::Write(format!("Failed to write worksheet row: {}", e)))?;
        bytes.clear();
        Ok(())
    }

    /// Close the worksheet, write the shared strings and finish the ZIP
    pub fn close(mut self) -> Result<()> {
        self.zip
            .write_data(b"</sheetData></worksheet>")
            .map_err(|e| ConvertError::Write(format!("Failed to close worksheet: {}", e)))?;

        self.start_entry("xl/sharedStrings.xml")?;
        let mut xml = XmlWriter::new(EntryWriter(&mut self.zip));
        self.shared_strings.write_xml(&mut xml)?;
        xml.flush()?;
        drop(xml);

        log::debug!(
            "Workbook closed with {} row(s) and {} shared string(s)",
            self.current_row,
            self.shared_strings.len()
        );
        self.zip
            .finish()
            .map_err(|e| ConvertError::Write(format!("Failed to finish workbook: {}", e)))?;
        Ok(())
    }
}

/// Convert column index to Excel letters (0 -> A, 25 -> Z, 26 -> AA)
pub fn col_to_letter(col: usize) -> String {
    let mut result = Vec::new();
    let mut col = col + 1;
    while col > 0 {
        col -= 1;
        result.push(b'A' + (col % 26) as u8);
        col /= 26;
    }
    result.reverse();
    String::from_utf8_lossy(&result).into_owned()
}

fn core_props() -> String {
    let now = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<cp:coreProperties xmlns:cp="http://schemas.openxmlformats.org/package/2006/metadata/core-properties" xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:dcterms="http://purl.org/dc/terms/" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
<dc:creator>tabconv</dc:creator>
<dcterms:created xsi:type="dcterms:W3CDTF">{now}</dcterms:created>
<dcterms:modified xsi:type="dcterms:W3CDTF">{now}</dcterms:modified>
</cp:coreProperties>"#
    )
}

const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">
<Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>
<Default Extension="xml" ContentType="application/xml"/>
<Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/>
<Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>
<Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/>
<Override PartName="/xl/sharedStrings.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sharedStrings+xml"/>
<Override PartName="/docProps/core.xml" ContentType="application/vnd.openxmlformats-package.core-properties+xml"/>
<Override PartName="/docProps/app.xml" ContentType="application/vnd.openxmlformats-officedocument.extended-properties+xml"/>
</Types>"#;

const ROOT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/>
<Relationship Id="rId2" Type="http://schemas.openxmlformats.org/package/2006/relationships/metadata/core-properties" Target="docProps/core.xml"/>
<Relationship Id="rId3" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/extended-properties" Target="docProps/app.xml"/>
</Relationships>"#;

const APP_PROPS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Properties xmlns="http://schemas.openxmlformats.org/officeDocument/2006/extended-properties">
<Application>tabconv</Application>
<DocSecurity>0</DocSecurity>
<ScaleCrop>false</ScaleCrop>
<LinksUpToDate>false</LinksUpToDate>
<SharedDoc>false</SharedDoc>
</Properties>"#;

const WORKBOOK_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/>
<Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/>
<Relationship Id="rId3" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/sharedStrings" Target="sharedStrings.xml"/>
</Relationships>"#;

const STYLES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
<fonts count="2">
<font><sz val="11"/><name val="Calibri"/></font>
<font><b/><sz val="11"/><name val="Calibri"/></font>
</fonts>
<fills count="2">
<fill><patternFill patternType="none"/></fill>
<fill><patternFill patternType="gray125"/></fill>
</fills>
<borders count="1">
<border><left/><right/><top/><bottom/><diagonal/></border>
</borders>
<cellStyleXfs count="1">
<xf numFmtId="0" fontId="0" fillId="0" borderId="0"/>
</cellStyleXfs>
<cellXfs count="2">
<xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/>
<xf numFmtId="0" fontId="1" fillId="0" borderId="0" xfId="0" applyFont="1"/>
</cellXfs>
</styleSheet>"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming_reader::StreamingReader;
    use tempfile::tempdir;

    #[test]
    fn test_col_to_letter() {
        assert_eq!(col_to_letter(0), "A");
        assert_eq!(col_to_letter(25), "Z");
        assert_eq!(col_to_letter(26), "AA");
        assert_eq!(col_to_letter(16_383), "XFD");
    }

    #[test]
    fn test_workbook_reads_back() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("book.xlsx");

        let mut workbook = FastWorkbook::create(&path, "Data & more")?;
        workbook.write_row(&[CellValue::from("id"), CellValue::from("label")], CellStyle::HeaderBold)?;
        workbook.write_row(&[CellValue::Int(1), CellValue::from("a<b")], CellStyle::Default)?;
        workbook.write_row(&[CellValue::Float(2.5), CellValue::Empty, CellValue::Bool(true)], CellStyle::Default)?;
        assert_eq!(workbook.row_count(), 3);
        workbook.close()?;

        let reader = StreamingReader::open(&path)?;
        assert_eq!(reader.sheet_names(), ["Data & more"]);
        let rows: Vec<Vec<String>> = reader.rows(None)?.collect::<Result<_>>()?;
        assert_eq!(rows[0], vec!["id", "label"]);
        assert_eq!(rows[1], vec!["1", "a<b"]);
        assert_eq!(rows[2], vec!["2.5", "", "true"]);
        Ok(())
    }
}
