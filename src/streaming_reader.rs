//! Streaming reader for XLSX worksheets
//!
//! **Memory Usage:**
//! - Shared Strings Table (SST): loaded fully
//! - Worksheet XML: loaded fully from the ZIP (uncompressed size)
//! - Rows are then produced one at a time from that XML
//!
//! Cells come out as text: shared and inline strings verbatim, booleans as
//! `true`/`false`, numbers as written, and numbers carrying a date style as
//! ISO dates or datetimes. Error cells (`#N/A`, ...) become empty.

use crate::entities::decode_entities;
use crate::error::{ConvertError, Result};
use crate::infer::text_stream;
use crate::request::ReadOptions;
use crate::stream::BatchStream;
use chrono::{Duration, NaiveDate};
use s_zip::StreamingZipReader;
use std::collections::HashSet;
use std::path::Path;

/// XLSX workbook opened for row streaming
pub struct StreamingReader {
    archive: StreamingZipReader,
    sst: Vec<String>,
    date_styles: HashSet<usize>,
    sheet_names: Vec<String>,
    sheet_paths: Vec<String>,
}

impl StreamingReader {
    /// Open an XLSX file and load its shared strings, styles and sheet list
    ///
    /// # Example
    ///
    /// ```no_run
    /// use tabconv::streaming_reader::StreamingReader;
    ///
    /// let reader = StreamingReader::open("book.xlsx")?;
    /// println!("sheets: {:?}", reader.sheet_names());
    /// for row in reader.rows(None)? {
    ///     println!("{:?}", row?);
    /// }
    /// # Ok::<(), tabconv::error::ConvertError>(())
    /// ```
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut archive = StreamingZipReader::open(path).map_err(|e| {
            let hint = match path.extension().and_then(|e| e.to_str()) {
                Some(ext) if ext.eq_ignore_ascii_case("xls") => {
                    " (legacy binary .xls workbooks are not supported)"
                }
                _ => "",
            };
            ConvertError::read(format!("Failed to open workbook: {}{}", e, hint))
        })?;

        let sst = Self::load_shared_strings(&mut archive)?;
        let date_styles = Self::load_date_styles(&mut archive)?;
        let (sheet_names, sheet_paths) = Self::load_sheet_info(&mut archive)?;

        log::debug!(
            "Workbook has {} shared string(s) and sheets {:?}",
            sst.len(),
            sheet_names
        );

        Ok(StreamingReader {
            archive,
            sst,
            date_styles,
            sheet_names,
            sheet_paths,
        })
    }

    pub fn sheet_names(&self) -> &[String] {
        &self.sheet_names
    }

    /// Iterate the rows of `sheet` (the first sheet when `None`)
    ///
    /// Missing rows between populated ones come out as empty rows.
    pub fn rows(mut self, sheet: Option<&str>) -> Result<RowIterator> {
        let index = match sheet {
            None => 0,
            Some(name) => self
                .sheet_names
                .iter()
                .position(|n| n == name)
                .ok_or_else(|| {
                    ConvertError::read(format!(
                        "Sheet '{}' not found. Available sheets: {:?}",
                        name, self.sheet_names
                    ))
                })?,
        };
        let sheet_path = self
            .sheet_paths
            .get(index)
            .ok_or_else(|| ConvertError::read("Workbook contains no worksheets"))?
            .clone();

        let xml = self.read_part(&sheet_path)?.ok_or_else(|| {
            ConvertError::read(format!("Worksheet part {} is missing", sheet_path))
        })?;

        Ok(RowIterator {
            xml,
            position: 0,
            next_row_number: 1,
            sst: self.sst,
            date_styles: self.date_styles,
        })
    }

    fn read_part(&mut self, name: &str) -> Result<Option<String>> {
        Self::read_archive_part(&mut self.archive, name)
    }

    fn read_archive_part(archive: &mut StreamingZipReader, name: &str) -> Result<Option<String>> {
        let exists = archive.entries().iter().any(|e| e.name == name);
        if !exists {
            return Ok(None);
        }
        let data = archive
            .read_entry_by_name(name)
            .map_err(|e| ConvertError::read(format!("Failed to read {}: {}", name, e)))?;
        String::from_utf8(data)
            .map(Some)
            .map_err(|e| ConvertError::read(format!("{} is not valid UTF-8: {}", name, e)))
    }

    /// Load the shared strings table; rich-text runs are concatenated
    fn load_shared_strings(archive: &mut StreamingZipReader) -> Result<Vec<String>> {
        let Some(xml) = Self::read_archive_part(archive, "xl/sharedStrings.xml")? else {
            return Ok(Vec::new());
        };

        let mut sst = Vec::new();
        let mut pos = 0;
        while let Some(start) = find_tag(&xml, pos, "si") {
            let Some(open_end) = xml[start..].find('>').map(|i| start + i) else {
                break;
            };
            if xml[..open_end].ends_with('/') {
                sst.push(String::new());
                pos = open_end + 1;
                continue;
            }
            let end = xml[open_end..]
                .find("</si>")
                .map(|i| open_end + i)
                .unwrap_or(xml.len());
            sst.push(collect_text(&xml[open_end + 1..end]));
            pos = end;
        }
        Ok(sst)
    }

    /// Style indices whose number format displays a date or time
    fn load_date_styles(archive: &mut StreamingZipReader) -> Result<HashSet<usize>> {
        let mut styles = HashSet::new();
        let Some(xml) = Self::read_archive_part(archive, "xl/styles.xml")? else {
            return Ok(styles);
        };

        // Custom formats: <numFmt numFmtId="164" formatCode="yyyy-mm-dd"/>
        let mut custom_dates = HashSet::new();
        let mut pos = 0;
        while let Some(start) = find_tag(&xml, pos, "numFmt") {
            let end = xml[start..].find('>').map_or(xml.len(), |i| start + i);
            let tag = &xml[start..end];
            if let (Some(id), Some(code)) = (attr(tag, "numFmtId"), attr(tag, "formatCode")) {
                if is_date_format_code(&decode_entities(code)) {
                    if let Ok(id) = id.parse::<u32>() {
                        custom_dates.insert(id);
                    }
                }
            }
            pos = end;
        }

        // Cell formats, in order: <cellXfs><xf numFmtId="14" .../>...</cellXfs>
        if let Some(xfs_start) = xml.find("<cellXfs") {
            let xfs_end = xml[xfs_start..]
                .find("</cellXfs>")
                .map_or(xml.len(), |i| xfs_start + i);
            let section = &xml[xfs_start..xfs_end];
            let mut pos = 0;
            let mut index = 0;
            while let Some(start) = find_tag(section, pos, "xf") {
                let end = section[start..].find('>').map_or(section.len(), |i| start + i);
                let id = attr(&section[start..end], "numFmtId")
                    .and_then(|v| v.parse::<u32>().ok())
                    .unwrap_or(0);
                if is_builtin_date_format(id) || custom_dates.contains(&id) {
                    styles.insert(index);
                }
                index += 1;
                pos = end;
            }
        }
        Ok(styles)
    }

    /// Load sheet names from workbook.xml and resolve their parts via the relationships
    fn load_sheet_info(archive: &mut StreamingZipReader) -> Result<(Vec<String>, Vec<String>)> {
        let workbook = Self::read_archive_part(archive, "xl/workbook.xml")?
            .ok_or_else(|| ConvertError::read("Not an XLSX workbook: xl/workbook.xml is missing"))?;
        let rels =
            Self::read_archive_part(archive, "xl/_rels/workbook.xml.rels")?.unwrap_or_default();

        let mut names = Vec::new();
        let mut paths = Vec::new();
        let mut pos = 0;
        while let Some(start) = find_tag(&workbook, pos, "sheet") {
            let end = workbook[start..].find('>').map_or(workbook.len(), |i| start + i);
            let tag = &workbook[start..end];
            pos = end;

            let Some(name) = attr(tag, "name") else {
                continue;
            };
            let target = attr(tag, "r:id")
                .and_then(|rid| relationship_target(&rels, rid))
                .unwrap_or_else(|| format!("worksheets/sheet{}.xml", names.len() + 1));

            names.push(decode_entities(name).into_owned());
            paths.push(match target.strip_prefix('/') {
                Some(absolute) => absolute.to_string(),
                None => format!("xl/{}", target),
            });
        }
        Ok((names, paths))
    }
}

/// Find the next `<name` start tag at or after `from` (not a longer tag name)
fn find_tag(xml: &str, from: usize, name: &str) -> Option<usize> {
    let pattern = format!("<{}", name);
    let mut pos = from;
    while let Some(i) = xml.get(pos..)?.find(&pattern) {
        let start = pos + i;
        match xml.as_bytes().get(start + pattern.len()) {
            Some(b' ') | Some(b'>') | Some(b'/') | Some(b'\t') | Some(b'\n') | Some(b'\r') => {
                return Some(start)
            }
            _ => pos = start + pattern.len(),
        }
    }
    None
}

/// Value of ` name="..."` inside a start tag
fn attr<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    for quote in ['"', '\''] {
        let pattern = format!(" {}={}", name, quote);
        if let Some(i) = tag.find(&pattern) {
            let rest = &tag[i + pattern.len()..];
            return rest.find(quote).map(|end| &rest[..end]);
        }
    }
    None
}

fn relationship_target(rels: &str, rid: &str) -> Option<String> {
    let mut pos = 0;
    while let Some(start) = find_tag(rels, pos, "Relationship") {
        let end = rels[start..].find('>').map_or(rels.len(), |i| start + i);
        let tag = &rels[start..end];
        if attr(tag, "Id") == Some(rid) {
            return attr(tag, "Target").map(|t| decode_entities(t).into_owned());
        }
        pos = end;
    }
    None
}

/// Concatenate every `<t>` run in a fragment
fn collect_text(fragment: &str) -> String {
    let mut text = String::new();
    let mut pos = 0;
    while let Some(start) = find_tag(fragment, pos, "t") {
        let Some(open_end) = fragment[start..].find('>').map(|i| start + i) else {
            break;
        };
        if fragment[..open_end].ends_with('/') {
            pos = open_end + 1;
            continue;
        }
        let end = fragment[open_end..]
            .find("</t>")
            .map_or(fragment.len(), |i| open_end + i);
        text.push_str(&decode_entities(&fragment[open_end + 1..end]));
        pos = end;
    }
    text
}

fn is_builtin_date_format(id: u32) -> bool {
    matches!(id, 14..=22 | 27..=36 | 45..=47 | 50..=58)
}

/// Date-like custom format: has d/m/y/h/s outside quotes and brackets
fn is_date_format_code(code: &str) -> bool {
    let mut in_quotes = false;
    let mut in_brackets = false;
    for ch in code.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '[' if !in_quotes => in_brackets = true,
            ']' if !in_quotes => in_brackets = false,
            'd' | 'D' | 'm' | 'M' | 'y' | 'Y' | 'h' | 'H' | 's' | 'S'
                if !in_quotes && !in_brackets =>
            {
                return true
            }
            _ => {}
        }
    }
    false
}

/// Convert an Excel serial date (1900 system) to ISO text
fn serial_to_iso(serial: f64) -> Option<String> {
    // 2958466 is 9999-12-31
    if !serial.is_finite() || !(0.0..2_958_466.0).contains(&serial) {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    let days = serial.floor();
    let millis = ((serial - days) * 86_400_000.0).round() as i64;
    let datetime = epoch.and_hms_opt(0, 0, 0)?
        + Duration::days(days as i64)
        + Duration::milliseconds(millis);
    if millis == 0 {
        Some(datetime.date().format("%Y-%m-%d").to_string())
    } else {
        Some(datetime.format("%Y-%m-%d %H:%M:%S").to_string())
    }
}

/// Column index (0-based) from a cell reference such as `AB12`
fn column_index(reference: &str) -> Option<usize> {
    let mut index = 0usize;
    let mut seen = false;
    for b in reference.bytes() {
        if b.is_ascii_alphabetic() {
            index = index * 26 + (b.to_ascii_uppercase() - b'A' + 1) as usize;
            seen = true;
        } else {
            break;
        }
    }
    seen.then(|| index - 1)
}

/// Iterator over worksheet rows, each a vector of cell texts
#[derive(Clone)]
pub struct RowIterator {
    xml: String,
    position: usize,
    next_row_number: usize,
    sst: Vec<String>,
    date_styles: HashSet<usize>,
}

impl RowIterator {
    fn parse_row(&self, row_xml: &str) -> Result<Vec<String>> {
        let mut cells: Vec<String> = Vec::new();
        let mut pos = 0;
        while let Some(start) = find_tag(row_xml, pos, "c") {
            let Some(open_end) = row_xml[start..].find('>').map(|i| start + i) else {
                break;
            };
            let tag = &row_xml[start..open_end];
            let self_closing = tag.ends_with('/');
            let (body, next) = if self_closing {
                ("", open_end + 1)
            } else {
                let end = row_xml[open_end..]
                    .find("</c>")
                    .map_or(row_xml.len(), |i| open_end + i);
                (&row_xml[open_end + 1..end], end)
            };
            pos = next;

            let column = attr(tag, "r")
                .and_then(column_index)
                .unwrap_or(cells.len());
            let value = self.cell_value(tag, body)?;
            if column >= cells.len() {
                cells.resize(column + 1, String::new());
            }
            cells[column] = value;
        }
        Ok(cells)
    }

    fn cell_value(&self, tag: &str, body: &str) -> Result<String> {
        let raw = between(body, "<v>", "</v>").or_else(|| {
            between(body, "<v ", "</v>").and_then(|v| v.split_once('>').map(|(_, v)| v))
        });

        let value = match attr(tag, "t") {
            Some("s") => {
                let index = raw
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .ok_or_else(|| ConvertError::read("Shared string cell without an index"))?;
                self.sst.get(index).cloned().ok_or_else(|| {
                    ConvertError::read(format!("Shared string index {} out of range", index))
                })?
            }
            Some("inlineStr") => collect_text(body),
            Some("b") => match raw.map(str::trim) {
                Some("1") => "true".to_string(),
                Some("0") => "false".to_string(),
                _ => String::new(),
            },
            Some("e") => String::new(),
            Some("str") => raw.map(|v| decode_entities(v).into_owned()).unwrap_or_default(),
            _ => {
                let text = raw.map(str::trim).unwrap_or_default();
                let is_date = attr(tag, "s")
                    .and_then(|s| s.parse::<usize>().ok())
                    .is_some_and(|s| self.date_styles.contains(&s));
                match (is_date, text.parse::<f64>()) {
                    (true, Ok(serial)) => serial_to_iso(serial).unwrap_or_else(|| text.to_string()),
                    _ => text.to_string(),
                }
            }
        };
        Ok(value)
    }
}

fn between<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let end = text[start..].find(close)? + start;
    Some(&text[start..end])
}

impl Iterator for RowIterator {
    type Item = Result<Vec<String>>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = find_tag(&self.xml, self.position, "row")?;
        let Some(open_end) = self.xml[start..].find('>').map(|i| start + i) else {
            self.position = self.xml.len();
            return None;
        };
        let tag = &self.xml[start..open_end];
        let row_number = attr(tag, "r").and_then(|r| r.parse::<usize>().ok());

        // Rows the sheet skipped come out blank before this one
        if row_number.is_some_and(|n| n > self.next_row_number) {
            self.next_row_number += 1;
            return Some(Ok(Vec::new()));
        }

        let (cells, next_position) = if tag.ends_with('/') {
            (Ok(Vec::new()), open_end + 1)
        } else {
            let end = self.xml[open_end..]
                .find("</row>")
                .map_or(self.xml.len(), |i| open_end + i);
            (self.parse_row(&self.xml[open_end + 1..end]), end)
        };
        self.position = next_position;
        self.next_row_number = row_number.unwrap_or(self.next_row_number) + 1;
        Some(cells)
    }
}

/// Open the requested worksheet as a typed batch stream (first row is the header)
pub fn read_excel(path: &Path, options: &ReadOptions) -> Result<BatchStream> {
    let reader = StreamingReader::open(path)?;
    let mut rows = reader.rows(options.sheet_name.as_deref())?;
    let header = rows.next().transpose()?.unwrap_or_default();
    text_stream(header, || Ok(rows.clone()), options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_index() {
        assert_eq!(column_index("A1"), Some(0));
        assert_eq!(column_index("Z9"), Some(25));
        assert_eq!(column_index("AA10"), Some(26));
        assert_eq!(column_index("12"), None);
    }

    #[test]
    fn test_serial_dates() {
        assert_eq!(serial_to_iso(45292.0).as_deref(), Some("2024-01-01"));
        assert_eq!(serial_to_iso(45292.5).as_deref(), Some("2024-01-01 12:00:00"));
        assert_eq!(serial_to_iso(-1.0), None);
    }

    #[test]
    fn test_date_format_codes() {
        assert!(is_date_format_code("yyyy-mm-dd"));
        assert!(is_date_format_code("[$-409]d-mmm-yy"));
        assert!(!is_date_format_code("0.00%"));
        assert!(!is_date_format_code("\"days\" 0"));
        assert!(is_builtin_date_format(14));
        assert!(!is_builtin_date_format(2));
    }

    #[test]
    fn test_rich_text_and_attrs() {
        let si = r#"<r><rPr><b/></rPr><t>Hello</t></r><r><t xml:space="preserve"> &amp; bye</t></r>"#;
        assert_eq!(collect_text(si), "Hello & bye");
        assert_eq!(attr(r#"<sheet name="Data" r:id="rId2""#, "r:id"), Some("rId2"));
        assert_eq!(attr(r#"<sheet name="Data" sheetId="1""#, "id"), None);
    }

    fn iterator(xml: &str) -> RowIterator {
        RowIterator {
            xml: xml.to_string(),
            position: 0,
            next_row_number: 1,
            sst: vec!["name".to_string(), "Alice".to_string()],
            date_styles: HashSet::from([1]),
        }
    }

    #[test]
    fn test_row_parsing() -> Result<()> {
        let xml = concat!(
            r#"<sheetData><row r="1"><c r="A1" t="s"><v>0</v></c><c r="C1" t="b"><v>1</v></c></row>"#,
            r#"<row r="3"><c r="A3" t="inlineStr"><is><t>x&lt;y</t></is></c><c r="B3" s="1"><v>45292</v></c>"#,
            r#"<c r="C3" t="e"><v>#N/A</v></c><c r="D3" s="0"/></row></sheetData>"#
        );
        let rows: Vec<_> = iterator(xml).collect::<Result<_>>()?;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], vec!["name", "", "true"]);
        assert!(rows[1].is_empty());
        assert_eq!(rows[2], vec!["x<y", "2024-01-01", "", ""]);
        Ok(())
    }

    #[test]
    fn test_bad_shared_index() {
        let xml = r#"<row r="1"><c r="A1" t="s"><v>7</v></c></row>"#;
        let mut rows = iterator(xml);
        assert!(rows.next().unwrap().is_err());
    }
}
