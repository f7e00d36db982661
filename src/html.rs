//! HTML table reader (read only)
//!
//! Every `<table>` in the document is a candidate; `table_number` picks one
//! (out of range falls back to the first table with a warning). Header cells
//! come from `<thead>` or a leading row made only of `<th>` cells, otherwise
//! columns are numbered `0`, `1`, ... Cell markup is stripped, entities are
//! decoded, whitespace is collapsed, and `colspan`/`rowspan` repeat the value
//! into every covered position.

use crate::entities::decode_entities;
use crate::error::{ConvertError, Result};
use crate::infer::text_stream;
use crate::request::ReadOptions;
use crate::stream::BatchStream;
use std::path::Path;

/// One parsed `<table>`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HtmlTable {
    pub header: Option<Vec<String>>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug)]
struct RawCell {
    text: String,
    is_header: bool,
    colspan: usize,
    rowspan: usize,
}

#[derive(Debug)]
struct RawRow {
    cells: Vec<RawCell>,
    in_thead: bool,
}

/// Parse every top-level table of a document, in document order
pub fn parse_tables(html: &str) -> Vec<HtmlTable> {
    // ASCII lowercasing keeps byte offsets identical
    let lower = html.to_ascii_lowercase();
    let mut tables = Vec::new();
    let mut pos = 0;
    while let Some(start) = find_tag(&lower, pos, "table") {
        let end = matching_close(&lower, start);
        tables.push(parse_table(&html[start..end], &lower[start..end]));
        pos = end;
    }
    tables
}

/// Position of the next `<name` start tag (not a longer tag name)
fn find_tag(lower: &str, from: usize, name: &str) -> Option<usize> {
    let pattern = format!("<{}", name);
    let mut pos = from;
    while let Some(i) = lower.get(pos..)?.find(&pattern) {
        let start = pos + i;
        match lower.as_bytes().get(start + pattern.len()) {
            Some(b) if b.is_ascii_alphanumeric() || *b == b'-' => pos = start + pattern.len(),
            _ => return Some(start),
        }
    }
    None
}

/// End of the `<table>` starting at `start`, honouring nested tables
fn matching_close(lower: &str, start: usize) -> usize {
    let mut depth = 0usize;
    let mut pos = start;
    loop {
        let next_open = find_tag(lower, pos + 1, "table");
        let next_close = lower[pos..].find("</table").map(|i| pos + i);
        match (next_open, next_close) {
            (Some(open), Some(close)) if open < close => {
                depth += 1;
                pos = open;
            }
            (_, Some(close)) => {
                if depth == 0 {
                    return lower[close..].find('>').map_or(lower.len(), |i| close + i + 1);
                }
                depth -= 1;
                pos = close + 1;
            }
            (_, None) => return lower.len(),
        }
    }
}

fn span_attr(tag: &str, name: &str) -> usize {
    let Some(i) = tag.find(name) else {
        return 1;
    };
    let rest = tag[i + name.len()..].trim_start();
    let Some(rest) = rest.strip_prefix('=') else {
        return 1;
    };
    let digits: String = rest
        .trim_start()
        .trim_start_matches(['"', '\''])
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse::<usize>().ok().filter(|n| *n > 0).map_or(1, |n| n.min(1000))
}

/// Strip tags, decode entities and collapse whitespace
fn cell_text(fragment: &str) -> String {
    let mut text = String::with_capacity(fragment.len());
    let mut in_tag = false;
    for ch in fragment.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                text.push(' ');
            }
            c if !in_tag => text.push(c),
            _ => {}
        }
    }
    let decoded = decode_entities(&text);
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Blank out tables nested inside this one; offsets stay unchanged
fn mask_nested(html: &str, lower: &str) -> (String, String) {
    let mut html_bytes = html.as_bytes().to_vec();
    let mut lower_bytes = lower.as_bytes().to_vec();
    let mut pos = 1;
    while let Some(start) = find_tag(lower, pos, "table") {
        let end = matching_close(lower, start);
        html_bytes[start..end].fill(b' ');
        lower_bytes[start..end].fill(b' ');
        pos = end;
    }
    (
        String::from_utf8_lossy(&html_bytes).into_owned(),
        String::from_utf8_lossy(&lower_bytes).into_owned(),
    )
}

fn parse_table(html: &str, lower: &str) -> HtmlTable {
    let (html, lower) = mask_nested(html, lower);
    let (html, lower) = (html.as_str(), lower.as_str());
    // Skip the opening <table ...> tag
    let body_start = lower.find('>').map_or(lower.len(), |i| i + 1);
    let mut raw_rows = Vec::new();
    let mut pos = body_start;

    while let Some(row_start) = find_tag(lower, pos, "tr") {
        let in_thead = {
            let before = &lower[..row_start];
            match (before.rfind("<thead"), before.rfind("</thead")) {
                (Some(open), Some(close)) => open > close,
                (Some(_), None) => true,
                _ => false,
            }
        };
        let row_body = lower[row_start..].find('>').map_or(lower.len(), |i| row_start + i + 1);
        let row_end = [
            lower[row_body..].find("</tr").map(|i| row_body + i),
            find_tag(lower, row_body, "tr"),
            lower[row_body..].find("</table").map(|i| row_body + i),
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(lower.len());

        raw_rows.push(RawRow {
            cells: parse_cells(&html[row_body..row_end], &lower[row_body..row_end]),
            in_thead,
        });
        pos = row_end;
    }

    let grid = expand_spans(&raw_rows);
    let header_rows = raw_rows.iter().take_while(|r| r.in_thead).count();
    let (header, body_from) = if header_rows > 0 {
        (Some(grid[0].clone()), header_rows)
    } else if raw_rows
        .first()
        .is_some_and(|r| !r.cells.is_empty() && r.cells.iter().all(|c| c.is_header))
    {
        (Some(grid[0].clone()), 1)
    } else {
        (None, 0)
    };

    HtmlTable {
        header,
        rows: grid.into_iter().skip(body_from).filter(|r| !r.is_empty()).collect(),
    }
}

fn parse_cells(html: &str, lower: &str) -> Vec<RawCell> {
    let mut starts: Vec<(usize, bool)> = Vec::new();
    let mut pos = 0;
    loop {
        let td = find_tag(lower, pos, "td");
        let th = find_tag(lower, pos, "th");
        let next = match (td, th) {
            (Some(a), Some(b)) if a < b => (a, false),
            (Some(a), None) => (a, false),
            (_, Some(b)) => (b, true),
            (None, None) => break,
        };
        starts.push(next);
        pos = next.0 + 3;
    }

    let mut cells = Vec::with_capacity(starts.len());
    for (i, (start, is_header)) in starts.iter().enumerate() {
        let tag_end = lower[*start..].find('>').map_or(lower.len(), |j| start + j + 1);
        let limit = starts
            .get(i + 1)
            .map_or(lower.len(), |(next, _)| *next)
            .max(tag_end);
        let close = if *is_header { "</th" } else { "</td" };
        let end = lower[tag_end..limit].find(close).map_or(limit, |j| tag_end + j);
        let tag = &lower[*start..tag_end];
        cells.push(RawCell {
            text: cell_text(&html[tag_end..end]),
            is_header: *is_header,
            colspan: span_attr(tag, "colspan"),
            rowspan: span_attr(tag, "rowspan"),
        });
    }
    cells
}

/// Lay cells out on a grid, repeating spanned values
fn expand_spans(rows: &[RawRow]) -> Vec<Vec<String>> {
    // Per column: value and remaining rows of an active rowspan
    let mut carried: Vec<Option<(String, usize)>> = Vec::new();
    let mut grid = Vec::with_capacity(rows.len());

    for row in rows {
        let mut out: Vec<String> = Vec::new();
        let mut cells = row.cells.iter();
        let mut col = 0;
        loop {
            if let Some(Some((value, remaining))) = carried.get_mut(col) {
                out.push(value.clone());
                *remaining -= 1;
                if *remaining == 0 {
                    carried[col] = None;
                }
                col += 1;
                continue;
            }
            let Some(cell) = cells.next() else {
                if carried.iter().skip(col).any(Option::is_some) {
                    out.push(String::new());
                    col += 1;
                    continue;
                }
                break;
            };
            for _ in 0..cell.colspan {
                out.push(cell.text.clone());
                if cell.rowspan > 1 {
                    if carried.len() <= col {
                        carried.resize(col + 1, None);
                    }
                    carried[col] = Some((cell.text.clone(), cell.rowspan - 1));
                }
                col += 1;
            }
        }
        grid.push(out);
    }
    grid
}

/// Open the requested table of an HTML document as a typed batch stream
pub fn read_html(path: &Path, options: &ReadOptions) -> Result<BatchStream> {
    let bytes = std::fs::read(path)?;
    let html = String::from_utf8_lossy(&bytes);
    let mut tables = parse_tables(&html);
    if tables.is_empty() {
        return Err(ConvertError::read(format!(
            "No tables found in {}",
            path.display()
        )));
    }

    let index = if options.table_number < tables.len() {
        options.table_number
    } else {
        log::warn!(
            "Table {} not found ({} table(s) in document), using table 0",
            options.table_number,
            tables.len()
        );
        0
    };
    let table = tables.swap_remove(index);

    let width = table
        .rows
        .iter()
        .map(Vec::len)
        .chain(table.header.as_ref().map(Vec::len))
        .max()
        .unwrap_or(0);
    let mut header = table
        .header
        .unwrap_or_else(|| (0..width).map(|i| i.to_string()).collect());
    header.resize(width, String::new());

    log::debug!(
        "HTML table {} has {} column(s) and {} row(s)",
        index,
        width,
        table.rows.len()
    );
    let rows = table.rows;
    text_stream(header, || Ok(rows.clone().into_iter().map(Ok)), options)
}
