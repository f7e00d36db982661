//! SAS `.sas7bdat` datasets (read only)
//!
//! A dataset is a header followed by fixed-size pages. Column metadata lives
//! in subheaders on meta and mix pages; rows live on mix and data pages, or,
//! in compressed datasets, in one subheader per row. Pages are read one at a
//! time, so a chunked read holds one chunk of rows and one page in memory.
//!
//! Every SAS number is a (possibly truncated) double: numeric columns become
//! `Float64` unless their display format marks a date, datetime or time.
//! Character columns become strings, or raw bytes with `keep_bytes`. Blank
//! cells and SAS missing values are nulls.

use crate::error::{ConvertError, Result};
use crate::request::ReadOptions;
use crate::stream::BatchStream;
use arrow::array::{
    ArrayRef, BinaryArray, Date32Array, Float64Array, StringArray, Time64MicrosecondArray,
    TimestampMillisecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

const MAGIC: [u8; 32] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xc2, 0xea, 0x81,
    0x60, 0xb3, 0x14, 0x11, 0xcf, 0xbd, 0x92, 0x08, 0x00, 0x09, 0xc7, 0x31, 0x8c, 0x18, 0x1f,
    0x10, 0x11,
];

/// Days from 1960-01-01 (SAS epoch) to 1970-01-01
const SAS_EPOCH_DAYS: i64 = 3653;
const SAS_EPOCH_SECONDS: i64 = SAS_EPOCH_DAYS * 86_400;

/// Rows per batch when the caller reads the whole file
const BATCH_ROWS: usize = 65_536;

const RLE_LITERAL: &[u8] = b"SASYZCRL";
const RDC_LITERAL: &[u8] = b"SASYZCR2";

const DATE_FORMATS: &[&str] = &[
    "DATE", "DAY", "DDMMYY", "DDMMYYB", "DDMMYYC", "DDMMYYD", "DDMMYYN", "DDMMYYP", "DDMMYYS",
    "DOWNAME", "E8601DA", "B8601DA", "JULDAY", "JULIAN", "MINGUO", "MMDDYY", "MMDDYYB", "MMDDYYC",
    "MMDDYYD", "MMDDYYN", "MMDDYYP", "MMDDYYS", "MMYY", "MMYYC", "MMYYD", "MMYYN", "MMYYP",
    "MMYYS", "MONNAME", "MONTH", "MONYY", "NENGO", "QTR", "QTRR", "WEEKDATE", "WEEKDATX",
    "WEEKDAY", "WEEKV", "WORDDATE", "WORDDATX", "YEAR", "YYMM", "YYMMC", "YYMMD", "YYMMDD",
    "YYMMDDB", "YYMMDDC", "YYMMDDD", "YYMMDDN", "YYMMDDP", "YYMMDDS", "YYMMN", "YYMMP", "YYMMS",
    "YYMON", "YYQ", "YYQC", "YYQD", "YYQN", "YYQP", "YYQS", "YYQR", "YYQRC", "YYQRD", "YYQRN",
    "YYQRP", "YYQRS",
];

const DATETIME_FORMATS: &[&str] = &[
    "DATETIME", "DATEAMPM", "DTDATE", "DTMONYY", "DTWKDATX", "DTYEAR", "B8601DN", "B8601DT",
    "B8601DX", "B8601DZ", "B8601LX", "E8601DN", "E8601DT", "E8601DX", "E8601DZ", "E8601LX",
    "MDYAMPM",
];

const TIME_FORMATS: &[&str] = &["TIME", "TIMEAMPM", "TOD", "HHMM", "HOUR", "MMSS"];

fn corrupt(what: &str) -> ConvertError {
    ConvertError::read(format!("Malformed SAS dataset: {}", what))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    fn uint(self, bytes: &[u8]) -> u64 {
        let fold = |acc: u64, b: &u8| (acc << 8) | u64::from(*b);
        match self {
            ByteOrder::Big => bytes.iter().fold(0, fold),
            ByteOrder::Little => bytes.iter().rev().fold(0, fold),
        }
    }
}

/// Word size and byte order, fixed by the header
#[derive(Debug, Clone, Copy)]
struct Layout {
    u64: bool,
    order: ByteOrder,
    header_len: u64,
    page_len: usize,
    page_count: u64,
}

impl Layout {
    fn int_len(&self) -> usize {
        if self.u64 {
            8
        } else {
            4
        }
    }

    /// Offset of the page type field inside a page
    fn page_bit_offset(&self) -> usize {
        if self.u64 {
            32
        } else {
            16
        }
    }

    fn pointer_len(&self) -> usize {
        if self.u64 {
            24
        } else {
            12
        }
    }

    /// Unsigned integer of `len` bytes at `at`
    fn uint(&self, page: &[u8], at: usize, len: usize) -> Result<u64> {
        let bytes = at
            .checked_add(len)
            .and_then(|end| page.get(at..end))
            .ok_or_else(|| corrupt("field outside its page"))?;
        Ok(self.order.uint(bytes))
    }

    fn usize(&self, page: &[u8], at: usize, len: usize) -> Result<usize> {
        usize::try_from(self.uint(page, at, len)?).map_err(|_| corrupt("field out of range"))
    }

    fn f64(&self, cell: &[u8]) -> f64 {
        let mut buf = [0u8; 8];
        let width = cell.len().min(8);
        // Truncated doubles keep their most significant bytes
        match self.order {
            ByteOrder::Little => {
                buf[8 - width..].copy_from_slice(&cell[cell.len() - width..]);
                f64::from_le_bytes(buf)
            }
            ByteOrder::Big => {
                buf[..width].copy_from_slice(&cell[..width]);
                f64::from_be_bytes(buf)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageKind {
    Meta,
    Data,
    Mix,
    Other,
}

fn page_kind(raw: u16) -> PageKind {
    if raw & 0x9000 == 0x9000 {
        return PageKind::Other;
    }
    match raw & 0x0f00 {
        0x0000 | 0x0400 => PageKind::Meta,
        0x0100 => PageKind::Data,
        0x0200 => PageKind::Mix,
        _ => PageKind::Other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subheader {
    RowSize,
    ColumnSize,
    Counts,
    ColumnText,
    ColumnName,
    ColumnAttributes,
    FormatAndLabel,
    ColumnList,
}

impl Subheader {
    /// Match the four significant signature bytes in either byte order
    fn from_signature(sig: &[u8]) -> Option<Self> {
        let kind = match sig {
            [0xf7, 0xf7, 0xf7, 0xf7] => Subheader::RowSize,
            [0xf6, 0xf6, 0xf6, 0xf6] => Subheader::ColumnSize,
            [0x00, 0xfc, 0xff, 0xff] | [0xff, 0xff, 0xfc, 0x00] => Subheader::Counts,
            [0xfd, 0xff, 0xff, 0xff] | [0xff, 0xff, 0xff, 0xfd] => Subheader::ColumnText,
            [0xff, 0xff, 0xff, 0xff] => Subheader::ColumnName,
            [0xfc, 0xff, 0xff, 0xff] | [0xff, 0xff, 0xff, 0xfc] => Subheader::ColumnAttributes,
            [0xfe, 0xfb, 0xff, 0xff] | [0xff, 0xff, 0xfb, 0xfe] => Subheader::FormatAndLabel,
            [0xfe, 0xff, 0xff, 0xff] | [0xff, 0xff, 0xff, 0xfe] => Subheader::ColumnList,
            _ => return None,
        };
        Some(kind)
    }
}

/// Row compression announced in the first column text block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowCompression {
    None,
    Rle,
    Rdc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Number,
    Date,
    DateTime,
    Time,
    Text,
}

#[derive(Debug, Clone)]
struct Column {
    name: String,
    offset: usize,
    width: usize,
    kind: ColumnKind,
}

/// One subheader pointer of a page
#[derive(Debug, Clone, Copy)]
struct Pointer {
    offset: usize,
    len: usize,
    compression: u8,
    ptype: u8,
}

/// Metadata gathered from subheaders before any row is decoded
#[derive(Debug, Default)]
struct Metadata {
    row_length: usize,
    row_count: usize,
    mix_page_rows: usize,
    column_count: Option<usize>,
    text_blocks: Vec<Vec<u8>>,
    names: Vec<String>,
    attributes: Vec<(usize, usize, bool)>,
    formats: Vec<String>,
    compression: Option<RowCompression>,
}

impl Metadata {
    fn is_complete(&self) -> bool {
        self.row_length > 0
            && self.column_count.is_some_and(|n| {
                self.names.len() >= n && self.attributes.len() >= n && self.formats.len() >= n
            })
    }

    fn text(&self, index: usize, offset: usize, len: usize) -> Result<&[u8]> {
        let block = self
            .text_blocks
            .get(index)
            .ok_or_else(|| corrupt("text reference to a missing block"))?;
        block
            .get(offset..offset + len)
            .ok_or_else(|| corrupt("text reference past its block"))
    }
}

/// Open `.sas7bdat` file with its column layout decoded
pub struct SasReader {
    file: File,
    layout: Layout,
    columns: Vec<Column>,
    row_length: usize,
    row_count: usize,
    mix_page_rows: usize,
    compression: RowCompression,
}

impl SasReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path.as_ref())?;
        let mut head = vec![0u8; 288];
        file.read_exact(&mut head)
            .map_err(|_| ConvertError::read("Not a SAS dataset: file too short"))?;
        if head[..32] != MAGIC {
            return Err(ConvertError::read("Not a SAS dataset: bad magic number"));
        }

        let u64 = head[32] == b'3';
        let align1 = if head[35] == b'3' { 4 } else { 0 };
        let order = if head[37] == 0x01 {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        };
        let mut layout = Layout {
            u64,
            order,
            header_len: 0,
            page_len: 0,
            page_count: 0,
        };
        layout.header_len = layout.uint(&head, 196 + align1, 4)?;
        layout.page_len = layout.usize(&head, 200 + align1, 4)?;
        layout.page_count = layout.uint(&head, 204 + align1, layout.int_len())?;
        if layout.page_len < layout.page_bit_offset() + 8 {
            return Err(corrupt("page length too small"));
        }
        log::debug!(
            "SAS dataset: {}-bit {:?} endian, encoding code {}, {} page(s) of {} bytes",
            if u64 { 64 } else { 32 },
            order,
            head[70],
            layout.page_count,
            layout.page_len
        );

        let mut reader = SasReader {
            file,
            layout,
            columns: Vec::new(),
            row_length: 0,
            row_count: 0,
            mix_page_rows: 0,
            compression: RowCompression::None,
        };
        let meta = reader.read_metadata()?;
        reader.apply(meta)?;
        Ok(reader)
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    fn read_page(&mut self, index: u64) -> Result<Vec<u8>> {
        let at = self.layout.header_len + index * self.layout.page_len as u64;
        self.file.seek(SeekFrom::Start(at))?;
        let mut page = vec![0u8; self.layout.page_len];
        self.file
            .read_exact(&mut page)
            .map_err(|_| ConvertError::read(format!("SAS dataset is truncated at page {index}")))?;
        Ok(page)
    }

    fn page_header(&self, page: &[u8]) -> Result<(PageKind, usize, usize)> {
        let bit = self.layout.page_bit_offset();
        let kind = page_kind(self.layout.uint(page, bit, 2)? as u16);
        let blocks = self.layout.usize(page, bit + 2, 2)?;
        let subheaders = self.layout.usize(page, bit + 4, 2)?;
        Ok((kind, blocks, subheaders))
    }

    fn pointers(&self, page: &[u8], count: usize) -> Result<Vec<Pointer>> {
        let layout = &self.layout;
        let int_len = layout.int_len();
        let base = layout.page_bit_offset() + 8;
        (0..count)
            .map(|i| {
                let at = base + i * layout.pointer_len();
                Ok(Pointer {
                    offset: layout.usize(page, at, int_len)?,
                    len: layout.usize(page, at + int_len, int_len)?,
                    compression: layout.uint(page, at + 2 * int_len, 1)? as u8,
                    ptype: layout.uint(page, at + 2 * int_len + 1, 1)? as u8,
                })
            })
            .collect()
    }

    fn signature<'p>(&self, page: &'p [u8], offset: usize) -> Option<&'p [u8]> {
        let at = if self.layout.u64 && self.layout.order == ByteOrder::Big {
            offset + 4
        } else {
            offset
        };
        page.get(at..at + 4)
    }

    /// Scan leading meta and mix pages until every column is described
    fn read_metadata(&mut self) -> Result<Metadata> {
        let mut meta = Metadata::default();
        for index in 0..self.layout.page_count {
            let page = self.read_page(index)?;
            let (kind, _, count) = self.page_header(&page)?;
            if kind == PageKind::Data {
                break;
            }
            if matches!(kind, PageKind::Meta | PageKind::Mix) {
                for pointer in self.pointers(&page, count)? {
                    if pointer.len == 0 || pointer.compression == 1 {
                        continue;
                    }
                    if let Some(sub) = self
                        .signature(&page, pointer.offset)
                        .and_then(Subheader::from_signature)
                    {
                        self.process(&page, sub, pointer, &mut meta)?;
                    }
                }
            }
            if kind == PageKind::Mix || meta.is_complete() {
                break;
            }
        }
        Ok(meta)
    }

    fn process(
        &self,
        page: &[u8],
        sub: Subheader,
        ptr: Pointer,
        meta: &mut Metadata,
    ) -> Result<()> {
        let layout = &self.layout;
        let int_len = layout.int_len();
        let off = ptr.offset;
        match sub {
            Subheader::RowSize => {
                meta.row_length = layout.usize(page, off + 5 * int_len, int_len)?;
                meta.row_count = layout.usize(page, off + 6 * int_len, int_len)?;
                meta.mix_page_rows = layout.usize(page, off + 15 * int_len, int_len)?;
            }
            Subheader::ColumnSize => {
                meta.column_count = Some(layout.usize(page, off + int_len, int_len)?);
            }
            Subheader::ColumnText => {
                let size = layout.usize(page, off + int_len, 2)?;
                let block = page
                    .get(off + int_len..off + int_len + size)
                    .ok_or_else(|| corrupt("column text past its page"))?
                    .to_vec();
                if meta.text_blocks.is_empty() {
                    let found = |literal: &[u8]| block.windows(literal.len()).any(|w| w == literal);
                    meta.compression = Some(if found(RLE_LITERAL) {
                        RowCompression::Rle
                    } else if found(RDC_LITERAL) {
                        RowCompression::Rdc
                    } else {
                        RowCompression::None
                    });
                }
                meta.text_blocks.push(block);
            }
            Subheader::ColumnName => {
                let count = ptr.len.saturating_sub(2 * int_len + 12) / 8;
                for i in 0..count {
                    let at = off + int_len + 8 * (i + 1);
                    let block = layout.usize(page, at, 2)?;
                    let start = layout.usize(page, at + 2, 2)?;
                    let len = layout.usize(page, at + 4, 2)?;
                    let name = decode_text(trim_cell(meta.text(block, start, len)?));
                    meta.names.push(name);
                }
            }
            Subheader::ColumnAttributes => {
                let stride = int_len + 8;
                let count = ptr.len.saturating_sub(2 * int_len + 12) / stride;
                for i in 0..count {
                    let at = off + i * stride;
                    let offset = layout.usize(page, at + int_len + 8, int_len)?;
                    let width = layout.usize(page, at + 2 * int_len + 8, 4)?;
                    let numeric = layout.uint(page, at + 2 * int_len + 14, 1)? == 1;
                    meta.attributes.push((offset, width, numeric));
                }
            }
            Subheader::FormatAndLabel => {
                let base = off + 3 * int_len;
                let block = layout.usize(page, base + 22, 2)?;
                let start = layout.usize(page, base + 24, 2)?;
                let len = layout.usize(page, base + 26, 2)?;
                let block = block.min(meta.text_blocks.len().saturating_sub(1));
                let format = if len == 0 {
                    String::new()
                } else {
                    decode_text(trim_cell(meta.text(block, start, len)?))
                };
                meta.formats.push(format);
            }
            Subheader::Counts | Subheader::ColumnList => {}
        }
        Ok(())
    }

    fn apply(&mut self, meta: Metadata) -> Result<()> {
        if meta.row_length == 0 {
            return Err(corrupt("no row size subheader"));
        }
        let count = meta.column_count.unwrap_or(meta.attributes.len());
        if meta.attributes.len() < count || meta.names.len() < count {
            return Err(corrupt("column metadata is incomplete"));
        }

        let mut columns = Vec::with_capacity(count);
        for i in 0..count {
            let (offset, width, numeric) = meta.attributes[i];
            if offset + width > meta.row_length {
                return Err(corrupt("column lies outside the row"));
            }
            let format = meta.formats.get(i).map(String::as_str).unwrap_or("");
            let kind = if !numeric {
                ColumnKind::Text
            } else if width > 8 {
                return Err(corrupt("numeric column wider than 8 bytes"));
            } else {
                numeric_kind(format)
            };
            columns.push(Column {
                name: meta.names[i].clone(),
                offset,
                width,
                kind,
            });
        }

        self.columns = columns;
        self.row_length = meta.row_length;
        self.row_count = meta.row_count;
        self.mix_page_rows = meta.mix_page_rows;
        self.compression = meta.compression.unwrap_or(RowCompression::None);
        log::debug!(
            "SAS dataset has {} column(s), {} row(s) of {} bytes, {:?} compression",
            self.columns.len(),
            self.row_count,
            self.row_length,
            self.compression
        );
        Ok(())
    }

    /// Raw rows stored on one page, in file order
    fn page_rows(&self, page: &[u8]) -> Result<Vec<Vec<u8>>> {
        let (kind, blocks, count) = self.page_header(page)?;
        let mut rows = Vec::new();
        let bit = self.layout.page_bit_offset();
        let fit = |start: usize| page.len().saturating_sub(start) / self.row_length;

        match kind {
            PageKind::Meta | PageKind::Mix => {
                for pointer in self.pointers(page, count)? {
                    if let Some(row) = self.row_subheader(page, pointer)? {
                        rows.push(row);
                    }
                }
                if kind == PageKind::Mix {
                    let mut start = bit + 8 + count * self.layout.pointer_len();
                    start += start % 8;
                    let n = self.mix_page_rows.min(fit(start));
                    for i in 0..n {
                        let at = start + i * self.row_length;
                        rows.push(page[at..at + self.row_length].to_vec());
                    }
                }
            }
            PageKind::Data => {
                let start = bit + 8;
                for i in 0..blocks.min(fit(start)) {
                    let at = start + i * self.row_length;
                    rows.push(page[at..at + self.row_length].to_vec());
                }
            }
            PageKind::Other => {}
        }
        Ok(rows)
    }

    /// Row stored as a subheader of a compressed dataset
    fn row_subheader(&self, page: &[u8], pointer: Pointer) -> Result<Option<Vec<u8>>> {
        if self.compression == RowCompression::None
            || pointer.len == 0
            || pointer.ptype != 1
            || !matches!(pointer.compression, 0 | 4)
        {
            return Ok(None);
        }
        if self
            .signature(page, pointer.offset)
            .and_then(Subheader::from_signature)
            .is_some()
        {
            return Ok(None);
        }
        let stored = page
            .get(pointer.offset..pointer.offset + pointer.len)
            .ok_or_else(|| corrupt("row subheader past its page"))?;
        if pointer.len >= self.row_length {
            return Ok(Some(stored[..self.row_length].to_vec()));
        }
        let row = match self.compression {
            RowCompression::Rle => rle_decompress(stored, self.row_length)?,
            _ => rdc_decompress(stored, self.row_length)?,
        };
        Ok(Some(row))
    }

    fn schema(&self, keep_bytes: bool) -> SchemaRef {
        let fields: Vec<Field> = self
            .columns
            .iter()
            .map(|c| {
                let data_type = match c.kind {
                    ColumnKind::Number => DataType::Float64,
                    ColumnKind::Date => DataType::Date32,
                    ColumnKind::DateTime => DataType::Timestamp(TimeUnit::Millisecond, None),
                    ColumnKind::Time => DataType::Time64(TimeUnit::Microsecond),
                    ColumnKind::Text if keep_bytes => DataType::Binary,
                    ColumnKind::Text => DataType::Utf8,
                };
                Field::new(&c.name, data_type, true)
            })
            .collect();
        Arc::new(Schema::new(fields))
    }

    /// Lazily decode batches of at most `batch_rows` rows
    pub fn batches(
        self,
        keep_bytes: bool,
        batch_rows: usize,
        limit: Option<usize>,
    ) -> BatchStream {
        let schema = self.schema(keep_bytes);
        let remaining = limit.map_or(self.row_count, |l| l.min(self.row_count));
        let batches = SasBatches {
            schema: schema.clone(),
            reader: self,
            keep_bytes,
            batch_rows: batch_rows.max(1),
            remaining,
            next_page: 0,
            pending: std::collections::VecDeque::new(),
            done: false,
        };
        BatchStream::new(schema, batches)
    }
}

struct SasBatches {
    reader: SasReader,
    schema: SchemaRef,
    keep_bytes: bool,
    batch_rows: usize,
    remaining: usize,
    next_page: u64,
    pending: std::collections::VecDeque<Vec<u8>>,
    done: bool,
}

impl SasBatches {
    fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        let want = self.batch_rows.min(self.remaining);
        let mut rows = Vec::with_capacity(want);
        while rows.len() < want {
            if let Some(row) = self.pending.pop_front() {
                rows.push(row);
                continue;
            }
            if self.next_page >= self.reader.layout.page_count {
                break;
            }
            let page = self.reader.read_page(self.next_page)?;
            self.next_page += 1;
            self.pending.extend(self.reader.page_rows(&page)?);
        }

        if rows.len() < want {
            log::warn!(
                "SAS dataset announces {} more row(s) than its pages hold",
                want - rows.len()
            );
            self.remaining = 0;
        } else {
            self.remaining -= rows.len();
        }
        if rows.is_empty() {
            return Ok(None);
        }
        let reader = &self.reader;
        decode_rows(&reader.columns, &self.schema, &rows, reader.layout, self.keep_bytes).map(Some)
    }
}

impl Iterator for SasBatches {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.remaining == 0 {
            return None;
        }
        match self.next_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn decode_rows(
    columns: &[Column],
    schema: &SchemaRef,
    rows: &[Vec<u8>],
    layout: Layout,
    keep_bytes: bool,
) -> Result<RecordBatch> {
    let arrays: Vec<ArrayRef> = columns
        .iter()
        .map(|column| {
            let cells = rows.iter().map(|row| &row[column.offset..column.offset + column.width]);
            let numbers = cells.clone().map(|cell| {
                let v = layout.f64(cell);
                (!v.is_nan()).then_some(v)
            });
            match column.kind {
                ColumnKind::Number => Arc::new(numbers.collect::<Float64Array>()) as ArrayRef,
                ColumnKind::Date => Arc::new(
                    numbers
                        .map(|v| v.map(|v| (v.floor() as i64 - SAS_EPOCH_DAYS) as i32))
                        .collect::<Date32Array>(),
                ),
                ColumnKind::DateTime => Arc::new(
                    numbers
                        .map(|v| v.map(|v| ((v - SAS_EPOCH_SECONDS as f64) * 1000.0).round()))
                        .map(|v| v.map(|v| v as i64))
                        .collect::<TimestampMillisecondArray>(),
                ),
                ColumnKind::Time => Arc::new(
                    numbers
                        .map(|v| v.map(|v| (v * 1_000_000.0).round() as i64))
                        .collect::<Time64MicrosecondArray>(),
                ),
                ColumnKind::Text => {
                    let values = cells.map(|cell| Some(trim_cell(cell)).filter(|v| !v.is_empty()));
                    if keep_bytes {
                        Arc::new(values.collect::<BinaryArray>()) as ArrayRef
                    } else {
                        Arc::new(
                            values
                                .map(|v| v.map(decode_text))
                                .collect::<StringArray>(),
                        )
                    }
                }
            }
        })
        .collect();
    let options = RecordBatchOptions::new().with_row_count(Some(rows.len()));
    Ok(RecordBatch::try_new_with_options(
        schema.clone(),
        arrays,
        &options,
    )?)
}

fn numeric_kind(format: &str) -> ColumnKind {
    let upper = format.trim().to_ascii_uppercase();
    let is = |names: &[&str]| names.contains(&upper.as_str());
    if is(DATE_FORMATS) {
        ColumnKind::Date
    } else if is(DATETIME_FORMATS) {
        ColumnKind::DateTime
    } else if is(TIME_FORMATS) {
        ColumnKind::Time
    } else {
        ColumnKind::Number
    }
}

/// Character cells are padded with blanks or NULs
fn trim_cell(cell: &[u8]) -> &[u8] {
    let end = cell
        .iter()
        .rposition(|b| *b != b' ' && *b != 0)
        .map_or(0, |i| i + 1);
    &cell[..end]
}

/// UTF-8 when valid, otherwise Latin-1
fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|b| char::from(*b)).collect(),
    }
}

/// Expand a `SASYZCRL` (run-length) compressed row
fn rle_decompress(input: &[u8], row_length: usize) -> Result<Vec<u8>> {
    let bad = || corrupt("RLE row overruns its input");
    let byte = |at: usize| input.get(at).copied().map(usize::from).ok_or_else(bad);
    let mut out = Vec::with_capacity(row_length);
    let mut pos = 0;

    while pos < input.len() {
        let control = input[pos] & 0xf0;
        let low = usize::from(input[pos] & 0x0f);
        pos += 1;
        let (copy, fill) = match control {
            0x00 => {
                let n = byte(pos)? + 64 + low * 256;
                pos += 1;
                (n, None)
            }
            0x10 => {
                let n = byte(pos)? + 64 + low * 256 + 4096;
                pos += 1;
                (n, None)
            }
            0x20 => (low + 96, None),
            0x40 => {
                let n = byte(pos)? + 18 + low * 256;
                let value = byte(pos + 1)? as u8;
                pos += 2;
                (0, Some((value, n)))
            }
            0x60 => {
                let n = byte(pos)? + 17 + low * 256;
                pos += 1;
                (0, Some((b' ', n)))
            }
            0x70 => {
                let n = byte(pos)? + 17 + low * 256;
                pos += 1;
                (0, Some((0, n)))
            }
            0x80 => (low + 1, None),
            0x90 => (low + 17, None),
            0xa0 => (low + 33, None),
            0xb0 => (low + 49, None),
            0xc0 => {
                let value = byte(pos)? as u8;
                pos += 1;
                (0, Some((value, low + 3)))
            }
            0xd0 => (0, Some((b'@', low + 2))),
            0xe0 => (0, Some((b' ', low + 2))),
            0xf0 => (0, Some((0, low + 2))),
            other => {
                return Err(corrupt(&format!("unknown RLE command {:#04x}", other)));
            }
        };
        if copy > 0 {
            let literal = input.get(pos..pos + copy).ok_or_else(bad)?;
            out.extend_from_slice(literal);
            pos += copy;
        }
        if let Some((value, n)) = fill {
            out.resize(out.len() + n, value);
        }
    }

    check_length(out, row_length)
}

/// Expand a `SASYZCR2` (Ross data compression) row
fn rdc_decompress(input: &[u8], row_length: usize) -> Result<Vec<u8>> {
    let bad = || corrupt("RDC row overruns its input");
    let byte = |at: usize| input.get(at).copied().map(usize::from).ok_or_else(bad);
    let mut out: Vec<u8> = Vec::with_capacity(row_length);
    let mut pos = 0;
    let mut control_bits = 0;
    let mut control_mask = 0u16;

    while pos < input.len() {
        control_mask >>= 1;
        if control_mask == 0 {
            control_bits = (byte(pos)? << 8) | byte(pos + 1)?;
            pos += 2;
            control_mask = 0x8000;
        }
        if control_bits & usize::from(control_mask) == 0 {
            out.push(byte(pos)? as u8);
            pos += 1;
            continue;
        }

        let command = byte(pos)? >> 4;
        let count = byte(pos)? & 0x0f;
        pos += 1;
        match command {
            0 => {
                let value = byte(pos)? as u8;
                pos += 1;
                out.resize(out.len() + count + 3, value);
            }
            1 => {
                let n = count + (byte(pos)? << 4) + 19;
                let value = byte(pos + 1)? as u8;
                pos += 2;
                out.resize(out.len() + n, value);
            }
            _ => {
                let distance = count + 3 + (byte(pos)? << 4);
                pos += 1;
                let n = if command == 2 {
                    let n = byte(pos)? + 16;
                    pos += 1;
                    n
                } else {
                    command
                };
                let start = out
                    .len()
                    .checked_sub(distance)
                    .ok_or_else(|| corrupt("RDC back reference before row start"))?;
                for i in 0..n {
                    out.push(out[start + i]);
                }
            }
        }
    }

    check_length(out, row_length)
}

fn check_length(out: Vec<u8>, row_length: usize) -> Result<Vec<u8>> {
    if out.len() != row_length {
        return Err(corrupt(&format!(
            "row decompressed to {} bytes, expected {}",
            out.len(),
            row_length
        )));
    }
    Ok(out)
}

pub fn read_sas(path: &Path, options: &ReadOptions) -> Result<BatchStream> {
    let reader = SasReader::open(path)?;
    let batch_rows = options.chunk_size.unwrap_or(BATCH_ROWS);
    Ok(reader
        .batches(options.keep_bytes, batch_rows, options.row_limit)
        .chunked(options.chunk_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, AsArray};
    use arrow::datatypes::{Date32Type, Float64Type, TimestampMillisecondType};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const PAGE_LEN: usize = 4096;
    const HEADER_LEN: usize = 1024;

    /// Column of the test dataset: name, byte width, numeric flag, format
    type Spec = (&'static str, usize, bool, &'static str);

    const COLUMNS: [Spec; 4] = [
        ("id", 8, true, ""),
        ("name", 8, false, "$CHAR"),
        ("born", 8, true, "YYMMDD"),
        ("score", 4, true, ""),
    ];

    /// Minimal `.sas7bdat` writer: one meta page, then one data page unless
    /// rows are stored compressed on the meta page
    struct SasBuilder {
        u64: bool,
        big: bool,
        compressed: bool,
    }

    impl SasBuilder {
        fn int_len(&self) -> usize {
            if self.u64 {
                8
            } else {
                4
            }
        }

        fn bit(&self) -> usize {
            if self.u64 {
                32
            } else {
                16
            }
        }

        fn put(&self, buf: &mut [u8], at: usize, value: u64, len: usize) {
            let bytes = value.to_le_bytes();
            for i in 0..len {
                let b = bytes[i];
                if self.big {
                    buf[at + len - 1 - i] = b;
                } else {
                    buf[at + i] = b;
                }
            }
        }

        fn signature(&self, buf: &mut [u8], at: usize, little: [u8; 4]) {
            let mut sig = little;
            if self.big {
                sig.reverse();
            }
            let at = if self.u64 && self.big { at + 4 } else { at };
            buf[at..at + 4].copy_from_slice(&sig);
        }

        fn row_length() -> usize {
            COLUMNS.iter().map(|c| c.1).sum()
        }

        fn number(&self, value: f64, width: usize) -> Vec<u8> {
            if self.big {
                value.to_be_bytes()[..width].to_vec()
            } else {
                value.to_le_bytes()[8 - width..].to_vec()
            }
        }

        fn row(&self, id: f64, name: &str, born: f64, score: f64) -> Vec<u8> {
            let mut row = self.number(id, 8);
            let mut text = name.as_bytes().to_vec();
            text.resize(8, b' ');
            row.extend(text);
            row.extend(self.number(born, 8));
            row.extend(self.number(score, 4));
            row
        }

        /// Short byte fills for runs of three or more, literal copies otherwise
        fn rle(row: &[u8]) -> Vec<u8> {
            fn flush(out: &mut Vec<u8>, literal: &mut Vec<u8>) {
                for chunk in literal.chunks(16) {
                    out.push(0x80 | (chunk.len() as u8 - 1));
                    out.extend_from_slice(chunk);
                }
                literal.clear();
            }

            let mut out = Vec::new();
            let mut literal = Vec::new();
            let mut i = 0;
            while i < row.len() {
                let b = row[i];
                let mut run = 1;
                while i + run < row.len() && row[i + run] == b && run < 18 {
                    run += 1;
                }
                if run >= 3 {
                    flush(&mut out, &mut literal);
                    out.push(0xc0 | (run - 3) as u8);
                    out.push(b);
                    i += run;
                } else {
                    literal.push(b);
                    i += 1;
                }
            }
            flush(&mut out, &mut literal);
            assert!(out.len() < row.len(), "test row does not compress");
            out
        }

        fn build(&self, rows: &[Vec<u8>]) -> Vec<u8> {
            let int_len = self.int_len();
            let page_count = if self.compressed { 1 } else { 2 };
            let mut file = vec![0u8; HEADER_LEN + page_count * PAGE_LEN];

            file[..32].copy_from_slice(&MAGIC);
            file[32] = if self.u64 { b'3' } else { b'2' };
            file[35] = b'2';
            file[37] = if self.big { 0x00 } else { 0x01 };
            file[39] = b'1';
            file[70] = 20;
            file[92..96].copy_from_slice(b"TEST");
            file[156..164].copy_from_slice(b"DATA    ");
            self.put(&mut file, 196, HEADER_LEN as u64, 4);
            self.put(&mut file, 200, PAGE_LEN as u64, 4);
            self.put(&mut file, 204, page_count as u64, int_len);

            // Column text: names and formats after a 16-byte preamble
            let mut block = vec![0u8; 16];
            if self.compressed {
                block[8..16].copy_from_slice(RLE_LITERAL);
            }
            let mut names = Vec::new();
            let mut formats = Vec::new();
            for (name, _, _, format) in COLUMNS {
                names.push((block.len(), name.len()));
                block.extend_from_slice(name.as_bytes());
                formats.push((block.len(), format.len()));
                block.extend_from_slice(format.as_bytes());
            }
            while block.len() % 4 != 0 {
                block.push(0);
            }
            let size = block.len() as u64;
            if self.big {
                block[..2].copy_from_slice(&(size as u16).to_be_bytes());
            } else {
                block[..2].copy_from_slice(&(size as u16).to_le_bytes());
            }

            let n = COLUMNS.len();
            let mut subheaders: Vec<(Vec<u8>, u8, u8)> = Vec::new();

            let mut row_size = vec![0u8; if self.u64 { 808 } else { 480 }];
            self.signature(&mut row_size, 0, [0xf7; 4]);
            self.put(&mut row_size, 5 * int_len, Self::row_length() as u64, int_len);
            self.put(&mut row_size, 6 * int_len, rows.len() as u64, int_len);
            self.put(&mut row_size, 15 * int_len, 0, int_len);
            subheaders.push((row_size, 0, 0));

            let mut column_size = vec![0u8; 3 * int_len];
            self.signature(&mut column_size, 0, [0xf6; 4]);
            self.put(&mut column_size, int_len, n as u64, int_len);
            subheaders.push((column_size, 0, 0));

            let mut text = vec![0u8; int_len];
            self.signature(&mut text, 0, [0xfd, 0xff, 0xff, 0xff]);
            text.extend_from_slice(&block);
            subheaders.push((text, 0, 0));

            let mut name_sub = vec![0u8; 2 * int_len + 12 + 8 * n];
            self.signature(&mut name_sub, 0, [0xff; 4]);
            for (i, (start, len)) in names.iter().enumerate() {
                let at = int_len + 8 * (i + 1);
                self.put(&mut name_sub, at, 0, 2);
                self.put(&mut name_sub, at + 2, *start as u64, 2);
                self.put(&mut name_sub, at + 4, *len as u64, 2);
            }
            subheaders.push((name_sub, 0, 0));

            let stride = int_len + 8;
            let mut attrs = vec![0u8; 2 * int_len + 12 + n * stride];
            self.signature(&mut attrs, 0, [0xfc, 0xff, 0xff, 0xff]);
            let mut offset = 0;
            for (i, (_, width, numeric, _)) in COLUMNS.iter().enumerate() {
                let at = i * stride;
                self.put(&mut attrs, at + int_len + 8, offset as u64, int_len);
                self.put(&mut attrs, at + 2 * int_len + 8, *width as u64, 4);
                attrs[at + 2 * int_len + 14] = if *numeric { 1 } else { 2 };
                offset += width;
            }
            subheaders.push((attrs, 0, 0));

            for (start, len) in &formats {
                let mut format = vec![0u8; 3 * int_len + 40];
                self.signature(&mut format, 0, [0xfe, 0xfb, 0xff, 0xff]);
                self.put(&mut format, 3 * int_len + 22, 0, 2);
                self.put(&mut format, 3 * int_len + 24, *start as u64, 2);
                self.put(&mut format, 3 * int_len + 26, *len as u64, 2);
                subheaders.push((format, 0, 0));
            }

            if self.compressed {
                for row in rows {
                    subheaders.push((Self::rle(row), 4, 1));
                }
            }

            // Meta page: pointers first, subheader bodies after them
            let meta_at = HEADER_LEN;
            let pointer_len = if self.u64 { 24 } else { 12 };
            let bit = self.bit();
            let page = &mut file[meta_at..meta_at + PAGE_LEN];
            self.put(page, bit, 0, 2);
            self.put(page, bit + 4, subheaders.len() as u64, 2);
            let mut body = bit + 8 + subheaders.len() * pointer_len;
            body += (8 - body % 8) % 8;
            for (i, (content, compression, ptype)) in subheaders.iter().enumerate() {
                let at = bit + 8 + i * pointer_len;
                self.put(page, at, body as u64, int_len);
                self.put(page, at + int_len, content.len() as u64, int_len);
                page[at + 2 * int_len] = *compression;
                page[at + 2 * int_len + 1] = *ptype;
                page[body..body + content.len()].copy_from_slice(content);
                body += content.len();
                body += (8 - body % 8) % 8;
            }

            if !self.compressed {
                let data_at = HEADER_LEN + PAGE_LEN;
                let page = &mut file[data_at..data_at + PAGE_LEN];
                self.put(page, bit, 256, 2);
                self.put(page, bit + 2, rows.len() as u64, 2);
                let mut at = bit + 8;
                for row in rows {
                    page[at..at + row.len()].copy_from_slice(row);
                    at += row.len();
                }
            }
            file
        }
    }

    /// 2024-01-02 in SAS days
    const BORN: f64 = 23_377.0;

    fn sample_rows(builder: &SasBuilder) -> Vec<Vec<u8>> {
        vec![
            builder.row(1.0, "Alice", BORN, 1.5),
            builder.row(2.0, "Bob", f64::NAN, 2.25),
            builder.row(3.0, "", 0.0, f64::NAN),
        ]
    }

    fn write(bytes: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    fn check_sample(batch: &RecordBatch) {
        assert_eq!(batch.num_rows(), 3);
        let ids = batch.column(0).as_primitive::<Float64Type>();
        assert_eq!(ids.values().to_vec(), vec![1.0, 2.0, 3.0]);

        let names = batch.column(1).as_string::<i32>();
        assert_eq!(names.value(0), "Alice");
        assert_eq!(names.value(1), "Bob");
        assert!(names.is_null(2));

        assert_eq!(batch.schema().field(2).data_type(), &DataType::Date32);
        let born = batch.column(2).as_primitive::<Date32Type>();
        assert_eq!(born.value(0), 19_724);
        assert!(born.is_null(1));
        assert_eq!(born.value(2), -3653);

        let score = batch.column(3).as_primitive::<Float64Type>();
        assert_eq!(score.value(0), 1.5);
        assert_eq!(score.value(1), 2.25);
        assert!(score.is_null(2));
    }

    #[test]
    fn test_every_layout() -> Result<()> {
        for (u64, big) in [(false, false), (true, false), (false, true), (true, true)] {
            let builder = SasBuilder {
                u64,
                big,
                compressed: false,
            };
            let file = write(&builder.build(&sample_rows(&builder)));
            let reader = SasReader::open(file.path())?;
            assert_eq!(reader.column_names(), vec!["id", "name", "born", "score"]);
            assert_eq!(reader.row_count(), 3);
            check_sample(&reader.batches(false, 100, None).collect_batch()?);
        }
        Ok(())
    }

    #[test]
    fn test_compressed_rows() -> Result<()> {
        let builder = SasBuilder {
            u64: true,
            big: false,
            compressed: true,
        };
        let file = write(&builder.build(&sample_rows(&builder)));
        let batch = read_sas(file.path(), &ReadOptions::default())?.collect_batch()?;
        check_sample(&batch);
        Ok(())
    }

    #[test]
    fn test_chunks_and_keep_bytes() -> Result<()> {
        let builder = SasBuilder {
            u64: false,
            big: false,
            compressed: false,
        };
        let file = write(&builder.build(&sample_rows(&builder)));
        let options = ReadOptions {
            chunk_size: Some(2),
            keep_bytes: true,
            ..ReadOptions::default()
        };
        let batches: Vec<_> = read_sas(file.path(), &options)?.collect::<Result<_>>()?;
        assert_eq!(batches.iter().map(|b| b.num_rows()).collect::<Vec<_>>(), vec![2, 1]);
        let names = batches[0].column(1).as_binary::<i32>();
        assert_eq!(names.value(0), b"Alice");

        let limited = ReadOptions {
            row_limit: Some(1),
            ..ReadOptions::default()
        };
        assert_eq!(read_sas(file.path(), &limited)?.collect_batch()?.num_rows(), 1);
        Ok(())
    }

    #[test]
    fn test_rle_commands() -> Result<()> {
        // copy 2, fill 4 x 'z', 3 blanks, 2 NULs, 2 '@'
        let input = [0x81, b'a', b'b', 0xc1, b'z', 0xe1, 0xf0, 0xd0];
        assert_eq!(rle_decompress(&input, 13)?, b"abzzzz   \0\0@@".to_vec());
        // 17 + 1 blanks
        assert_eq!(rle_decompress(&[0x60, 0x01], 18)?, vec![b' '; 18]);
        assert!(rle_decompress(&[0x83, b'a'], 4).is_err());
        assert!(rle_decompress(&[0x81, b'a', b'b'], 3).is_err());
        Ok(())
    }

    #[test]
    fn test_rdc_commands() -> Result<()> {
        // control word: literal, literal, short run, pattern copy
        let input = [
            0b0011_0000, 0x00, // control bits for the next four items
            b'a', b'b', // two literals
            0x01, b'x', // run of 1 + 3 'x'
            0x33, 0x00, // copy 3 bytes from 6 back
        ];
        assert_eq!(rdc_decompress(&input, 9)?, b"abxxxxabx".to_vec());
        assert!(rdc_decompress(&[0x80, 0x00, 0x3f, 0x00], 3).is_err());
        Ok(())
    }

    #[test]
    fn test_formats() {
        assert_eq!(numeric_kind("mmddyy"), ColumnKind::Date);
        assert_eq!(numeric_kind("DATETIME"), ColumnKind::DateTime);
        assert_eq!(numeric_kind("TIME"), ColumnKind::Time);
        assert_eq!(numeric_kind("BEST"), ColumnKind::Number);
        assert_eq!(numeric_kind(""), ColumnKind::Number);
    }

    #[test]
    fn test_datetime_values() {
        let layout = Layout {
            u64: false,
            order: ByteOrder::Little,
            header_len: 0,
            page_len: 0,
            page_count: 0,
        };
        let columns = vec![Column {
            name: "at".to_string(),
            offset: 0,
            width: 8,
            kind: ColumnKind::DateTime,
        }];
        let schema = Arc::new(Schema::new(vec![Field::new(
            "at",
            DataType::Timestamp(TimeUnit::Millisecond, None),
            true,
        )]));
        // 1970-01-01 00:00:01.5 in SAS seconds
        let rows = vec![(SAS_EPOCH_SECONDS as f64 + 1.5).to_le_bytes().to_vec()];
        let batch = decode_rows(&columns, &schema, &rows, layout, false).unwrap();
        assert_eq!(batch.column(0).as_primitive::<TimestampMillisecondType>().value(0), 1500);
    }

    #[test]
    fn test_rejects_other_files() {
        let file = write(&[0u8; 512]);
        assert!(matches!(
            SasReader::open(file.path()),
            Err(ConvertError::Read { .. })
        ));
    }
}
