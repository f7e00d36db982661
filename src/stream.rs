//! Lazy sequences of record batches and the row selector
//!
//! Every reader returns a [`BatchStream`]: a schema known up front plus an
//! iterator of batches. A whole-file read is simply a stream of length one.

use crate::error::Result;
use crate::request::RowRange;
use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

type BatchIter = Box<dyn Iterator<Item = Result<RecordBatch>>>;

/// Schema plus a lazy, finite sequence of batches
pub struct BatchStream {
    schema: SchemaRef,
    batches: BatchIter,
}

impl BatchStream {
    pub fn new<I>(schema: SchemaRef, batches: I) -> Self
    where
        I: Iterator<Item = Result<RecordBatch>> + 'static,
    {
        BatchStream {
            schema,
            batches: Box::new(batches),
        }
    }

    /// Stream holding exactly one batch
    pub fn once(batch: RecordBatch) -> Self {
        let schema = batch.schema();
        Self::new(schema, std::iter::once(Ok(batch)))
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// Reshape to the requested chunking
    ///
    /// `Some(n)` splits batches larger than `n` rows; `None` merges the
    /// whole input into a single batch on first pull (an empty input yields
    /// one empty batch).
    pub fn chunked(self, chunk_size: Option<usize>) -> Self {
        let schema = self.schema.clone();
        match chunk_size {
            Some(size) => Self::new(
                schema,
                SplitBatches {
                    inner: self.batches,
                    size: size.max(1),
                    pending: None,
                },
            ),
            None => Self::new(
                schema.clone(),
                WholeBatch {
                    inner: Some(self.batches),
                    schema,
                },
            ),
        }
    }

    /// Keep only the rows inside `range`, stopping the source early
    pub fn select(self, range: RowRange) -> Self {
        let schema = self.schema.clone();
        let mut selector = RowSelector::new(range);
        let mut inner = self.batches;
        let iter = std::iter::from_fn(move || loop {
            if selector.is_exhausted() {
                return None;
            }
            match inner.next()? {
                Ok(batch) => {
                    if let Some(selected) = selector.select(&batch) {
                        return Some(Ok(selected));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        });
        Self::new(schema, iter)
    }

    /// Call `f` with every batch as it is pulled, before later adapters see it
    pub fn inspect<F>(self, mut f: F) -> Self
    where
        F: FnMut(&RecordBatch) + 'static,
    {
        let schema = self.schema.clone();
        let iter = self.batches.inspect(move |item| {
            if let Ok(batch) = item {
                f(batch);
            }
        });
        Self::new(schema, iter)
    }

    /// Drain the stream into one batch
    pub fn collect_batch(self) -> Result<RecordBatch> {
        let schema = self.schema.clone();
        let batches = self.collect::<Result<Vec<_>>>()?;
        Ok(concat_batches(&schema, &batches)?)
    }
}

impl Iterator for BatchStream {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.batches.next()
    }
}

struct SplitBatches {
    inner: BatchIter,
    size: usize,
    pending: Option<(RecordBatch, usize)>,
}

impl Iterator for SplitBatches {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((batch, offset)) = self.pending.take() {
                let len = (batch.num_rows() - offset).min(self.size);
                let slice = batch.slice(offset, len);
                if offset + len < batch.num_rows() {
                    self.pending = Some((batch, offset + len));
                }
                return Some(Ok(slice));
            }

            match self.inner.next()? {
                Ok(batch) if batch.num_rows() > self.size => self.pending = Some((batch, 0)),
                Ok(batch) if batch.num_rows() == 0 => continue,
                other => return Some(other),
            }
        }
    }
}

struct WholeBatch {
    inner: Option<BatchIter>,
    schema: SchemaRef,
}

impl Iterator for WholeBatch {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let inner = self.inner.take()?;
        let batches = match inner.collect::<Result<Vec<_>>>() {
            Ok(batches) => batches,
            Err(e) => return Some(Err(e)),
        };
        Some(concat_batches(&self.schema, &batches).map_err(Into::into))
    }
}

/// Tracks a running row offset across batches and slices out `[start, end)`
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use arrow::array::Int64Array;
/// use arrow::record_batch::RecordBatch;
/// use tabconv::request::RowRange;
/// use tabconv::stream::RowSelector;
///
/// let batch = RecordBatch::try_from_iter([(
///     "a",
///     Arc::new(Int64Array::from(vec![1, 2, 3])) as _,
/// )]).unwrap();
///
/// let mut selector = RowSelector::new(RowRange::head(2));
/// assert_eq!(selector.select(&batch).unwrap().num_rows(), 2);
/// assert!(selector.is_exhausted());
/// ```
#[derive(Debug, Clone)]
pub struct RowSelector {
    range: RowRange,
    offset: usize,
}

impl RowSelector {
    pub fn new(range: RowRange) -> Self {
        RowSelector { range, offset: 0 }
    }

    /// Rows of `batch` that fall inside the range, or `None` if there are none
    pub fn select(&mut self, batch: &RecordBatch) -> Option<RecordBatch> {
        let batch_start = self.offset;
        let batch_end = batch_start + batch.num_rows();
        self.offset = batch_end;

        let lo = self.range.start.max(batch_start);
        let hi = self.range.end.map_or(batch_end, |end| end.min(batch_end));
        if lo >= hi {
            return None;
        }

        if lo == batch_start && hi == batch_end {
            return Some(batch.clone());
        }
        Some(batch.slice(lo - batch_start, hi - lo))
    }

    /// True once no later batch can contribute rows
    pub fn is_exhausted(&self) -> bool {
        self.range.end.is_some_and(|end| self.offset >= end)
    }
}
