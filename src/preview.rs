//! ASCII previews of the rows in flight when a conversion fails

use arrow::record_batch::RecordBatch;
use arrow::util::pretty::pretty_format_batches;

/// Render at most `max_rows` leading rows of `batch` as a table
///
/// Returns `None` when there is nothing worth showing: no rows, no columns,
/// a zero row limit, or a batch the formatter cannot render.
pub fn render_preview(batch: &RecordBatch, max_rows: usize) -> Option<String> {
    if max_rows == 0 || batch.num_rows() == 0 || batch.num_columns() == 0 {
        return None;
    }
    let shown = batch.num_rows().min(max_rows);
    let head = batch.slice(0, shown);
    match pretty_format_batches(&[head]) {
        Ok(table) => {
            let mut text = table.to_string();
            if batch.num_rows() > shown {
                text.push_str(&format!("\n({} of {} rows shown)", shown, batch.num_rows()));
            }
            Some(text)
        }
        Err(e) => {
            log::debug!("Could not render preview: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Int64Array, StringArray};
    use std::sync::Arc;

    fn batch() -> RecordBatch {
        RecordBatch::try_from_iter([
            (
                "id",
                Arc::new(Int64Array::from(vec![1, 2, 3, 4])) as ArrayRef,
            ),
            (
                "name",
                Arc::new(StringArray::from(vec!["ann", "bob", "cy", "dee"])) as ArrayRef,
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_preview_is_truncated() {
        let text = render_preview(&batch(), 2).unwrap();
        assert!(text.contains("| id | name |"));
        assert!(text.contains("bob"));
        assert!(!text.contains("dee"));
        assert!(text.ends_with("(2 of 4 rows shown)"));
    }

    #[test]
    fn test_nothing_to_show() {
        assert!(render_preview(&batch(), 0).is_none());
        assert!(render_preview(&batch().slice(0, 0), 5).is_none());
    }
}
