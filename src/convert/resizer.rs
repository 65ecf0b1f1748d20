use crate::convert::parser::ParsedBatch;
use crate::convert::serializer::serialized_size;
use crate::convert::ConvertError;
use crate::source::SeqRange;
use arrow::array::RecordBatch;

/// Splits record batches so every piece fits the IPC message ceiling once
/// serialized.
///
/// The whole batch is measured once; recursion halves at the row midpoint
/// and scales the estimate by row fraction, since sliced batches share
/// their parent's buffers and report the parent's memory size.
pub struct Resizer {
    max_ipc_size: usize,
    budget: usize,
}

impl Resizer {
    pub fn new(max_ipc_size: usize, size_hint: f64) -> Self {
        let budget = (max_ipc_size as f64 * size_hint) as usize;
        Self {
            max_ipc_size,
            budget: budget.max(1),
        }
    }

    pub fn resize(&self, parsed: ParsedBatch) -> Result<Vec<ParsedBatch>, ConvertError> {
        let rows = parsed.batch.num_rows();
        if rows == 0 {
            return Ok(Vec::new());
        }
        let total = parsed.batch.get_array_memory_size();
        let bytes_per_row = total as f64 / rows as f64;

        let mut pieces = Vec::new();
        self.split(parsed.batch, parsed.range, bytes_per_row, &mut pieces)?;
        Ok(pieces)
    }

    fn split(
        &self,
        batch: RecordBatch,
        range: SeqRange,
        bytes_per_row: f64,
        out: &mut Vec<ParsedBatch>,
    ) -> Result<(), ConvertError> {
        let rows = batch.num_rows();
        let estimate = (bytes_per_row * rows as f64).ceil() as usize;

        if estimate <= self.budget {
            out.push(ParsedBatch { batch, range });
            return Ok(());
        }
        if rows == 1 {
            let size = serialized_size(&batch)?;
            if size > self.max_ipc_size {
                return Err(ConvertError::OversizedRow {
                    seq: range.first,
                    size,
                });
            }
            out.push(ParsedBatch { batch, range });
            return Ok(());
        }

        let mid = rows / 2;
        self.split(
            batch.slice(0, mid),
            SeqRange::new(range.first, range.first + mid as u64 - 1),
            bytes_per_row,
            out,
        )?;
        self.split(
            batch.slice(mid, rows - mid),
            SeqRange::new(range.first + mid as u64, range.last),
            bytes_per_row,
            out,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn make_parsed(rows: usize, cell: &str, first_seq: u64) -> ParsedBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("s", DataType::Utf8, false)]));
        let values: Vec<String> = (0..rows).map(|i| format!("{}-{}", cell, i)).collect();
        let column: ArrayRef = Arc::new(StringArray::from(values));
        let batch = RecordBatch::try_new(schema, vec![column]).unwrap();
        ParsedBatch {
            batch,
            range: SeqRange::new(first_seq, first_seq + rows as u64 - 1),
        }
    }

    #[test]
    fn test_small_batch_is_one_piece() {
        let resizer = Resizer::new(1_000_000, 0.9);
        let parsed = make_parsed(10, "x", 0);

        let pieces = resizer.resize(parsed).unwrap();
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].batch.num_rows(), 10);
        assert_eq!(pieces[0].range, SeqRange::new(0, 9));
    }

    #[test]
    fn test_large_batch_splits_with_contiguous_ranges() {
        // Each row carries ~100 bytes, so 64 rows blow a 1 KiB budget.
        let resizer = Resizer::new(1024, 0.9);
        let wide = "y".repeat(100);
        let parsed = make_parsed(64, &wide, 100);

        let pieces = resizer.resize(parsed).unwrap();
        assert!(pieces.len() > 1);

        // Pieces partition the input range in order.
        let mut next = 100;
        let mut total_rows = 0;
        for piece in &pieces {
            assert_eq!(piece.range.first, next);
            assert_eq!(piece.range.count(), piece.batch.num_rows() as u64);
            next = piece.range.last + 1;
            total_rows += piece.batch.num_rows();
        }
        assert_eq!(next, 164);
        assert_eq!(total_rows, 64);
    }

    #[test]
    fn test_single_oversized_row_fails() {
        let resizer = Resizer::new(256, 0.9);
        let huge = "z".repeat(4096);
        let parsed = make_parsed(1, &huge, 7);

        let result = resizer.resize(parsed);
        assert!(matches!(
            result,
            Err(ConvertError::OversizedRow { seq: 7, .. })
        ));
    }

    #[test]
    fn test_empty_batch_yields_nothing() {
        let resizer = Resizer::new(1024, 0.9);
        let schema = Arc::new(Schema::new(vec![Field::new(
            "s",
            DataType::Utf8,
            false,
        )]));
        let batch = RecordBatch::new_empty(schema);
        let parsed = ParsedBatch {
            batch,
            range: SeqRange::new(0, 0),
        };
        assert!(resizer.resize(parsed).unwrap().is_empty());
    }
}
