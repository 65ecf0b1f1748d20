use crate::config::types::{ParseConfig, UnexpectedFieldBehavior, SEQ_COLUMN};
use crate::source::{JsonBuffer, SeqRange};
use arrow::array::{ArrayRef, RecordBatch, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::json::reader::{infer_json_schema, ReaderBuilder};
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("json decode error: {0}")]
    Decode(#[from] ArrowError),

    #[error("buffer of {expected} records decoded to {decoded} rows")]
    RowCountMismatch { expected: u64, decoded: u64 },
}

/// A columnar record batch together with the sequence range of its rows.
/// Row order matches sequence order.
#[derive(Debug, Clone)]
pub struct ParsedBatch {
    pub batch: RecordBatch,
    pub range: SeqRange,
}

/// Converts raw JSON buffers into Arrow record batches.
///
/// One parser instance is bound to one worker at setup; backends that talk
/// to shared hardware report `needs_exclusive_access`, and workers then
/// serialize calls through a process-wide lock.
pub trait JsonParser: Send {
    fn parse(&mut self, buffers: &[&JsonBuffer]) -> Result<Vec<ParsedBatch>, ParseError>;

    fn needs_exclusive_access(&self) -> bool {
        false
    }

    fn input_schema(&self) -> SchemaRef;

    /// Schema of produced batches, including the sequence column when
    /// enabled.
    fn output_schema(&self) -> SchemaRef;
}

/// CPU reference parser on top of the Arrow JSON decoder.
pub struct ArrowJsonParser {
    input_schema: SchemaRef,
    output_schema: SchemaRef,
    options: ParseConfig,
    seq_column: bool,
}

impl ArrowJsonParser {
    pub fn new(schema: SchemaRef, options: ParseConfig, seq_column: bool) -> Self {
        let output_schema = if seq_column {
            Arc::new(prepend_seq_field(&schema))
        } else {
            schema.clone()
        };
        Self {
            input_schema: schema,
            output_schema,
            options,
            seq_column,
        }
    }

    fn parse_one(&self, buffer: &JsonBuffer) -> Result<ParsedBatch, ParseError> {
        let range = buffer.range();

        let schema = match self.options.unexpected_field_behavior {
            UnexpectedFieldBehavior::Infer => {
                let mut cursor = Cursor::new(buffer.bytes());
                let (inferred, _) = infer_json_schema(&mut cursor, None)?;
                Arc::new(inferred)
            }
            _ => self.input_schema.clone(),
        };
        let strict = matches!(
            self.options.unexpected_field_behavior,
            UnexpectedFieldBehavior::Error
        );

        let mut decoder = ReaderBuilder::new(schema)
            .with_batch_size(range.count() as usize)
            .with_strict_mode(strict)
            .build_decoder()?;
        for chunk in buffer.bytes().chunks(self.options.block_size.max(1)) {
            decoder.decode(chunk)?;
        }
        let Some(batch) = decoder.flush()? else {
            return Err(ParseError::RowCountMismatch {
                expected: range.count(),
                decoded: 0,
            });
        };

        let decoded = batch.num_rows() as u64;
        if decoded != range.count() {
            return Err(ParseError::RowCountMismatch {
                expected: range.count(),
                decoded,
            });
        }

        let batch = if self.seq_column {
            prepend_seq_column(&batch, range)?
        } else {
            batch
        };
        Ok(ParsedBatch { batch, range })
    }
}

impl JsonParser for ArrowJsonParser {
    fn parse(&mut self, buffers: &[&JsonBuffer]) -> Result<Vec<ParsedBatch>, ParseError> {
        buffers.iter().map(|buffer| self.parse_one(buffer)).collect()
    }

    fn input_schema(&self) -> SchemaRef {
        self.input_schema.clone()
    }

    fn output_schema(&self) -> SchemaRef {
        self.output_schema.clone()
    }
}

fn prepend_seq_field(schema: &Schema) -> Schema {
    let mut fields = vec![Arc::new(Field::new(SEQ_COLUMN, DataType::UInt64, false))];
    fields.extend(schema.fields().iter().cloned());
    Schema::new(fields)
}

fn prepend_seq_column(batch: &RecordBatch, range: SeqRange) -> Result<RecordBatch, ArrowError> {
    let seq: ArrayRef = Arc::new(UInt64Array::from_iter_values(range.first..=range.last));
    let schema = Arc::new(prepend_seq_field(batch.schema().as_ref()));
    let mut columns = vec![seq];
    columns.extend_from_slice(batch.columns());
    RecordBatch::try_new(schema, columns)
}
