use arrow::datatypes::{DataType, Field, Schema};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Name of the sequence number column prepended when `seq_column` is enabled.
pub const SEQ_COLUMN: &str = "bolson_seq";

/// Schema metadata key carrying the first sequence number of a batch.
pub const SEQ_FIRST_META: &str = "bolson_seq_first";

/// Schema metadata key carrying the last sequence number of a batch.
pub const SEQ_LAST_META: &str = "bolson_seq_last";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    pub schema: SchemaConfig,
    #[serde(default)]
    pub parse: ParseConfig,
    #[serde(default)]
    pub convert: ConvertConfig,
    #[serde(default)]
    pub pulsar: PulsarConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub framing: Framing,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            framing: Framing::Raw,
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    12345
}

/// Wire dialect of the JSON source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// One JSON object per newline-terminated line.
    #[default]
    Raw,
    #[serde(rename = "zmq-push")]
    ZmqPush,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    pub fields: Vec<FieldConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Element type for `list` fields.
    #[serde(default)]
    pub item: Option<FieldType>,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Bool,
    Int64,
    Uint64,
    Float64,
    Utf8,
    List,
}

impl SchemaConfig {
    /// Build the Arrow schema described by this config.
    ///
    /// List fields use the conventional `item` element name so the JSON
    /// decoder and downstream readers agree on the layout.
    pub fn to_arrow(&self) -> Arc<Schema> {
        let fields: Vec<Field> = self
            .fields
            .iter()
            .map(|f| {
                let data_type = match f.field_type {
                    FieldType::Bool => DataType::Boolean,
                    FieldType::Int64 => DataType::Int64,
                    FieldType::Uint64 => DataType::UInt64,
                    FieldType::Float64 => DataType::Float64,
                    FieldType::Utf8 => DataType::Utf8,
                    FieldType::List => {
                        let item = match f.item {
                            Some(FieldType::Bool) => DataType::Boolean,
                            Some(FieldType::Uint64) => DataType::UInt64,
                            Some(FieldType::Float64) => DataType::Float64,
                            Some(FieldType::Utf8) => DataType::Utf8,
                            // Validated in parse::validate_config; int64 is
                            // also the fallback for absent element types.
                            _ => DataType::Int64,
                        };
                        DataType::List(Arc::new(Field::new("item", item, true)))
                    }
                };
                Field::new(&f.name, data_type, f.nullable)
            })
            .collect();
        Arc::new(Schema::new(fields))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseConfig {
    #[serde(default)]
    pub unexpected_field_behavior: UnexpectedFieldBehavior,
    /// Decode block size in bytes.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Whether the parser itself may fan out. The worker pool already
    /// provides parallelism, so this defaults to false.
    #[serde(default)]
    pub use_threads: bool,
}

impl Default for ParseConfig {
    fn default() -> Self {
        Self {
            unexpected_field_behavior: UnexpectedFieldBehavior::default(),
            block_size: default_block_size(),
            use_threads: false,
        }
    }
}

fn default_block_size() -> usize {
    1024 * 1024
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnexpectedFieldBehavior {
    /// Silently drop JSON fields absent from the schema.
    #[default]
    Ignore,
    /// Treat JSON fields absent from the schema as a parse error.
    Error,
    /// Infer the schema from each buffer instead of using the configured one.
    Infer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertConfig {
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Buffer pool size. Defaults to `max(num_workers + 1, 2)`.
    #[serde(default)]
    pub num_buffers: Option<usize>,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Pulsar message ceiling for serialized IPC payloads.
    #[serde(default = "default_max_ipc_size")]
    pub max_ipc_size: usize,
    /// Fraction of `max_ipc_size` the resizer aims for before splitting.
    #[serde(default = "default_size_hint")]
    pub size_hint: f64,
    /// Embed sequence numbers as a `bolson_seq` column rather than only as
    /// schema metadata.
    #[serde(default)]
    pub seq_column: bool,
    #[serde(default)]
    pub seq_start: u64,
    /// Queue timeout granularity in microseconds.
    #[serde(default = "default_poll_interval_us")]
    pub poll_interval_us: u64,
    /// Capacity of the serialized message queue. Defaults to `2 * num_workers`.
    #[serde(default)]
    pub ipc_queue_capacity: Option<usize>,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            num_buffers: None,
            buffer_capacity: default_buffer_capacity(),
            max_ipc_size: default_max_ipc_size(),
            size_hint: default_size_hint(),
            seq_column: false,
            seq_start: 0,
            poll_interval_us: default_poll_interval_us(),
            ipc_queue_capacity: None,
        }
    }
}

impl ConvertConfig {
    pub fn effective_num_buffers(&self) -> usize {
        self.num_buffers.unwrap_or((self.num_workers + 1).max(2))
    }

    pub fn effective_ipc_queue_capacity(&self) -> usize {
        self.ipc_queue_capacity.unwrap_or(2 * self.num_workers)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }
}

fn default_num_workers() -> usize {
    1
}

fn default_buffer_capacity() -> usize {
    16 * 1024 * 1024
}

fn default_max_ipc_size() -> usize {
    512 * 1024
}

fn default_size_hint() -> f64 {
    0.9
}

fn default_poll_interval_us() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulsarConfig {
    #[serde(default = "default_pulsar_url")]
    pub url: String,
    #[serde(default = "default_pulsar_topic")]
    pub topic: String,
}

impl Default for PulsarConfig {
    fn default() -> Self {
        Self {
            url: default_pulsar_url(),
            topic: default_pulsar_topic(),
        }
    }
}

fn default_pulsar_url() -> String {
    "pulsar://localhost:6650".to_string()
}

fn default_pulsar_topic() -> String {
    "persistent://public/default/bolson".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Emit one CSV line instead of the human-readable breakdown.
    #[serde(default)]
    pub succinct: bool,
    /// Write per-sequence latency measurements to this CSV file.
    #[serde(default)]
    pub latency_file: Option<PathBuf>,
    /// Write per-worker conversion metrics to this CSV file.
    #[serde(default)]
    pub metrics_file: Option<PathBuf>,
}
