pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# BOLSON CONFIGURATION
# =============================================================================
# Bolson converts newline-delimited JSON arriving over TCP into Arrow IPC
# messages and publishes them to a Pulsar topic.

# The JSON source to connect to in stream mode.
source:
  host: localhost
  port: 12345
  # Wire dialect: 'raw' (JSON-per-line) or 'zmq-push' (not implemented).
  framing: raw

# The Arrow schema of the incoming JSON objects.
# Types: bool, int64, uint64, float64, utf8, list (with an 'item' type).
schema:
  fields:
    - name: voltage
      type: list
      item: uint64

parse:
  # What to do with JSON fields absent from the schema:
  # 'ignore', 'error', or 'infer' (infer the schema per buffer).
  unexpected_field_behavior: ignore
  block_size: 1048576

convert:
  num_workers: 1
  # num_buffers defaults to num_workers + 1
  buffer_capacity: 16777216
  # Pulsar message ceiling for serialized IPC payloads.
  max_ipc_size: 524288
  # Embed sequence numbers as a 'bolson_seq' column instead of only metadata.
  seq_column: false
  seq_start: 0
  poll_interval_us: 10000

pulsar:
  url: pulsar://localhost:6650
  topic: persistent://public/default/bolson

output:
  # One CSV stats line instead of the human-readable breakdown.
  succinct: false
  # Optional CSV destinations.
  # latency_file: /tmp/bolson-latency.csv
  # metrics_file: /tmp/bolson-metrics.csv
"#
    .to_string()
}
