use crate::convert::ConvertMetrics;
use crate::publish::PublishMetrics;
use crate::source::ReceiveMetrics;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Aggregated end-of-run statistics across all stages.
pub struct StreamStats {
    pub receive: ReceiveMetrics,
    pub convert: ConvertMetrics,
    pub per_worker: Vec<ConvertMetrics>,
    pub publish: PublishMetrics,
    pub num_workers: usize,
    pub first_latency: Option<Duration>,
}

impl StreamStats {
    pub fn aggregate(
        receive: ReceiveMetrics,
        per_worker: Vec<ConvertMetrics>,
        publish: PublishMetrics,
        first_latency: Option<Duration>,
    ) -> Self {
        let mut convert = ConvertMetrics::default();
        for metrics in &per_worker {
            convert.merge(metrics);
        }
        Self {
            receive,
            convert,
            num_workers: per_worker.len(),
            per_worker,
            publish,
            first_latency,
        }
    }

    /// One CSV line: `received,num_jsons,total_ipc_bytes,avg_bytes_per_msg,`
    /// `avg_parse_us,avg_thread_s,num_published,avg_publish_us,`
    /// `publish_thread_s,first_latency_s`.
    pub fn succinct_line(&self) -> String {
        let avg_bytes_per_msg = ratio(self.convert.ipc_bytes, self.convert.num_ipc);
        let avg_parse_us = avg_micros(self.convert.parse_time, self.convert.num_buffers);
        let avg_thread_s = if self.num_workers > 0 {
            self.convert.thread_time.as_secs_f64() / self.num_workers as f64
        } else {
            0.0
        };
        let avg_publish_us =
            avg_micros(self.publish.publish_time, self.publish.num_ipc_published);
        let first_latency_s = self.first_latency.map_or(0.0, |d| d.as_secs_f64());

        format!(
            "{},{},{},{:.3},{:.3},{:.6},{},{:.3},{:.6},{:.6}",
            self.receive.num_jsons,
            self.convert.num_jsons,
            self.convert.ipc_bytes,
            avg_bytes_per_msg,
            avg_parse_us,
            avg_thread_s,
            self.publish.num_ipc_published,
            avg_publish_us,
            self.publish.thread_time.as_secs_f64(),
            first_latency_s,
        )
    }

    /// Human-readable breakdown with the same quantities.
    pub fn log_verbose(&self) {
        let recv_s = self.receive.receive_time.as_secs_f64();
        let recv_mb = self.receive.num_bytes as f64 / 1e6;
        info!("Source:");
        info!("  JSONs received : {}", self.receive.num_jsons);
        info!("  Bytes received : {}", self.receive.num_bytes);
        info!("  Time           : {:.6} s", recv_s);
        if recv_s > 0.0 {
            info!("  Throughput     : {:.3} MB/s", recv_mb / recv_s);
        }

        info!("JSON to IPC conversion:");
        info!("  Converted      : {}", self.convert.num_jsons);
        info!("  Buffers        : {}", self.convert.num_buffers);
        info!("  Parse errors   : {}", self.convert.parse_errors);
        info!("  IPC messages   : {}", self.convert.num_ipc);
        info!("  IPC bytes      : {}", self.convert.ipc_bytes);
        info!(
            "  Avg. bytes/msg : {:.3}",
            ratio(self.convert.ipc_bytes, self.convert.num_ipc)
        );
        info!(
            "  Parse time     : {:.6} s in {} workers",
            self.convert.parse_time.as_secs_f64(),
            self.num_workers
        );
        info!(
            "  Resize time    : {:.6} s",
            self.convert.resize_time.as_secs_f64()
        );
        info!(
            "  Serialize time : {:.6} s",
            self.convert.serialize_time.as_secs_f64()
        );
        info!(
            "  Thread time    : {:.6} s",
            self.convert.thread_time.as_secs_f64()
        );

        info!("Publish:");
        info!("  IPC messages   : {}", self.publish.num_ipc_published);
        info!("  JSONs          : {}", self.publish.num_jsons_published);
        info!(
            "  Publish time   : {:.6} s",
            self.publish.publish_time.as_secs_f64()
        );
        info!(
            "  Thread time    : {:.6} s",
            self.publish.thread_time.as_secs_f64()
        );

        match self.first_latency {
            Some(latency) => info!("First latency    : {:.6} s", latency.as_secs_f64()),
            None => info!("First latency    : n/a"),
        }
    }

    /// Per-worker conversion metrics as CSV.
    pub fn write_metrics_csv(&self, path: &Path) -> std::io::Result<()> {
        let mut file = std::fs::File::create(path)?;
        writeln!(
            file,
            "worker,num_jsons,num_json_bytes,num_buffers,num_ipc,ipc_bytes,parse_errors,\
             parse_us,resize_us,serialize_us,thread_us"
        )?;
        for (worker, m) in self.per_worker.iter().enumerate() {
            writeln!(
                file,
                "{},{},{},{},{},{},{},{},{},{},{}",
                worker,
                m.num_jsons,
                m.num_json_bytes,
                m.num_buffers,
                m.num_ipc,
                m.ipc_bytes,
                m.parse_errors,
                m.parse_time.as_micros(),
                m.resize_time.as_micros(),
                m.serialize_time.as_micros(),
                m.thread_time.as_micros(),
            )?;
        }
        Ok(())
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn avg_micros(total: Duration, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total.as_micros() as f64 / count as f64
    }
}
