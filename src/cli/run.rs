use crate::config::parse::{load_config, ConfigError};
use crate::config::types::{Config, Framing};
use crate::pipeline::{run, PipelineError, PipelineReport};
use crate::publish::PulsarPublisher;
use std::path::PathBuf;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::info;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to connect to JSON source: {0}")]
    Connect(std::io::Error),

    #[error("failed to open input file: {0}")]
    OpenFile(std::io::Error),

    #[error("publisher setup error: {0}")]
    Publish(#[from] crate::publish::PublishError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("failed to write {kind} file: {error}")]
    Report {
        kind: &'static str,
        error: std::io::Error,
    },
}

/// Stream mode: convert JSONs arriving over TCP until the source closes
/// the connection.
pub async fn stream(config_path: Option<PathBuf>) -> Result<(), RunError> {
    let config = load(config_path)?;
    if config.source.framing == Framing::ZmqPush {
        return Err(ConfigError::NotImplemented("zmq-push framing".to_string()).into());
    }

    let addr = format!("{}:{}", config.source.host, config.source.port);
    info!(addr = %addr, "Connecting to JSON source");
    let source = TcpStream::connect(&addr).await.map_err(RunError::Connect)?;

    let publisher = PulsarPublisher::connect(&config.pulsar.url, &config.pulsar.topic).await?;
    let report = run(&config, source, Box::new(publisher)).await?;
    emit_report(&config, &report)
}

/// File mode: convert a newline-delimited JSON file through the same
/// pipeline, terminating at end of file.
pub async fn file(config_path: Option<PathBuf>, path: PathBuf) -> Result<(), RunError> {
    let config = load(config_path)?;

    info!(path = %path.display(), "Converting file");
    let source = tokio::fs::File::open(&path)
        .await
        .map_err(RunError::OpenFile)?;

    let publisher = PulsarPublisher::connect(&config.pulsar.url, &config.pulsar.topic).await?;
    let report = run(&config, source, Box::new(publisher)).await?;
    emit_report(&config, &report)
}

fn load(config_path: Option<PathBuf>) -> Result<Config, RunError> {
    let Some(path) = config_path else {
        return Err(ConfigError::Missing.into());
    };
    Ok(load_config(&path)?)
}

fn emit_report(config: &Config, report: &PipelineReport) -> Result<(), RunError> {
    if config.output.succinct {
        println!("{}", report.stats.succinct_line());
    } else {
        report.stats.log_verbose();
    }

    if let Some(path) = &config.output.latency_file {
        report
            .latency
            .write_csv(path)
            .map_err(|error| RunError::Report {
                kind: "latency",
                error,
            })?;
        info!(path = %path.display(), "Wrote latency measurements");
    }
    if let Some(path) = &config.output.metrics_file {
        report
            .stats
            .write_metrics_csv(path)
            .map_err(|error| RunError::Report {
                kind: "metrics",
                error,
            })?;
        info!(path = %path.display(), "Wrote conversion metrics");
    }

    Ok(())
}
