use super::types::*;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no config file specified, use --config <path>")]
    Missing,

    #[error("{0} is not implemented")]
    NotImplemented(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let file = File::open(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open config file '{}': {}", path.display(), e),
        ))
    })?;

    let config: Config = serde_yaml::from_reader(file)?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.convert.num_workers == 0 {
        errors.push("convert.num_workers must be at least 1".to_string());
    }
    if config.convert.buffer_capacity == 0 {
        errors.push("convert.buffer_capacity must be non-zero".to_string());
    }
    if config.convert.max_ipc_size == 0 {
        errors.push("convert.max_ipc_size must be non-zero".to_string());
    }
    if !(config.convert.size_hint > 0.0 && config.convert.size_hint <= 1.0) {
        errors.push("convert.size_hint must be in (0, 1]".to_string());
    }
    if let Some(num_buffers) = config.convert.num_buffers {
        if num_buffers < config.convert.num_workers + 1 {
            errors.push(format!(
                "convert.num_buffers must be at least num_workers + 1 ({})",
                config.convert.num_workers + 1
            ));
        }
    }
    if let Some(capacity) = config.convert.ipc_queue_capacity {
        if capacity == 0 {
            errors.push("convert.ipc_queue_capacity must be non-zero".to_string());
        }
    }

    if config.schema.fields.is_empty() {
        errors.push("schema.fields must not be empty".to_string());
    }
    for field in &config.schema.fields {
        if field.name.is_empty() {
            errors.push("schema field names must not be empty".to_string());
        }
        if field.name == SEQ_COLUMN {
            errors.push(format!("schema field name '{}' is reserved", SEQ_COLUMN));
        }
        if field.field_type == FieldType::List && field.item.is_none() {
            errors.push(format!(
                "schema field '{}' is a list and needs an 'item' element type",
                field.name
            ));
        }
        if field.field_type != FieldType::List && field.item.is_some() {
            errors.push(format!(
                "schema field '{}' is not a list and must not set 'item'",
                field.name
            ));
        }
        if field.item == Some(FieldType::List) {
            errors.push(format!(
                "schema field '{}': nested lists are not supported",
                field.name
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation(errors.join("; ")))
    }
}
