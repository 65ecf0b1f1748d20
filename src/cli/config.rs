use crate::config::generate::generate_starter_config;
use std::fs;
use std::path::PathBuf;

/// Write a starter config to `./bolson.yml`, or print it with `--stdout`.
pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let content = generate_starter_config();

    if stdout {
        print!("{}", content);
        return Ok(());
    }

    let path = PathBuf::from("bolson.yml");
    if path.exists() {
        return Err(format!(
            "config file already exists at {}; remove it first or use --stdout",
            path.display()
        )
        .into());
    }

    fs::write(&path, content)?;
    eprintln!("Wrote starter config to {}", path.display());
    Ok(())
}
