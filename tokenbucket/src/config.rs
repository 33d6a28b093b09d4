use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Default, Deserialize, Clone)]
pub struct BucketConfig {
    pub capacity: Option<u32>,
    pub refill_secs: Option<u64>,
    pub format: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    pub bucket: Option<BucketConfig>,
}

pub const DEFAULT_CONFIG: &str = "tokenbucket.yaml";

/// Load an explicit config file, or ./tokenbucket.yaml when present. A missing default file is not an error.
pub fn load_config(path: Option<&Path>) -> Result<Option<Config>> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG);
            if p.exists() { p.to_path_buf() } else { return Ok(None); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    parse_config(&s).with_context(|| format!("parsing {}", path.display())).map(Some)
}

pub fn parse_config(s: &str) -> Result<Config> {
    Ok(serde_yaml::from_str(s)?)
}
