use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::http::HeaderValue;

use crate::generator::CommandSpec;

/// Service settings, read from the environment (and `.env` via dotenvy).
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub public_base_url: String,
    pub uploads_dir: PathBuf,
    pub caption_command: CommandSpec,
    pub poem_command: CommandSpec,
    pub generator_timeout: Duration,
    pub max_concurrent_generations: usize,
    pub allowed_origin: HeaderValue,
    pub max_upload_bytes: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; missing keys take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let bind_addr = parse("BIND_ADDR", &get("BIND_ADDR", "0.0.0.0:8080"))?;
        let public_base_url = get("PUBLIC_BASE_URL", "http://localhost:8080")
            .trim_end_matches('/')
            .to_string();
        let uploads_dir = PathBuf::from(get("UPLOADS_DIR", "uploads"));

        let caption_command = CommandSpec::parse(&get("CAPTION_COMMAND", "python caption.py"))
            .context("CAPTION_COMMAND must not be empty")?;
        let poem_command = CommandSpec::parse(&get("POEM_COMMAND", "python convert.py"))
            .context("POEM_COMMAND must not be empty")?;

        let timeout_secs: u64 = parse(
            "GENERATOR_TIMEOUT_SECS",
            &get("GENERATOR_TIMEOUT_SECS", "30"),
        )?;
        if timeout_secs == 0 {
            bail!("GENERATOR_TIMEOUT_SECS must be at least 1");
        }

        let max_concurrent_generations: usize = parse(
            "MAX_CONCURRENT_GENERATIONS",
            &get("MAX_CONCURRENT_GENERATIONS", "4"),
        )?;
        if max_concurrent_generations == 0 {
            bail!("MAX_CONCURRENT_GENERATIONS must be at least 1");
        }

        let origin = get("ALLOWED_ORIGIN", "http://localhost:3000");
        let allowed_origin = HeaderValue::from_str(&origin)
            .with_context(|| format!("ALLOWED_ORIGIN is not a valid header value: {origin:?}"))?;

        let max_upload_bytes = parse("MAX_UPLOAD_BYTES", &get("MAX_UPLOAD_BYTES", "10485760"))?;

        Ok(Self {
            bind_addr,
            public_base_url,
            uploads_dir,
            caption_command,
            poem_command,
            generator_timeout: Duration::from_secs(timeout_secs),
            max_concurrent_generations,
            allowed_origin,
            max_upload_bytes,
        })
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("invalid {key}: {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(cfg.public_base_url, "http://localhost:8080");
        assert_eq!(cfg.uploads_dir, PathBuf::from("uploads"));
        assert_eq!(cfg.caption_command, CommandSpec::new("python", ["caption.py"]));
        assert_eq!(cfg.poem_command, CommandSpec::new("python", ["convert.py"]));
        assert_eq!(cfg.generator_timeout, Duration::from_secs(30));
        assert_eq!(cfg.max_concurrent_generations, 4);
        assert_eq!(cfg.allowed_origin, "http://localhost:3000");
    }

    #[test]
    fn overrides_and_trailing_slash() {
        let cfg = config(&[
            ("PUBLIC_BASE_URL", "https://poems.example/"),
            ("CAPTION_COMMAND", "/opt/venv/bin/python3 caption.py"),
            ("GENERATOR_TIMEOUT_SECS", "5"),
        ])
        .unwrap();
        assert_eq!(cfg.public_base_url, "https://poems.example");
        assert_eq!(cfg.caption_command.program, "/opt/venv/bin/python3");
        assert_eq!(cfg.generator_timeout, Duration::from_secs(5));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(config(&[("MAX_CONCURRENT_GENERATIONS", "0")]).is_err());
        assert!(config(&[("GENERATOR_TIMEOUT_SECS", "soon")]).is_err());
        assert!(config(&[("POEM_COMMAND", "  ")]).is_err());
        assert!(config(&[("BIND_ADDR", "localhost")]).is_err());
    }
}
