//! Environment configuration.
//!
//! `BLAMA_HOST` (bind address, default `0.0.0.0`), `BLAMA_PORT` (default
//! `7331`), `BLAMA_MODEL` (path to a `.gguf` file). Invalid values abort
//! startup with a configuration error.

use std::net::IpAddr;
use std::path::PathBuf;

use blama_engine::{BlamaError, Result};

pub const DEFAULT_PORT: u16 = 7331;
const DEFAULT_MODEL: &str = "gpt2-117m-q6_k.gguf";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub model: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: IpAddr::from([0, 0, 0, 0]),
            port: DEFAULT_PORT,
            model: PathBuf::from(DEFAULT_MODEL),
        }
    }
}

impl ServerConfig {
    /// Read configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let mut config = ServerConfig::default();

        if let Ok(host) = std::env::var("BLAMA_HOST") {
            config.host = host
                .parse()
                .map_err(|_| BlamaError::Config(format!("invalid BLAMA_HOST: {host}")))?;
        }

        if let Ok(port) = std::env::var("BLAMA_PORT") {
            config.port = Self::parse_port(&port)?;
        }

        if let Ok(model) = std::env::var("BLAMA_MODEL") {
            config.model = Self::validate_model_path(&model)?;
        }

        Ok(config)
    }

    fn parse_port(value: &str) -> Result<u16> {
        // strict: the whole value must be the number
        value
            .parse::<u16>()
            .map_err(|_| BlamaError::Config(format!("invalid BLAMA_PORT: {value}")))
    }

    fn validate_model_path(value: &str) -> Result<PathBuf> {
        if value.is_empty() {
            return Err(BlamaError::Config("BLAMA_MODEL is empty".into()));
        }
        if !value.ends_with(".gguf") {
            return Err(BlamaError::Config(format!(
                "BLAMA_MODEL does not end with .gguf: {value}"
            )));
        }
        let path = PathBuf::from(value);
        if !path.exists() {
            return Err(BlamaError::Config(format!(
                "BLAMA_MODEL does not exist: {value}"
            )));
        }
        if !path.is_file() {
            return Err(BlamaError::Config(format!(
                "BLAMA_MODEL is not a regular file: {value}"
            )));
        }
        Ok(path)
    }
}
