use anyhow::{Context, Result};

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub http_addr: SocketAddr,
    pub mqtt_addr: SocketAddr,
    pub db_path: PathBuf,
    /// Include error causes in 500 responses.
    pub development: bool,
}

impl Config {
    const HOST_ENV_VAR: &'static str = "HOST";
    const HTTP_PORT_ENV_VAR: &'static str = "PORT";
    const MQTT_PORT_ENV_VAR: &'static str = "MQTT_PORT";
    const DB_PATH_ENV_VAR: &'static str = "DB_PATH";
    const APP_ENV_ENV_VAR: &'static str = "APP_ENV";

    const DEFAULT_HOST: &'static str = "0.0.0.0";
    const DEFAULT_HTTP_PORT: u16 = 3001;
    const DEFAULT_MQTT_PORT: u16 = 1883;
    const DEFAULT_DB_PATH: &'static str = "database.sqlite";

    /// Loads `.env` if there is one, then reads the process environment.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenv::dotenv() {
            log::debug!("No .env file loaded: {e}");
        }

        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let host: IpAddr = lookup(Self::HOST_ENV_VAR)
            .as_deref()
            .unwrap_or(Self::DEFAULT_HOST)
            .parse()
            .with_context(|| format!("{} is not an IP address", Self::HOST_ENV_VAR))?;

        let port = |key: &str, default: u16| -> Result<u16> {
            match lookup(key) {
                Some(value) => value
                    .parse()
                    .with_context(|| format!("{key}={value:?} is not a valid port")),
                None => Ok(default),
            }
        };
        let http_port = port(Self::HTTP_PORT_ENV_VAR, Self::DEFAULT_HTTP_PORT)?;
        let mqtt_port = port(Self::MQTT_PORT_ENV_VAR, Self::DEFAULT_MQTT_PORT)?;

        let db_path = PathBuf::from(
            lookup(Self::DB_PATH_ENV_VAR).unwrap_or_else(|| Self::DEFAULT_DB_PATH.to_owned()),
        );

        let development = lookup(Self::APP_ENV_ENV_VAR)
            .is_some_and(|env| env.eq_ignore_ascii_case("development"));

        Ok(Self {
            http_addr: SocketAddr::new(host, http_port),
            mqtt_addr: SocketAddr::new(host, mqtt_port),
            db_path,
            development,
        })
    }
}
