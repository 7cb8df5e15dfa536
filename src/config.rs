use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use tracing::debug;

use crate::query::QueryQualifier;

const DEFAULT_STORE_PATH: &str = "coordenadas_departamentos.csv";
const DEFAULT_GEOCODER_ENDPOINT: &str = "https://nominatim.openstreetmap.org";
const DEFAULT_USER_AGENT: &str = "pba_mapa";
const DEFAULT_MIN_DELAY_MS: u64 = 1_000;
const MIN_DELAY_FLOOR_MS: u64 = 50;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub store_path: PathBuf,
    pub geocoder_endpoint: String,
    pub geocoder_user_agent: String,
    pub min_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub rate_limit_backoff_ms: u64,
    pub store_lock_timeout_ms: u64,
    pub region: String,
    pub country: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            store_path: env::var("GEOCODE_STORE_PATH")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_PATH)),
            geocoder_endpoint: parse_string("GEOCODER_ENDPOINT", DEFAULT_GEOCODER_ENDPOINT),
            geocoder_user_agent: parse_string("GEOCODER_USER_AGENT", DEFAULT_USER_AGENT),
            min_delay_ms: parse_u64("GEOCODER_MIN_DELAY_MS", DEFAULT_MIN_DELAY_MS)
                .max(MIN_DELAY_FLOOR_MS),
            request_timeout_ms: parse_u64("GEOCODER_TIMEOUT_MS", 10_000).max(1),
            rate_limit_backoff_ms: parse_u64("GEOCODER_BACKOFF_MS", 2_000),
            store_lock_timeout_ms: parse_u64("GEOCODE_STORE_LOCK_TIMEOUT_MS", 5_000),
            region: parse_string("GEOCODE_REGION", "Buenos Aires"),
            country: parse_string("GEOCODE_COUNTRY", "Argentina"),
        }
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms.max(MIN_DELAY_FLOOR_MS))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_millis(self.rate_limit_backoff_ms)
    }

    pub fn store_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.store_lock_timeout_ms)
    }

    pub fn qualifier(&self) -> QueryQualifier {
        QueryQualifier::new(self.region.clone(), self.country.clone())
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}
