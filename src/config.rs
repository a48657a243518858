use std::env;
use std::str::FromStr;
use std::time::Duration;
use log::warn;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::data::Schedule;

// Server Configuration
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8080";
pub const DEFAULT_API_BIND_ADDRESS: &str = "127.0.0.1:3000";
pub const STATS_INTERVAL_SECS: u64 = 60;

// Notifier Configuration
pub const DEFAULT_PRICE_UPDATE_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_PRICE_BROADCAST_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_CHANGE_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_PUSH_TIMEOUT_MS: u64 = 800;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2000;
pub const DEFAULT_PRICE: &str = "100.00";

// Per-connection outbound queue
pub const OUTBOUND_CHANNEL_SIZE: usize = 100;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("default price must be positive, got {0}")]
    NonPositivePrice(Decimal),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub api_bind_address: String,
    pub price_update_interval: Duration,
    pub price_broadcast_interval: Duration,
    pub change_interval: Duration,
    pub push_timeout: Duration,
    pub shutdown_grace: Duration,
    pub default_price: Decimal,
    pub updater_seed: Option<u64>,
    pub demo_client: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            api_bind_address: DEFAULT_API_BIND_ADDRESS.to_string(),
            price_update_interval: Duration::from_millis(DEFAULT_PRICE_UPDATE_INTERVAL_MS),
            price_broadcast_interval: Duration::from_millis(DEFAULT_PRICE_BROADCAST_INTERVAL_MS),
            change_interval: Duration::from_millis(DEFAULT_CHANGE_INTERVAL_MS),
            push_timeout: Duration::from_millis(DEFAULT_PUSH_TIMEOUT_MS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            default_price: Decimal::new(10000, 2),
            updater_seed: None,
            demo_client: false,
            log_level: "info".to_string(),
        }
    }
}

fn parse_var<T: FromStr>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError> {
    match raw {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

fn millis_var(name: &'static str, raw: Option<String>, default_ms: u64) -> Result<Duration, ConfigError> {
    parse_var(name, raw, default_ms).map(Duration::from_millis)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default_price = match lookup("DEFAULT_PRICE") {
            Some(value) => Decimal::from_str(value.trim())
                .map_err(|_| ConfigError::Invalid { name: "DEFAULT_PRICE", value })?,
            None => Decimal::from_str(DEFAULT_PRICE).unwrap_or_else(|_| Decimal::new(10000, 2)),
        };

        Ok(Self {
            bind_address: lookup("BIND_ADDRESS").unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            api_bind_address: lookup("API_BIND_ADDRESS").unwrap_or_else(|| DEFAULT_API_BIND_ADDRESS.to_string()),
            price_update_interval: millis_var(
                "PRICE_UPDATE_INTERVAL_MS",
                lookup("PRICE_UPDATE_INTERVAL_MS"),
                DEFAULT_PRICE_UPDATE_INTERVAL_MS,
            )?,
            price_broadcast_interval: millis_var(
                "PRICE_BROADCAST_INTERVAL_MS",
                lookup("PRICE_BROADCAST_INTERVAL_MS"),
                DEFAULT_PRICE_BROADCAST_INTERVAL_MS,
            )?,
            change_interval: millis_var("CHANGE_INTERVAL_MS", lookup("CHANGE_INTERVAL_MS"), DEFAULT_CHANGE_INTERVAL_MS)?,
            push_timeout: millis_var("PUSH_TIMEOUT_MS", lookup("PUSH_TIMEOUT_MS"), DEFAULT_PUSH_TIMEOUT_MS)?,
            shutdown_grace: millis_var("SHUTDOWN_GRACE_MS", lookup("SHUTDOWN_GRACE_MS"), DEFAULT_SHUTDOWN_GRACE_MS)?,
            default_price,
            updater_seed: match lookup("UPDATER_SEED") {
                Some(value) => Some(parse_var("UPDATER_SEED", Some(value), 0u64)?),
                None => None,
            },
            demo_client: parse_var("DEMO_CLIENT", lookup("DEMO_CLIENT"), false)?,
            log_level: lookup("RUST_LOG").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("PRICE_UPDATE_INTERVAL_MS", self.price_update_interval),
            ("PRICE_BROADCAST_INTERVAL_MS", self.price_broadcast_interval),
            ("CHANGE_INTERVAL_MS", self.change_interval),
            ("PUSH_TIMEOUT_MS", self.push_timeout),
        ];
        for (name, period) in periods {
            if period.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }

        if self.default_price <= Decimal::ZERO {
            return Err(ConfigError::NonPositivePrice(self.default_price));
        }

        if self.push_timeout >= self.price_broadcast_interval {
            warn!(
                "Push timeout {:?} is not shorter than the broadcast interval {:?}; a stalled listener will cost whole ticks",
                self.push_timeout, self.price_broadcast_interval
            );
        }

        Ok(())
    }

    // Price updates start immediately, the first broadcast lands one period later
    pub fn price_schedule(&self) -> Schedule {
        Schedule {
            update_interval: self.price_update_interval,
            broadcast_interval: self.price_broadcast_interval,
            broadcast_delay: self.price_broadcast_interval,
            push_timeout: self.push_timeout,
        }
    }

    pub fn change_schedule(&self) -> Schedule {
        Schedule {
            update_interval: self.change_interval,
            broadcast_interval: self.change_interval,
            broadcast_delay: self.change_interval,
            push_timeout: self.push_timeout,
        }
    }

    pub fn log_config(&self) {
        println!("Server Configuration:");
        println!("  WebSocket Address: {}", self.bind_address);
        println!("  API Address: {}", self.api_bind_address);
        println!(
            "  Prices: update every {:?}, broadcast every {:?}, default {}",
            self.price_update_interval, self.price_broadcast_interval, self.default_price
        );
        println!("  Changes: every {:?}", self.change_interval);
        println!("  Push Timeout: {:?}", self.push_timeout);
        println!("  Demo Client: {}", self.demo_client);
        println!("  Log Level: {}", self.log_level);
    }
}
