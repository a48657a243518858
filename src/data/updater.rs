use std::fmt::Display;
use std::sync::{Arc, Mutex, PoisonError};
use chrono::{DateTime, Local};
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

use crate::data::store::ValueStore;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum UpdateError {
    #[error("drift {0} is not representable as a decimal")]
    InvalidDrift(f64),
    #[error("applying drift {drift} to {price} overflowed")]
    Overflow { price: Decimal, drift: Decimal },
}

/// Decides the next value of a key on each updater tick. `Ok(None)` leaves the
/// key untouched this tick.
pub trait ValueSource<V>: Send + Sync {
    fn next_value(&self, key: &str, current: &V, rng: &mut dyn RngCore) -> Result<Option<V>, UpdateError>;
}

// Random walk: each key independently moves by up to ±max_drift with the given probability
#[derive(Debug, Clone)]
pub struct PriceWalk {
    change_probability: f64,
    max_drift: f64,
    scale: u32,
}

impl PriceWalk {
    pub fn new(change_probability: f64, max_drift: f64, scale: u32) -> Self {
        Self {
            change_probability: change_probability.clamp(0.0, 1.0),
            max_drift: max_drift.abs(),
            scale,
        }
    }
}

impl Default for PriceWalk {
    fn default() -> Self {
        Self::new(0.5, 0.05, 2)
    }
}

/// `price × (1 + drift)`, rounded half-up to `scale` decimal places.
pub fn apply_drift(price: Decimal, drift: f64, scale: u32) -> Result<Decimal, UpdateError> {
    let drift_decimal = Decimal::from_f64(drift).ok_or(UpdateError::InvalidDrift(drift))?;
    let moved = Decimal::ONE
        .checked_add(drift_decimal)
        .and_then(|factor| price.checked_mul(factor))
        .ok_or(UpdateError::Overflow {
            price,
            drift: drift_decimal,
        })?;
    Ok(moved.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero))
}

impl ValueSource<Decimal> for PriceWalk {
    fn next_value(&self, _key: &str, current: &Decimal, rng: &mut dyn RngCore) -> Result<Option<Decimal>, UpdateError> {
        if !rng.gen_bool(self.change_probability) {
            return Ok(None);
        }
        let drift = rng.gen_range(-self.max_drift..=self.max_drift);
        apply_drift(*current, drift, self.scale).map(Some)
    }
}

// Regenerates a "what changed" message for every key on each tick
#[derive(Debug, Clone, Default)]
pub struct ChangeStamp;

pub fn change_stamp(at: &DateTime<Local>) -> String {
    format!("Changed: {}", at.format("%Y-%m-%d %H:%M:%S"))
}

impl ValueSource<String> for ChangeStamp {
    fn next_value(&self, _key: &str, _current: &String, _rng: &mut dyn RngCore) -> Result<Option<String>, UpdateError> {
        Ok(Some(change_stamp(&Local::now())))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpdateReport {
    pub changed: usize,
    pub failed: usize,
}

/// Mutates the value store on behalf of the outside world. Never touches listeners.
pub struct Updater<V> {
    store: Arc<ValueStore<V>>,
    source: Arc<dyn ValueSource<V>>,
    rng: Mutex<StdRng>,
}

impl<V: Clone + Display> Updater<V> {
    pub fn new(store: Arc<ValueStore<V>>, source: Arc<dyn ValueSource<V>>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            store,
            source,
            rng: Mutex::new(rng),
        }
    }

    /// One pass over every key. A key whose next value can't be computed keeps its
    /// old value; the rest of the tick carries on.
    pub fn run_tick(&self) -> UpdateReport {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let mut report = UpdateReport::default();

        // Stable order so a seeded rng replays the same walk
        let mut keys = self.store.keys();
        keys.sort();

        for key in keys {
            let Some(current) = self.store.get(&key) else {
                continue;
            };

            match self.source.next_value(&key, &current, &mut *rng) {
                Ok(Some(next)) => {
                    debug!("{} changed from {} to {}", key, current, next);
                    self.store.set(&key, next);
                    report.changed += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Failed to update {}: {}", key, e);
                    report.failed += 1;
                }
            }
        }

        report
    }
}
