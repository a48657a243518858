use std::sync::Arc;
use chrono::Local;
use rust_decimal::Decimal;

use crate::data::controller::{Notifier, Schedule};
use crate::data::pubsub::Cardinality;
use crate::data::store::ValueStore;
use crate::data::updater::{change_stamp, ChangeStamp, PriceWalk};

pub const PRICES_TOPIC: &str = "prices";
pub const CHANGES_TOPIC: &str = "changes";

// Symbols quoted before anyone subscribes
pub const SEED_PRICES: [(&str, i64); 5] = [
    ("AAPL", 15000),
    ("GOOGL", 280000),
    ("MSFT", 28000),
    ("AMZN", 320000),
    ("TSLA", 70000),
];

pub fn seed_prices() -> ValueStore<Decimal> {
    ValueStore::with_values(
        SEED_PRICES
            .iter()
            .map(|(symbol, cents)| (*symbol, Decimal::new(*cents, 2))),
    )
}

/// Stock ticker: many listeners per symbol, prices drift randomly.
pub fn price_board(default_price: Decimal, schedule: Schedule, seed: Option<u64>) -> Notifier<Decimal> {
    Notifier::new(
        PRICES_TOPIC,
        Arc::new(seed_prices()),
        Cardinality::Multi,
        Arc::new(move |_: &str| default_price),
        Arc::new(PriceWalk::default()),
        schedule,
        seed,
    )
}

/// Change feed: one listener per key, the value is a fresh timestamped message
/// on every update.
pub fn change_feed(schedule: Schedule) -> Notifier<String> {
    Notifier::new(
        CHANGES_TOPIC,
        Arc::new(ValueStore::new()),
        Cardinality::Single,
        Arc::new(|_: &str| change_stamp(&Local::now())),
        Arc::new(ChangeStamp),
        schedule,
        None,
    )
}
