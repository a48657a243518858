pub mod broadcaster;
pub mod controller;
pub mod listener;
pub mod pubsub;
pub mod store;
pub mod topics;
pub mod updater;

pub use controller::{Notifier, Schedule, TopicStats};
pub use listener::{DeliveryError, Listener, ListenerHandle, LogListener};
pub use topics::{change_feed, price_board};
