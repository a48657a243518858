pub mod handler;
pub mod listener;
pub mod protocol;

pub use handler::WebSocketHandler;
