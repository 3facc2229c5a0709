//! Chat transports the forwarder reads from and delivers to.

pub mod telegram;
pub mod telegram_entities;
pub mod telegram_types;

pub use telegram::{TelegramTransport, spawn_update_poller};
