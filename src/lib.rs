//! Channel Forwarder: rule-driven copying of channel posts to target channels.

pub mod api;
pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod rules;
pub mod store;
pub mod worker;
