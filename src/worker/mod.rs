//! Background job processing.
//!
//! - `queue`: bounded job channel, retrying consumer loop

pub mod queue;

pub use queue::{ForwardJob, ForwardQueue, WorkerSettings, spawn_forward_worker};
