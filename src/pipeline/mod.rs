//! Forwarding pipeline.
//!
//! Every observed source message flows through:
//! 1. `RuleMatcher`: enabled rules for the source channel
//! 2. `evaluate_filter`: per-rule eligibility
//! 3. `edit_message`: per-rule text rewrite
//! 4. `Dispatcher`: fan-out to the rule's targets
//!
//! `ForwardingOrchestrator` ties the stages together and owns the dedup window.

pub mod cancel;
pub mod dedup;
pub mod dispatcher;
pub mod editor;
pub mod filter;
pub mod orchestrator;
pub mod types;

pub use cancel::CancelSignal;
pub use dedup::DedupWindow;
pub use orchestrator::ForwardingOrchestrator;
pub use types::{ForwardOutcome, MessageTransport, MessageView, OutgoingMessage};
