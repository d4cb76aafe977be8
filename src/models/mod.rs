//! Core data model for the gateway.
//!
//! Channel/config types, the request fingerprint, canonical usage
//! accounting, and the persisted record shapes live here. Dialect wire
//! formats (the tagged Anthropic/OpenAI/Gemini request & response bodies)
//! live in [`crate::translator::dialect`] since they are really part of the
//! Format Translator's contract, not the gateway's own state.

pub mod channel;
pub mod fingerprint;
pub mod metrics_record;
pub mod usage;

pub use channel::{Channel, ChannelSet, ChannelStatus, ServiceType};
pub use fingerprint::RequestFingerprint;
pub use metrics_record::{DailyRollup, PersistedRecord, RequestLogEntry};
pub use usage::Usage;
