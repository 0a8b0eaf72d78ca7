pub mod domain;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod ids;
pub mod topics;

pub use envelope::{Envelope, EnvelopeType, ToolOutcome};
pub use errors::ProtocolError;
pub use events::{emit_json, EventBus, EventChannel, TopicEvent};
