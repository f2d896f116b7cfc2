//! Work queues and the message shapes that travel through them.

pub mod queue;
pub mod types;

pub use queue::{DispatchQueue, IngestQueue, WorkQueue};
pub use types::{DeliveryReceipt, MessageHeaders, OutgoingMessage, RawMessage};
