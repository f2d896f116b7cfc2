//! Deskmail pipelines — everything between the channel adapters and the
//! store.
//!
//! - **resolver**: decide which conversation an inbound email belongs to
//! - **ingest**: worker pool draining the shared ingestion queue
//! - **dispatch**: feeder, stuck-message scanner and send workers
//! - **outbox**: agent replies as pending outgoing messages

pub mod dispatch;
pub mod ingest;
pub mod outbox;
pub mod resolver;

pub use dispatch::{Delivery, DispatchSettings, DispatchWaker, Dispatcher};
pub use ingest::{IngestCounts, IngestPipeline, IngestStats, Processed};
pub use outbox::{Outbox, OutboxError, ReplyDraft};
pub use resolver::{MatchedBy, Resolution, ThreadResolver};
