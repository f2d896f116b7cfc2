//! Deskmail core — models, configuration, persistence seams, credential
//! encryption, and the bounded work queues shared by channel adapters and
//! the ingestion/dispatch pipelines.

pub mod bus;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod models;
pub mod store;
pub mod utils;

pub use error::{ChannelError, StoreError};
