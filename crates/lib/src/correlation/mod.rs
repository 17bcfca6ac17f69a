//! Correlation of outbound requests with their asynchronous provider callbacks.

mod event;
mod store;

pub use event::{CallbackEvent, CallbackStatus, PendingRequest, RequestKind};
pub use store::{CorrelationStore, EntrySnapshot, PublishOutcome, WaitError};
