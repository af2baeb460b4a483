//! Processor and session events.
//!
//! Listeners subscribe to an [`EventBus`] and receive every [`SyncEvent`]
//! through their own channel. Subscribing or dropping a subscription never
//! affects work in progress.

mod bus;
mod event;

pub use bus::{EventBus, Subscription};
pub use event::{SyncEvent, UploadState};
