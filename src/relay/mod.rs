//! Document relay client.
//!
//! A relay stores JSON documents by key, keeps append-only child collections
//! and pushes live change notifications to subscribers. Calls use it as their
//! only signaling channel.

pub mod error;
pub mod filestore;
pub mod memory;
pub mod polling;
pub mod traits;

pub use error::{RelayError, Result};
pub use filestore::FileDocumentStore;
pub use memory::InMemoryRelay;
pub use polling::PollingRelay;
pub use traits::{CollectionItem, Document, DocumentChange, DocumentRelay, DocumentStore, Subscription};
