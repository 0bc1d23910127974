use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::Stream;
use tokio::sync::mpsc;

use super::error::Result;

pub use lumicore::signaling::Document;

/// Current content of a watched document. `None` means it was deleted or
/// never existed.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub key: String,
    pub document: Option<Document>,
}

/// An item appended to a watched collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionItem {
    pub collection: String,
    pub id: String,
    pub item: Document,
}

/// Live feed of relay notifications. Dropping it ends the subscription.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub fn channel() -> (mpsc::UnboundedSender<T>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Next notification, or `None` once the relay side went away.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

/// Remote document store with change notifications.
///
/// Delivery is at-least-once. Concurrent writes to one key resolve
/// last-write-wins. There is no ordering across keys.
#[async_trait]
pub trait DocumentRelay: Send + Sync {
    /// Create or replace the document at `key`.
    async fn put(&self, key: &str, doc: Document) -> Result<()>;

    /// Merge top-level fields into an existing document.
    /// Fails with [`RelayError::NotFound`](super::RelayError::NotFound) when absent.
    async fn update(&self, key: &str, patch: Document) -> Result<()>;

    /// Remove the document. Absence is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Document>>;

    /// Append to the collection at `collection`, returning the new item's id.
    async fn append(&self, collection: &str, item: Document) -> Result<String>;

    /// Drop every item of a collection.
    async fn delete_collection(&self, collection: &str) -> Result<()>;

    /// Emits the current state first, then every change.
    async fn subscribe_document(&self, key: &str) -> Result<Subscription<DocumentChange>>;

    /// Emits existing items first in insertion order, then each new item.
    async fn subscribe_collection(&self, collection: &str)
    -> Result<Subscription<CollectionItem>>;
}

/// Plain storage without notifications. [`PollingRelay`](super::PollingRelay)
/// turns one into a [`DocumentRelay`].
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put(&self, key: &str, doc: &Document) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Document>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn append(&self, collection: &str, item: &Document) -> Result<String>;
    /// Items in insertion order.
    async fn list(&self, collection: &str) -> Result<Vec<(String, Document)>>;
    async fn delete_collection(&self, collection: &str) -> Result<()>;
}
