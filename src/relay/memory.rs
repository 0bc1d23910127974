use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use log::debug;
use tokio::sync::{Mutex, mpsc};

use super::error::{RelayError, Result};
use super::traits::{CollectionItem, Document, DocumentChange, DocumentRelay, Subscription};

#[derive(Default)]
struct RelayState {
    documents: HashMap<String, Document>,
    collections: HashMap<String, Vec<(String, Document)>>,
    document_watchers: HashMap<String, Vec<mpsc::UnboundedSender<DocumentChange>>>,
    collection_watchers: HashMap<String, Vec<mpsc::UnboundedSender<CollectionItem>>>,
    next_item: u64,
}

impl RelayState {
    fn notify_document(&mut self, key: &str) {
        let change = DocumentChange {
            key: key.to_string(),
            document: self.documents.get(key).cloned(),
        };
        if let Some(watchers) = self.document_watchers.get_mut(key) {
            watchers.retain(|tx| tx.send(change.clone()).is_ok());
        }
    }

    fn notify_collection(&mut self, item: CollectionItem) {
        if let Some(watchers) = self.collection_watchers.get_mut(&item.collection) {
            watchers.retain(|tx| tx.send(item.clone()).is_ok());
        }
    }
}

/// Process-local relay. Clones share the same store, so two call sessions in
/// one process can signal each other through it.
#[derive(Clone, Default)]
pub struct InMemoryRelay {
    state: Arc<Mutex<RelayState>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every write fails with [`RelayError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Send the current state of `key` to its watchers again, as an
    /// at-least-once relay may.
    pub async fn redeliver(&self, key: &str) {
        self.state.lock().await.notify_document(key);
    }

    /// Send every stored item of `collection` to its watchers again.
    pub async fn redeliver_collection(&self, collection: &str) {
        let mut state = self.state.lock().await;
        let items = state.collections.get(collection).cloned().unwrap_or_default();
        for (id, item) in items {
            state.notify_collection(CollectionItem {
                collection: collection.to_string(),
                id,
                item,
            });
        }
    }

    /// Number of items currently stored under `collection`.
    pub async fn collection_len(&self, collection: &str) -> usize {
        self.state
            .lock()
            .await
            .collections
            .get(collection)
            .map_or(0, Vec::len)
    }

    fn check_writable(&self, key: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RelayError::Unavailable(format!("write to {key} rejected")));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentRelay for InMemoryRelay {
    async fn put(&self, key: &str, doc: Document) -> Result<()> {
        self.check_writable(key)?;
        let mut state = self.state.lock().await;
        state.documents.insert(key.to_string(), doc);
        state.notify_document(key);
        Ok(())
    }

    async fn update(&self, key: &str, patch: Document) -> Result<()> {
        self.check_writable(key)?;
        let mut state = self.state.lock().await;
        let doc = state
            .documents
            .get_mut(key)
            .ok_or_else(|| RelayError::NotFound(key.to_string()))?;
        doc.extend(patch);
        state.notify_document(key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_writable(key)?;
        let mut state = self.state.lock().await;
        if state.documents.remove(key).is_some() {
            state.notify_document(key);
        } else {
            debug!("delete of absent document {key}");
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Document>> {
        Ok(self.state.lock().await.documents.get(key).cloned())
    }

    async fn append(&self, collection: &str, item: Document) -> Result<String> {
        self.check_writable(collection)?;
        let mut state = self.state.lock().await;
        state.next_item += 1;
        let id = format!("{:08}", state.next_item);
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .push((id.clone(), item.clone()));
        state.notify_collection(CollectionItem {
            collection: collection.to_string(),
            id: id.clone(),
            item,
        });
        Ok(id)
    }

    async fn delete_collection(&self, collection: &str) -> Result<()> {
        self.check_writable(collection)?;
        self.state.lock().await.collections.remove(collection);
        Ok(())
    }

    async fn subscribe_document(&self, key: &str) -> Result<Subscription<DocumentChange>> {
        let (tx, sub) = Subscription::channel();
        let mut state = self.state.lock().await;
        let _ = tx.send(DocumentChange {
            key: key.to_string(),
            document: state.documents.get(key).cloned(),
        });
        state
            .document_watchers
            .entry(key.to_string())
            .or_default()
            .push(tx);
        Ok(sub)
    }

    async fn subscribe_collection(
        &self,
        collection: &str,
    ) -> Result<Subscription<CollectionItem>> {
        let (tx, sub) = Subscription::channel();
        let mut state = self.state.lock().await;
        if let Some(items) = state.collections.get(collection) {
            for (id, item) in items {
                let _ = tx.send(CollectionItem {
                    collection: collection.to_string(),
                    id: id.clone(),
                    item: item.clone(),
                });
            }
        }
        state
            .collection_watchers
            .entry(collection.to_string())
            .or_default()
            .push(tx);
        Ok(sub)
    }
}
