//! Signaling bus for stores that cannot push changes.
//!
//! Each watched document gets one poll task that re-reads it at a fixed
//! interval and forwards whatever differs from the last known content. Writes
//! made through the relay itself move that baseline and reach local watchers
//! right away, so a remote change landing within one interval of them still
//! differs from what the poller compares against. Collections are polled per
//! subscription and diffed by item id.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::mpsc;

use super::error::{RelayError, Result};
use super::traits::{
    CollectionItem, Document, DocumentChange, DocumentRelay, DocumentStore, Subscription,
};
use crate::config::RelayConfig;

/// Last known content of a watched document and who is watching it.
struct WatchedDocument {
    last: Option<Document>,
    /// Bumped by every local write; a poll read that straddles one is dropped.
    version: u64,
    watchers: Vec<mpsc::UnboundedSender<DocumentChange>>,
}

impl WatchedDocument {
    fn publish(&mut self, key: &str, current: Option<Document>) {
        if current == self.last {
            return;
        }
        let change = DocumentChange {
            key: key.to_string(),
            document: current.clone(),
        };
        self.watchers.retain(|tx| tx.send(change.clone()).is_ok());
        self.last = current;
    }
}

type Watched = Arc<DashMap<String, WatchedDocument>>;

pub struct PollingRelay<S> {
    store: Arc<S>,
    poll_interval: Duration,
    documents: Watched,
}

impl<S: DocumentStore + 'static> PollingRelay<S> {
    pub fn new(store: S, config: &RelayConfig) -> Self {
        Self {
            store: Arc::new(store),
            poll_interval: config.poll_interval(),
            documents: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Record a write made through this relay.
    fn wrote(&self, key: &str, current: Option<Document>) {
        if let Some(mut watched) = self.documents.get_mut(key) {
            watched.version += 1;
            watched.publish(key, current);
        }
    }

    async fn poll_document(store: Arc<S>, documents: Watched, key: String, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            let version = match documents.get_mut(&key) {
                Some(mut watched) => {
                    watched.watchers.retain(|tx| !tx.is_closed());
                    (!watched.watchers.is_empty()).then_some(watched.version)
                }
                None => None,
            };
            let Some(version) = version else {
                if documents
                    .remove_if(&key, |_, watched| watched.watchers.is_empty())
                    .is_none()
                    && documents.contains_key(&key)
                {
                    // subscribed again in between
                    continue;
                }
                break;
            };

            let current = match store.get(&key).await {
                Ok(current) => current,
                Err(e) => {
                    warn!("Polling {key} failed: {e}");
                    continue;
                }
            };
            if let Some(mut watched) = documents.get_mut(&key)
                && watched.version == version
            {
                watched.publish(&key, current);
            }
        }
        debug!("Stopped polling document {key}");
    }

    async fn poll_collection(
        store: Arc<S>,
        collection: String,
        mut seen: HashSet<String>,
        interval: Duration,
        tx: mpsc::UnboundedSender<CollectionItem>,
    ) {
        'poll: loop {
            tokio::time::sleep(interval).await;
            if tx.is_closed() {
                break;
            }
            let items = match store.list(&collection).await {
                Ok(items) => items,
                Err(e) => {
                    warn!("Polling collection {collection} failed: {e}");
                    continue;
                }
            };
            for (id, item) in items {
                if !seen.insert(id.clone()) {
                    continue;
                }
                let item = CollectionItem {
                    collection: collection.clone(),
                    id,
                    item,
                };
                if tx.send(item).is_err() {
                    break 'poll;
                }
            }
        }
        debug!("Stopped polling collection {collection}");
    }
}

#[async_trait]
impl<S: DocumentStore + 'static> DocumentRelay for PollingRelay<S> {
    async fn put(&self, key: &str, doc: Document) -> Result<()> {
        self.store.put(key, &doc).await?;
        self.wrote(key, Some(doc));
        Ok(())
    }

    /// Read-modify-write. Two racing updates may lose one of the patches,
    /// which stays within last-write-wins.
    async fn update(&self, key: &str, patch: Document) -> Result<()> {
        let mut doc = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| RelayError::NotFound(key.to_string()))?;
        doc.extend(patch);
        self.store.put(key, &doc).await?;
        self.wrote(key, Some(doc));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.delete(key).await?;
        self.wrote(key, None);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Document>> {
        self.store.get(key).await
    }

    async fn append(&self, collection: &str, item: Document) -> Result<String> {
        self.store.append(collection, &item).await
    }

    async fn delete_collection(&self, collection: &str) -> Result<()> {
        self.store.delete_collection(collection).await
    }

    async fn subscribe_document(&self, key: &str) -> Result<Subscription<DocumentChange>> {
        let (tx, sub) = Subscription::channel();
        let initial = self.store.get(key).await?;
        let _ = tx.send(DocumentChange {
            key: key.to_string(),
            document: initial.clone(),
        });

        let mut spawn_poller = false;
        self.documents
            .entry(key.to_string())
            .and_modify(|watched| {
                watched.publish(key, initial.clone());
                watched.watchers.push(tx.clone());
            })
            .or_insert_with(|| {
                spawn_poller = true;
                WatchedDocument {
                    last: initial.clone(),
                    version: 0,
                    watchers: vec![tx.clone()],
                }
            });
        if spawn_poller {
            tokio::spawn(Self::poll_document(
                self.store.clone(),
                self.documents.clone(),
                key.to_string(),
                self.poll_interval,
            ));
        }
        Ok(sub)
    }

    async fn subscribe_collection(
        &self,
        collection: &str,
    ) -> Result<Subscription<CollectionItem>> {
        let (tx, sub) = Subscription::channel();
        let mut seen = HashSet::new();
        for (id, item) in self.store.list(collection).await? {
            seen.insert(id.clone());
            let _ = tx.send(CollectionItem {
                collection: collection.to_string(),
                id,
                item,
            });
        }
        tokio::spawn(Self::poll_collection(
            self.store.clone(),
            collection.to_string(),
            seen,
            self.poll_interval,
            tx,
        ));
        Ok(sub)
    }
}
