use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;

use super::error::{RelayError, Result};
use super::traits::{Document, DocumentStore};

/// Documents as JSON files under a base directory.
///
/// `calls/c1` lives at `<base>/calls/c1.json`; the items of the collection
/// `calls/c1/candidates` live in `<base>/calls/c1/candidates/`, one file each,
/// named so that lexical order is insertion order. Several processes may share
/// one directory.
pub struct FileDocumentStore {
    base_path: PathBuf,
    last_seq: AtomicU64,
}

impl FileDocumentStore {
    pub async fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let base_path = path.into();
        fs::create_dir_all(&base_path).await?;
        Ok(Self {
            base_path,
            last_seq: AtomicU64::new(0),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn sanitize_filename(key: &str) -> String {
        let name = key.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-', "_");
        if name.chars().all(|c| c == '.') {
            return "_".repeat(name.len());
        }
        name
    }

    fn dir_for(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|segment| !segment.is_empty())
            .fold(self.base_path.clone(), |path, segment| {
                path.join(Self::sanitize_filename(segment))
            })
    }

    fn document_path(&self, key: &str) -> PathBuf {
        let mut path = self.dir_for(key).into_os_string();
        path.push(".json");
        PathBuf::from(path)
    }

    /// Microsecond clock, bumped so ids from this process never repeat or go
    /// backwards.
    fn next_seq(&self) -> u64 {
        let now = Utc::now().timestamp_micros().max(0) as u64;
        let mut current = self.last_seq.load(Ordering::SeqCst);
        loop {
            let next = now.max(current + 1);
            match self.last_seq.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    async fn read_json(&self, path: &Path) -> Result<Option<Document>> {
        match fs::read(path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RelayError::Io(e)),
        }
    }

    /// Write through a temp file so pollers never observe half a document.
    async fn write_json(&self, path: &Path, value: &Document) -> Result<()> {
        let data = serde_json::to_vec_pretty(value)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let suffix: [u8; 4] = rand::random();
        let tmp = path.with_extension(format!("tmp-{}", hex::encode(suffix)));
        fs::write(&tmp, data).await?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(RelayError::Io(e));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn put(&self, key: &str, doc: &Document) -> Result<()> {
        self.write_json(&self.document_path(key), doc).await
    }

    async fn get(&self, key: &str) -> Result<Option<Document>> {
        self.read_json(&self.document_path(key)).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        fs::remove_file(self.document_path(key))
            .await
            .or_else(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(e)
                }
            })
            .map_err(RelayError::from)
    }

    async fn append(&self, collection: &str, item: &Document) -> Result<String> {
        let suffix: [u8; 4] = rand::random();
        let id = format!("{:020}-{}", self.next_seq(), hex::encode(suffix));
        let path = self.dir_for(collection).join(format!("{id}.json"));
        self.write_json(&path, item).await?;
        Ok(id)
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Document)>> {
        let dir = self.dir_for(collection);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RelayError::Io(e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();

        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            // removed between listing and reading
            if let Some(item) = self.read_json(&dir.join(format!("{id}.json"))).await? {
                items.push((id, item));
            }
        }
        Ok(items)
    }

    async fn delete_collection(&self, collection: &str) -> Result<()> {
        match fs::remove_dir_all(self.dir_for(collection)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(RelayError::Io(e)),
            _ => Ok(()),
        }
    }
}
