use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    blob_store::BlobStore,
    error::{Error, Result},
    item::{Item, NewItem},
    item_db::ItemDb,
    tantivy_index::SearchIndex,
    worker::WorkerPool,
};

/// An uploaded file as received from a client.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub bytes: Vec<u8>,
    /// Title chosen by the user. Falls back to the file name.
    pub title: Option<String>,
}

/// Entry point for new items.
///
/// The record store is written first and is the only write whose failure
/// reaches the caller. The search index is updated afterwards on a best-effort
/// basis, and extraction happens later on the worker pool.
#[derive(Clone)]
pub struct IngestionPipeline {
    db: Arc<ItemDb>,
    index: Arc<SearchIndex>,
    blobs: Arc<BlobStore>,
    pool: WorkerPool,
}

impl IngestionPipeline {
    pub fn new(
        db: Arc<ItemDb>,
        index: Arc<SearchIndex>,
        blobs: Arc<BlobStore>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            db,
            index,
            blobs,
            pool,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Store an upload, create its placeholder and queue extraction.
    ///
    /// Returns the placeholder as soon as it is in the record store.
    /// A zero-byte file is still a file and is accepted.
    pub async fn ingest(&self, upload: Upload) -> Result<Item> {
        let title = upload
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(upload.file_name.trim())
            .to_string();
        if title.is_empty() {
            return Err(Error::validation("title is required"));
        }

        let db = Arc::clone(&self.db);
        let index = Arc::clone(&self.index);
        let blobs = Arc::clone(&self.blobs);
        let file_name = upload.file_name;
        let (item, bytes) = tokio::task::spawn_blocking(move || {
            let item = store_placeholder(&db, &blobs, &title, &file_name, &upload.bytes)?;
            project(&index, &item);
            Ok::<_, Error>((item, upload.bytes))
        })
        .await??;

        info!(id = item.id, title = %item.title, "upload queued for extraction");
        self.pool.submit(item.id, bytes);
        Ok(item)
    }

    /// Create a note typed in by hand. Nothing is extracted.
    pub async fn create(
        &self,
        title: &str,
        description: Option<String>,
    ) -> Result<Item> {
        let new = NewItem::manual(title, description)?;
        let db = Arc::clone(&self.db);
        let index = Arc::clone(&self.index);
        let item = tokio::task::spawn_blocking(move || {
            let item = db.create(new)?;
            project(&index, &item);
            Ok::<_, Error>(item)
        })
        .await??;

        info!(id = item.id, "item created");
        Ok(item)
    }

    pub async fn get(&self, id: u64) -> Result<Item> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || db.get(id))
            .await??
            .ok_or_else(|| Error::item_not_found(id))
    }
}

impl std::fmt::Debug for IngestionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionPipeline")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

fn store_placeholder(
    db: &ItemDb,
    blobs: &BlobStore,
    title: &str,
    file_name: &str,
    bytes: &[u8],
) -> Result<Item> {
    let blob = blobs.save(file_name, bytes)?;
    let new = NewItem::placeholder(title, blob.location)?;
    match db.create(new) {
        Ok(item) => Ok(item),
        Err(err) => {
            if let Err(cleanup) = blobs.remove(&blob.name) {
                warn!(name = %blob.name, error = %cleanup, "orphaned upload left behind");
            }
            Err(err)
        }
    }
}

/// Put a new item into the search index. Failures only delay searchability.
fn project(index: &SearchIndex, item: &Item) {
    if let Err(err) = index.upsert(item).and_then(|()| index.refresh()) {
        warn!(id = item.id, error = %err, "item not indexed");
    }
}
