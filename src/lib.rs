//! sift - capture notes and documents, triage them, and search them.
//!
//! Items live in an embedded [redb](https://github.com/cberner/redb) record
//! store, which is the source of truth, and are projected into a
//! [Tantivy](https://github.com/quickwit-oss/tantivy) index for fuzzy
//! full-text search. Uploaded files are converted to text in the background
//! by an external extraction service (Apache Tika style) and sorted into
//! Getting-Things-Done categories.
//!
//! # Quick start
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use sift::{AppState, BlobStore, DataDir, ItemDb, SearchIndex};
//! use sift::extractor::{DEFAULT_EXTRACTOR_URL, TikaExtractor};
//! use sift::worker::{ExtractionWorker, WorkerPool};
//!
//! # async fn run() -> sift::Result<()> {
//! let data_dir = DataDir::resolve(None)?;
//! let db = Arc::new(ItemDb::open(&data_dir.items_db())?);
//! let index = Arc::new(SearchIndex::open(&data_dir.tantivy_dir()?)?);
//! let blobs = Arc::new(BlobStore::new(data_dir.uploads_dir()?, None));
//!
//! let timeout = Duration::from_secs(30);
//! let extractor = Arc::new(TikaExtractor::new(DEFAULT_EXTRACTOR_URL, timeout)?);
//! let worker = ExtractionWorker::new(db.clone(), index.clone(), extractor, timeout);
//! let state = AppState::new(db, index, blobs, WorkerPool::new(worker, 4));
//!
//! state.pipeline.create("Call the bank", None).await?;
//! let page = state.query.search("bank".into(), 0, None, vec![]).await?;
//! for item in &page.items {
//!     println!("#{} {}", item.id, item.title);
//! }
//! # Ok(())
//! # }
//! ```

pub mod blob_store;
pub mod data_dir;
pub mod error;
pub mod extractor;
pub mod item;
pub mod item_db;
pub mod pipeline;
pub mod query;
pub mod sanitize;
pub mod server;
pub mod tantivy_index;
pub mod triage;
pub mod worker;

pub use blob_store::BlobStore;
pub use data_dir::DataDir;
pub use error::{Error, Result};
pub use item::{Category, Item, ItemPatch, Status};
pub use item_db::ItemDb;
pub use server::AppState;
pub use tantivy_index::SearchIndex;
