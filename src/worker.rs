//! Background extraction of uploaded files.
//!
//! Each upload gets one [`ExtractionWorker::run`], scheduled on a
//! [`WorkerPool`] that bounds how many runs talk to the extraction service
//! at once. Runs never report errors to anyone: the outcome is recorded on
//! the item (`status = done` or `failed`) and logged.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Error, Result},
    extractor::ContentExtractor,
    item::Item,
    item_db::ItemDb,
    sanitize::sanitize,
    tantivy_index::SearchIndex,
};

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Maximum number of extractions running at the same time.
    pub workers: usize,
    /// Upper bound for one call to the extraction service.
    pub timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Turns one queued placeholder into a finished item.
pub struct ExtractionWorker {
    db: Arc<ItemDb>,
    index: Arc<SearchIndex>,
    extractor: Arc<dyn ContentExtractor>,
    timeout: Duration,
}

impl ExtractionWorker {
    pub fn new(
        db: Arc<ItemDb>,
        index: Arc<SearchIndex>,
        extractor: Arc<dyn ContentExtractor>,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            index,
            extractor,
            timeout,
        }
    }

    /// Extract, sanitize and record the text for item `id`.
    ///
    /// On failure the item is marked `failed` in the record store only; the
    /// index keeps its placeholder.
    pub async fn run(&self, id: u64, bytes: Vec<u8>) {
        debug!(id, size = bytes.len(), "extraction started");
        match self.complete(id, bytes).await {
            Ok(item) => info!(
                id,
                chars = item.description.as_deref().map_or(0, |d| d.chars().count()),
                "extraction done"
            ),
            Err(err) => {
                error!(id, error = %err, "extraction failed");
                self.record_failure(id).await;
            }
        }
    }

    async fn complete(&self, id: u64, bytes: Vec<u8>) -> Result<Item> {
        let raw = tokio::time::timeout(self.timeout, self.extractor.extract(bytes))
            .await
            .map_err(|_| {
                Error::Upstream(format!(
                    "timed out after {}s",
                    self.timeout.as_secs_f32()
                ))
            })??;

        let db = Arc::clone(&self.db);
        let index = Arc::clone(&self.index);
        tokio::task::spawn_blocking(move || -> Result<Item> {
            let text = sanitize(&raw);
            let item = db.complete_extraction(id, &text)?;
            if let Err(err) = mirror_extraction(&index, &item) {
                warn!(id, error = %err, "search index lags behind extraction");
            }
            Ok(item)
        })
        .await?
    }

    async fn record_failure(&self, id: u64) {
        let db = Arc::clone(&self.db);
        match tokio::task::spawn_blocking(move || db.fail_extraction(id)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                error!(id, error = %err, "could not record extraction failure")
            }
            Err(err) => {
                error!(id, error = %err, "could not record extraction failure")
            }
        }
    }
}

/// Copy the three fields extraction changes into the index document.
fn mirror_extraction(index: &SearchIndex, item: &Item) -> Result<()> {
    index.update(item.id, |doc| {
        doc.description = item.description.clone();
        doc.processing = item.processing;
        doc.status = item.status;
    })?;
    index.refresh()
}

struct PoolState {
    worker: ExtractionWorker,
    permits: Semaphore,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Decrements the in-flight count when a run ends, even by panic.
struct InFlightGuard(Arc<PoolState>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Bounded pool of extraction runs.
#[derive(Clone)]
pub struct WorkerPool {
    state: Arc<PoolState>,
    workers: usize,
}

impl WorkerPool {
    pub fn new(worker: ExtractionWorker, workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            state: Arc::new(PoolState {
                worker,
                permits: Semaphore::new(workers),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
            workers,
        }
    }

    /// Schedule a run for `id`. Returns immediately; the run waits for a
    /// permit in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, id: u64, bytes: Vec<u8>) {
        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard(Arc::clone(&self.state));

        tokio::spawn(async move {
            let state = Arc::clone(&guard.0);
            // The semaphore is never closed, so acquire only fails on a bug.
            match state.permits.acquire().await {
                Ok(_permit) => state.worker.run(id, bytes).await,
                Err(err) => error!(id, error = %err, "worker pool closed"),
            }
            drop(guard);
        });
    }

    /// Runs submitted and not yet finished, including those waiting for a
    /// permit.
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Resolve once no run is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        item::{NewItem, Status},
        tantivy_index::IndexQuery,
    };

    struct StaticExtractor(&'static str);

    #[async_trait]
    impl ContentExtractor for StaticExtractor {
        async fn extract(&self, _bytes: Vec<u8>) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct FailingExtractor;

    #[async_trait]
    impl ContentExtractor for FailingExtractor {
        async fn extract(&self, _bytes: Vec<u8>) -> Result<String> {
            Err(Error::Upstream("connection refused".into()))
        }
    }

    struct SlowExtractor(Duration);

    #[async_trait]
    impl ContentExtractor for SlowExtractor {
        async fn extract(&self, _bytes: Vec<u8>) -> Result<String> {
            tokio::time::sleep(self.0).await;
            Ok("too late".into())
        }
    }

    /// Records the highest number of overlapping calls.
    #[derive(Default)]
    struct CountingExtractor {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ContentExtractor for CountingExtractor {
        async fn extract(&self, _bytes: Vec<u8>) -> Result<String> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok("counted".into())
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        db: Arc<ItemDb>,
        index: Arc<SearchIndex>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let db = Arc::new(ItemDb::open(&tmp.path().join("items.redb")).unwrap());
            let index = Arc::new(SearchIndex::open_in_ram().unwrap());
            Self {
                _tmp: tmp,
                db,
                index,
            }
        }

        fn placeholder(&self, title: &str) -> Item {
            let item = self
                .db
                .create(NewItem::placeholder(title, format!("/uploads/{title}")).unwrap())
                .unwrap();
            self.index.upsert(&item).unwrap();
            self.index.refresh().unwrap();
            item
        }

        fn worker(&self, extractor: impl ContentExtractor + 'static) -> ExtractionWorker {
            self.worker_with_timeout(extractor, DEFAULT_TIMEOUT)
        }

        fn worker_with_timeout(
            &self,
            extractor: impl ContentExtractor + 'static,
            timeout: Duration,
        ) -> ExtractionWorker {
            ExtractionWorker::new(
                Arc::clone(&self.db),
                Arc::clone(&self.index),
                Arc::new(extractor),
                timeout,
            )
        }
    }

    #[tokio::test]
    async fn success_updates_store_and_index() {
        let fx = Fixture::new();
        let item = fx.placeholder("scan.pdf");
        let worker = fx.worker(StaticExtractor(
            "Author: someone\n<p>Invoice total &amp; due date</p>",
        ));

        worker.run(item.id, b"%PDF".to_vec()).await;

        let stored = fx.db.get(item.id).unwrap().unwrap();
        assert_eq!(stored.status, Some(Status::Done));
        assert!(!stored.processing);
        assert_eq!(stored.description.as_deref(), Some("Invoice total due date"));

        let indexed = fx.index.get(item.id).unwrap().unwrap();
        assert_eq!(indexed, stored);

        let query = IndexQuery {
            text: "invoice",
            ..Default::default()
        };
        assert_eq!(fx.index.search(&query).unwrap().1, 1);
    }

    #[tokio::test]
    async fn failure_marks_store_and_leaves_index_placeholder() {
        let fx = Fixture::new();
        let item = fx.placeholder("broken.bin");

        fx.worker(FailingExtractor).run(item.id, vec![0]).await;

        let stored = fx.db.get(item.id).unwrap().unwrap();
        assert_eq!(stored.status, Some(Status::Failed));
        assert!(!stored.processing);
        assert!(stored.description.is_none());

        let indexed = fx.index.get(item.id).unwrap().unwrap();
        assert!(indexed.processing);
        assert_eq!(indexed.status, Some(Status::Queued));
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let fx = Fixture::new();
        let item = fx.placeholder("slow.pdf");
        let worker = fx.worker_with_timeout(
            SlowExtractor(Duration::from_secs(10)),
            Duration::from_millis(50),
        );

        worker.run(item.id, vec![0]).await;

        let stored = fx.db.get(item.id).unwrap().unwrap();
        assert_eq!(stored.status, Some(Status::Failed));
    }

    #[tokio::test]
    async fn finished_items_are_not_overwritten() {
        let fx = Fixture::new();
        let item = fx.placeholder("twice.pdf");

        fx.worker(FailingExtractor).run(item.id, vec![0]).await;
        fx.worker(StaticExtractor("late text")).run(item.id, vec![0]).await;

        let stored = fx.db.get(item.id).unwrap().unwrap();
        assert_eq!(stored.status, Some(Status::Failed));
        assert!(stored.description.is_none());
    }

    #[tokio::test]
    async fn missing_index_document_does_not_fail_extraction() {
        let fx = Fixture::new();
        let item = fx
            .db
            .create(NewItem::placeholder("unindexed", "/uploads/u".into()).unwrap())
            .unwrap();

        fx.worker(StaticExtractor("text")).run(item.id, vec![0]).await;

        let stored = fx.db.get(item.id).unwrap().unwrap();
        assert_eq!(stored.status, Some(Status::Done));
        assert!(fx.index.get(item.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn pool_bounds_concurrency_and_drains() {
        let fx = Fixture::new();
        let extractor = Arc::new(CountingExtractor::default());
        let worker = ExtractionWorker::new(
            Arc::clone(&fx.db),
            Arc::clone(&fx.index),
            Arc::clone(&extractor) as Arc<dyn ContentExtractor>,
            DEFAULT_TIMEOUT,
        );
        let pool = WorkerPool::new(worker, 2);

        let ids: Vec<u64> = (0..6)
            .map(|i| fx.placeholder(&format!("f{i}")).id)
            .collect();
        for id in &ids {
            pool.submit(*id, vec![1]);
        }
        assert_eq!(pool.in_flight(), 6);

        pool.wait_idle().await;
        assert_eq!(pool.in_flight(), 0);
        assert!(extractor.peak.load(Ordering::SeqCst) <= 2);

        for id in ids {
            let stored = fx.db.get(id).unwrap().unwrap();
            assert_eq!(stored.status, Some(Status::Done));
        }
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_without_work() {
        let fx = Fixture::new();
        let pool = WorkerPool::new(fx.worker(FailingExtractor), 0);
        assert_eq!(pool.workers(), 1);
        tokio::time::timeout(Duration::from_secs(1), pool.wait_idle())
            .await
            .unwrap();
    }
}
