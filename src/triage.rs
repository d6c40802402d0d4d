//! Category transitions.
//!
//! Any category can move to any other; the inbox → bucket → inbox flow is a
//! convention of the calling surface. Tags, due date and the done flag are
//! kept when the category changes.

use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    error::{Error, Result},
    item::{Category, CategoryCounts, Item, ItemPatch},
    item_db::ItemDb,
    tantivy_index::SearchIndex,
};

#[derive(Debug, Clone)]
pub struct Triage {
    db: Arc<ItemDb>,
    index: Arc<SearchIndex>,
}

impl Triage {
    pub fn new(db: Arc<ItemDb>, index: Arc<SearchIndex>) -> Self {
        Self { db, index }
    }

    /// Move an item to `category`, applying any other fields in `updates`
    /// in the same write.
    pub async fn recategorize(
        &self,
        id: u64,
        category: Category,
        updates: ItemPatch,
    ) -> Result<Item> {
        let patch = ItemPatch {
            category: Some(category),
            ..updates
        };
        self.update(id, patch).await
    }

    /// Apply a partial update. The record store is written first; the index
    /// copy follows and may lag if that write fails.
    pub async fn update(&self, id: u64, patch: ItemPatch) -> Result<Item> {
        let db = Arc::clone(&self.db);
        let index = Arc::clone(&self.index);

        tokio::task::spawn_blocking(move || {
            if patch.is_empty() {
                return db.get(id)?.ok_or_else(|| Error::item_not_found(id));
            }

            let item = db.apply_patch(id, &patch)?;
            if let Err(err) = mirror_patch(&index, id, &patch) {
                warn!(id, error = %err, "search index lags behind triage");
            }
            info!(id, category = %item.category, "item triaged");
            Ok(item)
        })
        .await?
    }

    /// Items per category, from the record store.
    pub async fn counts(&self) -> Result<CategoryCounts> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || db.count_by_category()).await?
    }
}

fn mirror_patch(index: &SearchIndex, id: u64, patch: &ItemPatch) -> Result<()> {
    index.update(id, |doc| patch.apply(doc))?;
    index.refresh()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::{
        item::NewItem,
        item_db::ListFilter,
        tantivy_index::IndexQuery,
    };

    struct Fixture {
        _tmp: tempfile::TempDir,
        db: Arc<ItemDb>,
        index: Arc<SearchIndex>,
        triage: Triage,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let db = Arc::new(ItemDb::open(&tmp.path().join("items.redb")).unwrap());
        let index = Arc::new(SearchIndex::open_in_ram().unwrap());
        let triage = Triage::new(Arc::clone(&db), Arc::clone(&index));
        Fixture {
            _tmp: tmp,
            db,
            index,
            triage,
        }
    }

    impl Fixture {
        fn note(&self, title: &str) -> Item {
            let item = self.db.create(NewItem::manual(title, None).unwrap()).unwrap();
            self.index.upsert(&item).unwrap();
            self.index.refresh().unwrap();
            item
        }
    }

    #[tokio::test]
    async fn tags_and_due_date_survive_round_trips() {
        let fx = fixture();
        let item = fx.note("Tax return");
        let due = Utc.with_ymd_and_hms(2025, 4, 15, 0, 0, 0).unwrap();

        fx.triage
            .recategorize(
                item.id,
                Category::File,
                ItemPatch {
                    tags: Some(vec!["tax".into(), " 2024 ".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        fx.triage
            .recategorize(
                item.id,
                Category::Actionable,
                ItemPatch {
                    due_date: Some(Some(due)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let back = fx
            .triage
            .recategorize(item.id, Category::Inbox, ItemPatch::default())
            .await
            .unwrap();

        assert_eq!(back.category, Category::Inbox);
        assert_eq!(back.tags, vec!["tax".to_string(), "2024".to_string()]);
        assert_eq!(back.due_date, Some(due));
        assert_eq!(fx.index.get(item.id).unwrap(), Some(back));
    }

    #[tokio::test]
    async fn actionable_view_sees_due_date() {
        let fx = fixture();
        let item = fx.note("Renew passport");
        let due = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        fx.triage
            .recategorize(
                item.id,
                Category::Actionable,
                ItemPatch {
                    due_date: Some(Some(due)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let filter = ListFilter {
            category: Some(Category::Actionable),
            tags: vec![],
        };
        let (items, total) = fx.db.list(&filter, 0).unwrap();
        assert_eq!(total, 1);
        assert_eq!(items[0].due_date, Some(due));
    }

    #[tokio::test]
    async fn update_mirrors_into_index() {
        let fx = fixture();
        let item = fx.note("Quarterly taxes");

        fx.triage
            .update(
                item.id,
                ItemPatch {
                    category: Some(Category::File),
                    tags: Some(vec!["tax".into()]),
                    done: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let wanted = vec!["tax".to_string()];
        let query = IndexQuery {
            text: "quarterly",
            category: Some(Category::File),
            tags: &wanted,
            page: 0,
        };
        let (hits, total) = fx.index.search(&query).unwrap();
        assert_eq!(total, 1);
        assert!(hits[0].done);
    }

    #[tokio::test]
    async fn null_due_date_and_empty_tags_clear() {
        let fx = fixture();
        let item = fx.note("Dentist");
        fx.triage
            .update(
                item.id,
                ItemPatch {
                    tags: Some(vec!["health".into()]),
                    due_date: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let cleared = fx
            .triage
            .update(
                item.id,
                ItemPatch {
                    tags: Some(vec![]),
                    due_date: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(cleared.tags.is_empty());
        assert!(cleared.due_date.is_none());
    }

    #[tokio::test]
    async fn empty_patch_returns_item_unchanged() {
        let fx = fixture();
        let item = fx.note("Nothing to do");
        let same = fx.triage.update(item.id, ItemPatch::default()).await.unwrap();
        assert_eq!(same, item);
    }

    #[tokio::test]
    async fn missing_item_is_not_found() {
        let fx = fixture();
        let err = fx
            .triage
            .recategorize(9, Category::File, ItemPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        let err = fx.triage.update(9, ItemPatch::default()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn store_wins_when_index_document_is_missing() {
        let fx = fixture();
        let item = fx.db.create(NewItem::manual("unindexed", None).unwrap()).unwrap();

        let moved = fx
            .triage
            .recategorize(item.id, Category::Eliminate, ItemPatch::default())
            .await
            .unwrap();
        assert_eq!(moved.category, Category::Eliminate);
        assert_eq!(fx.db.get(item.id).unwrap().unwrap().category, Category::Eliminate);
    }

    #[tokio::test]
    async fn counts_come_from_the_store() {
        let fx = fixture();
        let a = fx.note("a");
        fx.note("b");
        fx.db.create(NewItem::manual("unindexed", None).unwrap()).unwrap();

        fx.triage
            .recategorize(a.id, Category::Incubate, ItemPatch::default())
            .await
            .unwrap();

        let counts = fx.triage.counts().await.unwrap();
        assert_eq!(counts.inbox, 2);
        assert_eq!(counts.incubate, 1);
        assert_eq!(counts.file, 0);
    }
}
