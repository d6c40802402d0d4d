use std::path::Path;

use chrono::{SubsecRound, Utc};
use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    ReadableTableMetadata,
    Table,
    TableDefinition,
};

use crate::{
    error::{Error, Result},
    item::{Category, CategoryCounts, Item, ItemPatch, NewItem, Status},
};

const ITEMS: TableDefinition<u64, &[u8]> = TableDefinition::new("items");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
/// Keyed by `(created_at micros, id)`, so a reverse scan is newest first.
const BY_CREATED: TableDefinition<(i64, u64), ()> =
    TableDefinition::new("items_by_created");
const CATEGORY_COUNTS: TableDefinition<&str, u64> =
    TableDefinition::new("category_counts");

const NEXT_ID: &str = "next_id";

/// Fixed page size for listings.
pub const PAGE_SIZE: usize = 10;

/// Filters for [`ItemDb::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub category: Option<Category>,
    /// Keep items carrying at least one of these tags. Empty means no filter.
    pub tags: Vec<String>,
}

impl ListFilter {
    fn is_empty(&self) -> bool {
        self.category.is_none() && self.tags.is_empty()
    }

    fn matches(&self, item: &Item) -> bool {
        if let Some(category) = self.category
            && item.category != category
        {
            return false;
        }
        self.tags.is_empty() || item.tags.iter().any(|t| self.tags.contains(t))
    }
}

/// The record-of-truth store for items.
pub struct ItemDb {
    db: Database,
}

impl ItemDb {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        // Ensure all tables exist by opening them in a write transaction.
        let txn = db.begin_write()?;
        txn.open_table(ITEMS)?;
        txn.open_table(META)?;
        txn.open_table(BY_CREATED)?;
        txn.open_table(CATEGORY_COUNTS)?;
        txn.commit()?;

        let db = Self { db };
        db.rebuild_secondary_if_stale()?;
        Ok(db)
    }

    /// Recompute the ordering and count tables from the rows when they have
    /// drifted, e.g. for a file written before those tables existed.
    fn rebuild_secondary_if_stale(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        let stale = {
            let items = txn.open_table(ITEMS)?;
            let by_created = txn.open_table(BY_CREATED)?;
            items.len()? != by_created.len()?
        };
        if !stale {
            txn.abort()?;
            return Ok(());
        }

        txn.delete_table(BY_CREATED)?;
        {
            let items = txn.open_table(ITEMS)?;
            let mut by_created = txn.open_table(BY_CREATED)?;
            let mut counts = CategoryCounts::default();
            for entry in items.iter()? {
                let (_k, v) = entry?;
                let item: Item = serde_json::from_slice(v.value())?;
                by_created.insert(created_key(&item), ())?;
                counts.bump(item.category);
            }

            let mut totals = txn.open_table(CATEGORY_COUNTS)?;
            for category in Category::ALL {
                totals.insert(category.as_str(), counts.get(category))?;
            }
        }
        txn.commit()?;
        tracing::info!("rebuilt item ordering and category counts");
        Ok(())
    }

    /// Insert a new row, assigning the next id and the creation time.
    pub fn create(&self, new: NewItem) -> Result<Item> {
        let txn = self.db.begin_write()?;
        let item = {
            let mut meta = txn.open_table(META)?;
            let id = meta.get(NEXT_ID)?.map(|v| v.value()).unwrap_or(1);
            meta.insert(NEXT_ID, id + 1)?;

            // Microseconds, matching what the search index can store.
            let item = new.into_item(id, Utc::now().trunc_subsecs(6));
            let mut items = txn.open_table(ITEMS)?;
            items.insert(id, serde_json::to_vec(&item)?.as_slice())?;
            txn.open_table(BY_CREATED)?.insert(created_key(&item), ())?;
            adjust_count(&mut txn.open_table(CATEGORY_COUNTS)?, item.category, 1)?;
            item
        };
        txn.commit()?;
        Ok(item)
    }

    pub fn get(&self, id: u64) -> Result<Option<Item>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ITEMS)?;
        match table.get(id)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// Read-modify-write one row inside a single write transaction.
    ///
    /// If `change` fails, nothing is written.
    pub fn modify<F>(&self, id: u64, change: F) -> Result<Item>
    where
        F: FnOnce(&mut Item) -> Result<()>,
    {
        let txn = self.db.begin_write()?;
        let item = {
            let mut table = txn.open_table(ITEMS)?;
            let mut item: Item = match table.get(id)? {
                Some(v) => serde_json::from_slice(v.value())?,
                None => return Err(Error::item_not_found(id)),
            };
            let before = (created_key(&item), item.category);
            change(&mut item)?;
            table.insert(id, serde_json::to_vec(&item)?.as_slice())?;

            if before.0 != created_key(&item) {
                let mut by_created = txn.open_table(BY_CREATED)?;
                by_created.remove(before.0)?;
                by_created.insert(created_key(&item), ())?;
            }
            if before.1 != item.category {
                let mut counts = txn.open_table(CATEGORY_COUNTS)?;
                adjust_count(&mut counts, before.1, -1)?;
                adjust_count(&mut counts, item.category, 1)?;
            }
            item
        };
        txn.commit()?;
        Ok(item)
    }

    /// Apply a triage patch.
    pub fn apply_patch(&self, id: u64, patch: &ItemPatch) -> Result<Item> {
        self.modify(id, |item| {
            patch.apply(item);
            Ok(())
        })
    }

    /// Record successful extraction: store the text and mark the item done.
    pub fn complete_extraction(&self, id: u64, text: &str) -> Result<Item> {
        self.finish(id, Status::Done, |item| {
            item.description = Some(text.to_string());
        })
    }

    /// Record failed extraction. The description is left alone.
    pub fn fail_extraction(&self, id: u64) -> Result<Item> {
        self.finish(id, Status::Failed, |_| {})
    }

    fn finish<F>(&self, id: u64, status: Status, extra: F) -> Result<Item>
    where
        F: FnOnce(&mut Item),
    {
        self.modify(id, |item| {
            if item.status != Some(Status::Queued) {
                return Err(Error::validation(format!(
                    "item {id} is not queued for extraction (status: {})",
                    item.status.map_or("none", Status::as_str)
                )));
            }
            extra(item);
            item.processing = false;
            item.status = Some(status);
            Ok(())
        })
    }

    /// All items, unordered.
    pub fn all(&self) -> Result<Vec<Item>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ITEMS)?;
        let mut result: Vec<Item> = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }

    /// One page of items, newest first, plus the size of the filtered set.
    ///
    /// Walks the creation-order table from the newest end. Without filters
    /// only the rows on the page are decoded.
    pub fn list(
        &self,
        filter: &ListFilter,
        page: usize,
    ) -> Result<(Vec<Item>, usize)> {
        let txn = self.db.begin_read()?;
        let items = txn.open_table(ITEMS)?;
        let by_created = txn.open_table(BY_CREATED)?;

        let load = |id: u64| -> Result<Item> {
            match items.get(id)? {
                Some(v) => Ok(serde_json::from_slice(v.value())?),
                None => Err(Error::item_not_found(id)),
            }
        };

        let Some(offset) = page.checked_mul(PAGE_SIZE) else {
            return Ok((Vec::new(), self.count_matching(filter)?));
        };

        if filter.is_empty() {
            let total = usize::try_from(by_created.len()?).unwrap_or(usize::MAX);
            let mut page_items = Vec::new();
            for entry in by_created.iter()?.rev().skip(offset).take(PAGE_SIZE) {
                let (key, _) = entry?;
                let (_created, id) = key.value();
                page_items.push(load(id)?);
            }
            return Ok((page_items, total));
        }

        let mut total = 0;
        let mut page_items = Vec::new();
        for entry in by_created.iter()?.rev() {
            let (key, _) = entry?;
            let (_created, id) = key.value();
            let item = load(id)?;
            if !filter.matches(&item) {
                continue;
            }
            if total >= offset && page_items.len() < PAGE_SIZE {
                page_items.push(item);
            }
            total += 1;
        }
        Ok((page_items, total))
    }

    fn count_matching(&self, filter: &ListFilter) -> Result<usize> {
        Ok(self.all()?.iter().filter(|item| filter.matches(item)).count())
    }

    pub fn count_by_category(&self) -> Result<CategoryCounts> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(CATEGORY_COUNTS)?;
        let mut counts = CategoryCounts::default();
        for category in Category::ALL {
            let n = table.get(category.as_str())?.map(|v| v.value()).unwrap_or(0);
            counts.add(category, n);
        }
        Ok(counts)
    }
}

fn created_key(item: &Item) -> (i64, u64) {
    (item.created_at.timestamp_micros(), item.id)
}

fn adjust_count(
    table: &mut Table<'_, &'static str, u64>,
    category: Category,
    delta: i64,
) -> Result<()> {
    let current = table.get(category.as_str())?.map(|v| v.value()).unwrap_or(0);
    let next = current.saturating_add_signed(delta);
    table.insert(category.as_str(), next)?;
    Ok(())
}

impl std::fmt::Debug for ItemDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemDb").finish_non_exhaustive()
    }
}
