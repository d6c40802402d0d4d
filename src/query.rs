use std::sync::Arc;

use serde::Serialize;

use crate::{
    error::Result,
    item::{Category, Item},
    item_db::{ItemDb, ListFilter, PAGE_SIZE},
    tantivy_index::{IndexQuery, SearchIndex},
};

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
    pub items: Vec<Item>,
    /// Size of the whole filtered set, not just this page.
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

impl Page {
    fn new(items: Vec<Item>, total: usize, page: usize) -> Self {
        Self {
            items,
            total,
            page,
            limit: PAGE_SIZE,
        }
    }
}

/// Read side: listings come from the record store, full-text search from
/// the index.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    db: Arc<ItemDb>,
    index: Arc<SearchIndex>,
}

impl QueryEngine {
    pub fn new(db: Arc<ItemDb>, index: Arc<SearchIndex>) -> Self {
        Self { db, index }
    }

    /// Newest-first listing. `tags` keeps items sharing at least one tag.
    pub async fn list(
        &self,
        page: usize,
        category: Option<Category>,
        tags: Vec<String>,
    ) -> Result<Page> {
        let db = Arc::clone(&self.db);
        let filter = ListFilter { category, tags };
        let (items, total) =
            tokio::task::spawn_blocking(move || db.list(&filter, page)).await??;
        Ok(Page::new(items, total, page))
    }

    /// Fuzzy full-text search, newest first. Reflects the index, which may
    /// lag behind the record store.
    pub async fn search(
        &self,
        query: String,
        page: usize,
        category: Option<Category>,
        tags: Vec<String>,
    ) -> Result<Page> {
        let index = Arc::clone(&self.index);
        let (items, total) = tokio::task::spawn_blocking(move || {
            index.search(&IndexQuery {
                text: &query,
                category,
                tags: &tags,
                page,
            })
        })
        .await??;
        Ok(Page::new(items, total, page))
    }
}
