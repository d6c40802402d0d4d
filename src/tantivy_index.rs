use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use tantivy::{
    Index,
    IndexReader,
    IndexWriter,
    Order,
    ReloadPolicy,
    TantivyDocument,
    Term,
    collector::{Count, TopDocs},
    query::{
        AllQuery,
        BooleanQuery,
        BoostQuery,
        FuzzyTermQuery,
        Occur,
        Query,
        TermQuery,
    },
    schema::*,
    tokenizer::{
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
        TokenStream,
    },
};

use crate::{
    error::{Error, Result},
    item::{Category, Item, Status},
    item_db::PAGE_SIZE,
};

/// Field names used in the schema.
pub mod fields {
    pub const ID: &str = "id";
    pub const TITLE: &str = "title";
    pub const DESCRIPTION: &str = "description";
    pub const FILE_LOCATION: &str = "file_location";
    pub const PROCESSING: &str = "processing";
    pub const STATUS: &str = "status";
    pub const CATEGORY: &str = "category";
    pub const TAGS: &str = "tags";
    pub const DUE_DATE: &str = "due_date";
    pub const DONE: &str = "done";
    pub const CREATED_AT: &str = "created_at";
}

const WRITER_MEMORY_BUDGET: usize = 15_000_000;
const TITLE_BOOST: f32 = 2.0;

/// Search-side projection of the item table.
///
/// Every item field is stored, so hits are materialized straight from the
/// index without touching the record store. Writes are committed as they
/// happen; searches only see them after [`SearchIndex::refresh`].
pub struct SearchIndex {
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    fields: SchemaFields,
}

/// Resolved field handles for the schema.
#[derive(Clone, Copy)]
struct SchemaFields {
    id: Field,
    title: Field,
    description: Field,
    file_location: Field,
    processing: Field,
    status: Field,
    category: Field,
    tags: Field,
    due_date: Field,
    done: Field,
    created_at: Field,
}

/// Parameters for [`SearchIndex::search`].
#[derive(Debug, Clone, Default)]
pub struct IndexQuery<'a> {
    pub text: &'a str,
    pub category: Option<Category>,
    /// Match items carrying any of these tags. Empty means no filter.
    pub tags: &'a [String],
    pub page: usize,
}

fn build_schema() -> Schema {
    let mut builder = Schema::builder();

    builder.add_u64_field(fields::ID, INDEXED | STORED | FAST);

    let text_opts = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer("en_stem")
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored();
    builder.add_text_field(fields::TITLE, text_opts.clone());
    builder.add_text_field(fields::DESCRIPTION, text_opts);

    builder.add_text_field(fields::FILE_LOCATION, STRING | STORED);
    builder.add_bool_field(fields::PROCESSING, STORED);
    builder.add_text_field(fields::STATUS, STRING | STORED);
    builder.add_text_field(fields::CATEGORY, STRING | STORED | FAST);
    builder.add_text_field(fields::TAGS, STRING | STORED);
    builder.add_i64_field(fields::DUE_DATE, STORED);
    builder.add_bool_field(fields::DONE, STORED);
    builder.add_i64_field(fields::CREATED_AT, INDEXED | STORED | FAST);

    builder.build()
}

fn resolve_fields(schema: &Schema) -> Result<SchemaFields> {
    Ok(SchemaFields {
        id: schema.get_field(fields::ID)?,
        title: schema.get_field(fields::TITLE)?,
        description: schema.get_field(fields::DESCRIPTION)?,
        file_location: schema.get_field(fields::FILE_LOCATION)?,
        processing: schema.get_field(fields::PROCESSING)?,
        status: schema.get_field(fields::STATUS)?,
        category: schema.get_field(fields::CATEGORY)?,
        tags: schema.get_field(fields::TAGS)?,
        due_date: schema.get_field(fields::DUE_DATE)?,
        done: schema.get_field(fields::DONE)?,
        created_at: schema.get_field(fields::CREATED_AT)?,
    })
}

fn register_tokenizers(index: &Index) {
    let en_stem = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(tantivy::tokenizer::Language::English))
        .build();
    index.tokenizers().register("en_stem", en_stem);
}

/// Edit distance allowed for a query token, following Elasticsearch's
/// `fuzziness: AUTO`.
fn fuzziness(token: &str) -> u8 {
    match token.chars().count() {
        0..=2 => 0,
        3..=5 => 1,
        _ => 2,
    }
}

impl SearchIndex {
    /// Open or create a search index at the given directory.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let mmap_dir = tantivy::directory::MmapDirectory::open(dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?;
        let index = if Index::exists(&mmap_dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?
        {
            Index::open(mmap_dir)?
        } else {
            Index::create(
                mmap_dir,
                build_schema(),
                tantivy::IndexSettings::default(),
            )?
        };

        Self::from_index(index)
    }

    /// Create an in-memory search index (for testing).
    pub fn open_in_ram() -> Result<Self> {
        Self::from_index(Index::create_in_ram(build_schema()))
    }

    fn from_index(index: Index) -> Result<Self> {
        register_tokenizers(&index);
        let fields = resolve_fields(&index.schema())?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let writer = index.writer(WRITER_MEMORY_BUDGET)?;

        Ok(Self {
            index,
            reader,
            writer: Mutex::new(writer),
            fields,
        })
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, IndexWriter>> {
        self.writer.lock().map_err(|_| {
            tantivy::TantivyError::SystemError(
                "index writer lock poisoned".into(),
            )
            .into()
        })
    }

    /// Replace the whole document for `item.id`, committing immediately.
    pub fn upsert(&self, item: &Item) -> Result<()> {
        let mut writer = self.lock_writer()?;
        writer.delete_term(Term::from_field_u64(self.fields.id, item.id));
        writer.add_document(self.to_document(item))?;
        writer.commit()?;
        Ok(())
    }

    /// Change some fields of an indexed document and keep the rest as
    /// they are in the index.
    ///
    /// Fails with `NotFound` when the index has no document for `id`.
    pub fn update<F>(&self, id: u64, change: F) -> Result<Item>
    where
        F: FnOnce(&mut Item),
    {
        let mut writer = self.lock_writer()?;
        self.reader.reload()?;
        let mut item = self
            .lookup(&self.reader.searcher(), id)?
            .ok_or_else(|| Error::NotFound {
                kind: "index document",
                name: id.to_string(),
            })?;

        change(&mut item);

        writer.delete_term(Term::from_field_u64(self.fields.id, id));
        writer.add_document(self.to_document(&item))?;
        writer.commit()?;
        Ok(item)
    }

    /// Make committed writes visible to subsequent searches.
    pub fn refresh(&self) -> Result<()> {
        self.reader.reload()?;
        Ok(())
    }

    /// The indexed projection of one item, as searches currently see it.
    pub fn get(&self, id: u64) -> Result<Option<Item>> {
        self.lookup(&self.reader.searcher(), id)
    }

    fn lookup(
        &self,
        searcher: &tantivy::Searcher,
        id: u64,
    ) -> Result<Option<Item>> {
        let query = TermQuery::new(
            Term::from_field_u64(self.fields.id, id),
            IndexRecordOption::Basic,
        );
        let hits = searcher.search(&query, &TopDocs::with_limit(1))?;
        match hits.first() {
            Some((_score, address)) => {
                let doc: TantivyDocument = searcher.doc(*address)?;
                Ok(Some(self.to_item(&doc)))
            }
            None => Ok(None),
        }
    }

    /// Fuzzy search with filters, newest first.
    ///
    /// Each query token matches `title` (boosted) or `description` within
    /// an edit distance that grows with token length. Results are sorted by
    /// `created_at`, not by score. Returns the page of items and the total
    /// number of matches.
    pub fn search(&self, query: &IndexQuery<'_>) -> Result<(Vec<Item>, usize)> {
        let f = self.fields;
        let mut must: Vec<(Occur, Box<dyn Query>)> = Vec::new();

        if !query.text.trim().is_empty() {
            match self.text_query(query.text)? {
                Some(text) => must.push((Occur::Must, text)),
                // Nothing searchable survived tokenization.
                None => return Ok((Vec::new(), 0)),
            }
        }

        if let Some(category) = query.category {
            let term = Term::from_field_text(f.category, category.as_str());
            must.push((
                Occur::Must,
                Box::new(TermQuery::new(term, IndexRecordOption::Basic)),
            ));
        }

        if !query.tags.is_empty() {
            let any_tag: Vec<(Occur, Box<dyn Query>)> = query
                .tags
                .iter()
                .map(|tag| {
                    let term = Term::from_field_text(f.tags, tag);
                    let q: Box<dyn Query> = Box::new(TermQuery::new(
                        term,
                        IndexRecordOption::Basic,
                    ));
                    (Occur::Should, q)
                })
                .collect();
            must.push((Occur::Must, Box::new(BooleanQuery::new(any_tag))));
        }

        let final_query: Box<dyn Query> = if must.is_empty() {
            Box::new(AllQuery)
        } else {
            Box::new(BooleanQuery::new(must))
        };

        let searcher = self.reader.searcher();

        // TopDocs allocates limit + offset up front, so pages past the end
        // of the index only count.
        let offset = query
            .page
            .checked_mul(PAGE_SIZE)
            .filter(|&offset| (offset as u64) < searcher.num_docs());
        let Some(offset) = offset else {
            let total = searcher.search(&*final_query, &Count)?;
            return Ok((Vec::new(), total));
        };

        let newest_first = TopDocs::with_limit(PAGE_SIZE)
            .and_offset(offset)
            .order_by_fast_field::<i64>(fields::CREATED_AT, Order::Desc);
        let (total, hits) =
            searcher.search(&*final_query, &(Count, newest_first))?;

        let mut items = Vec::with_capacity(hits.len());
        for (_created_at, address) in hits {
            let doc: TantivyDocument = searcher.doc(address)?;
            items.push(self.to_item(&doc));
        }

        tracing::debug!(
            text = query.text,
            category = ?query.category,
            total,
            "index search"
        );
        Ok((items, total))
    }

    fn text_query(&self, text: &str) -> Result<Option<Box<dyn Query>>> {
        let f = self.fields;
        let mut analyzer = self.index.tokenizer_for_field(f.title)?;
        let mut stream = analyzer.token_stream(text);

        let mut should: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        while stream.advance() {
            let token = stream.token().text.as_str();
            let distance = fuzziness(token);

            let title = FuzzyTermQuery::new(
                Term::from_field_text(f.title, token),
                distance,
                true,
            );
            should.push((
                Occur::Should,
                Box::new(BoostQuery::new(Box::new(title), TITLE_BOOST)),
            ));

            let description = FuzzyTermQuery::new(
                Term::from_field_text(f.description, token),
                distance,
                true,
            );
            should.push((Occur::Should, Box::new(description)));
        }

        if should.is_empty() {
            return Ok(None);
        }
        Ok(Some(Box::new(BooleanQuery::new(should))))
    }

    fn to_document(&self, item: &Item) -> TantivyDocument {
        let f = self.fields;
        let mut doc = TantivyDocument::default();

        doc.add_u64(f.id, item.id);
        doc.add_text(f.title, &item.title);
        if let Some(description) = &item.description {
            doc.add_text(f.description, description);
        }
        if let Some(location) = &item.file_location {
            doc.add_text(f.file_location, location);
        }
        doc.add_bool(f.processing, item.processing);
        if let Some(status) = item.status {
            doc.add_text(f.status, status.as_str());
        }
        doc.add_text(f.category, item.category.as_str());
        for tag in &item.tags {
            doc.add_text(f.tags, tag);
        }
        if let Some(due) = item.due_date {
            doc.add_i64(f.due_date, due.timestamp_micros());
        }
        doc.add_bool(f.done, item.done);
        doc.add_i64(f.created_at, item.created_at.timestamp_micros());

        doc
    }

    fn to_item(&self, doc: &TantivyDocument) -> Item {
        let f = self.fields;
        Item {
            id: doc.get_first(f.id).and_then(|v| v.as_u64()).unwrap_or(0),
            title: extract_text(doc, f.title).unwrap_or_default(),
            description: extract_text(doc, f.description),
            file_location: extract_text(doc, f.file_location),
            processing: extract_bool(doc, f.processing),
            status: extract_text(doc, f.status)
                .and_then(|s| Status::parse(&s)),
            category: extract_text(doc, f.category)
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            tags: doc
                .get_all(f.tags)
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            due_date: extract_micros(doc, f.due_date),
            done: extract_bool(doc, f.done),
            created_at: extract_micros(doc, f.created_at).unwrap_or_default(),
        }
    }
}

impl std::fmt::Debug for SearchIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchIndex").finish_non_exhaustive()
    }
}

fn extract_text(doc: &TantivyDocument, field: Field) -> Option<String> {
    doc.get_first(field)
        .and_then(|v| v.as_str().map(str::to_string))
}

fn extract_bool(doc: &TantivyDocument, field: Field) -> bool {
    doc.get_first(field).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn extract_micros(doc: &TantivyDocument, field: Field) -> Option<DateTime<Utc>> {
    doc.get_first(field)
        .and_then(|v| v.as_i64())
        .and_then(DateTime::from_timestamp_micros)
}
