//! The item record and the small value types around it.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// Workflow bucket an item is triaged into.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[default]
    Inbox,
    Actionable,
    Eliminate,
    Incubate,
    File,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Inbox,
        Category::Actionable,
        Category::Eliminate,
        Category::Incubate,
        Category::File,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Inbox => "inbox",
            Category::Actionable => "actionable",
            Category::Eliminate => "eliminate",
            Category::Incubate => "incubate",
            Category::File => "file",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s.trim())
            .ok_or_else(|| {
                Error::validation(format!(
                    "unknown category '{s}' (expected one of: inbox, \
                     actionable, eliminate, incubate, file)"
                ))
            })
    }
}

/// Extraction status of an uploaded item.
///
/// Only moves forward: `Queued` to `Done` or `Queued` to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Queued,
    Done,
    Failed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Done => "done",
            Status::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Status::Queued),
            "done" => Some(Status::Done),
            "failed" => Some(Status::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: u64,
    pub title: String,
    pub description: Option<String>,
    pub file_location: Option<String>,
    pub processing: bool,
    pub status: Option<Status>,
    pub category: Category,
    #[serde(default)]
    pub tags: Vec<String>,
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub done: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when inserting a row. The store assigns `id` and
/// `created_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewItem {
    pub title: String,
    pub description: Option<String>,
    pub file_location: Option<String>,
    pub processing: bool,
    pub status: Option<Status>,
}

impl NewItem {
    /// A note typed in by hand. Nothing to extract.
    pub fn manual(title: &str, description: Option<String>) -> Result<Self> {
        Ok(Self {
            title: require_title(title)?,
            description,
            file_location: None,
            processing: false,
            status: None,
        })
    }

    /// Placeholder for an upload whose text is not known yet.
    pub fn placeholder(title: &str, file_location: String) -> Result<Self> {
        Ok(Self {
            title: require_title(title)?,
            description: None,
            file_location: Some(file_location),
            processing: true,
            status: Some(Status::Queued),
        })
    }

    pub(crate) fn into_item(
        self,
        id: u64,
        created_at: DateTime<Utc>,
    ) -> Item {
        Item {
            id,
            title: self.title,
            description: self.description,
            file_location: self.file_location,
            processing: self.processing,
            status: self.status,
            category: Category::Inbox,
            tags: Vec::new(),
            due_date: None,
            done: false,
            created_at,
        }
    }
}

fn require_title(title: &str) -> Result<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(Error::validation("title is required"));
    }
    Ok(title.to_string())
}

/// A partial update produced by triage.
///
/// `None` leaves a field alone. For `due_date`, `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ItemPatch {
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default, deserialize_with = "explicit_null")]
    pub due_date: Option<Option<DateTime<Utc>>>,
    #[serde(default)]
    pub done: Option<bool>,
}

impl ItemPatch {
    pub fn is_empty(&self) -> bool {
        self.category.is_none()
            && self.tags.is_none()
            && self.due_date.is_none()
            && self.done.is_none()
    }

    /// Apply to an item in place. Fields absent from the patch are kept,
    /// so tags and due dates survive a trip through other categories.
    pub fn apply(&self, item: &mut Item) {
        if let Some(category) = self.category {
            item.category = category;
        }
        if let Some(tags) = &self.tags {
            item.tags = normalize_tags(tags.iter().map(String::as_str));
        }
        if let Some(due_date) = self.due_date {
            item.due_date = due_date;
        }
        if let Some(done) = self.done {
            item.done = done;
        }
    }
}

/// Distinguish a JSON `null` (clear) from an absent key (keep).
fn explicit_null<'de, D, T>(
    deserializer: D,
) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Trim, drop empties, and remove duplicates keeping first occurrence.
pub fn normalize_tags<'a>(tags: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.trim();
        if !tag.is_empty() && !out.iter().any(|t| t == tag) {
            out.push(tag.to_string());
        }
    }
    out
}

/// Per-category item counts, used for UI badges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryCounts {
    pub inbox: u64,
    pub actionable: u64,
    pub eliminate: u64,
    pub incubate: u64,
    pub file: u64,
}

impl CategoryCounts {
    pub fn bump(&mut self, category: Category) {
        self.add(category, 1);
    }

    pub fn add(&mut self, category: Category, n: u64) {
        match category {
            Category::Inbox => self.inbox += n,
            Category::Actionable => self.actionable += n,
            Category::Eliminate => self.eliminate += n,
            Category::Incubate => self.incubate += n,
            Category::File => self.file += n,
        }
    }

    pub fn get(&self, category: Category) -> u64 {
        match category {
            Category::Inbox => self.inbox,
            Category::Actionable => self.actionable,
            Category::Eliminate => self.eliminate,
            Category::Incubate => self.incubate,
            Category::File => self.file,
        }
    }
}
