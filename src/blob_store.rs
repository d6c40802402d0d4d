use std::path::PathBuf;

use crate::error::{Error, Result};

/// URL path prefix under which stored blobs are served.
pub const UPLOADS_PREFIX: &str = "/uploads";

const MAX_EXTENSION_LEN: usize = 16;

/// Flat directory of uploaded files, addressed by generated names.
#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
    public_url: Option<String>,
}

/// Where a saved blob ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub path: PathBuf,
    /// Generated file name inside the store.
    pub name: String,
    /// Location recorded on the item: `/uploads/<name>`, prefixed with the
    /// public URL when one is configured.
    pub location: String,
}

impl BlobStore {
    pub fn new(dir: PathBuf, public_url: Option<String>) -> Self {
        let public_url = public_url
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());
        Self { dir, public_url }
    }

    /// Write `bytes` under a fresh unique name that keeps the original
    /// file's extension.
    pub fn save(&self, original_name: &str, bytes: &[u8]) -> Result<StoredBlob> {
        std::fs::create_dir_all(&self.dir)?;

        let name = match extension_of(original_name) {
            Some(ext) => format!("{}.{ext}", uuid::Uuid::new_v4()),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let path = self.dir.join(&name);
        std::fs::write(&path, bytes)?;

        let location = match &self.public_url {
            Some(base) => format!("{base}{UPLOADS_PREFIX}/{name}"),
            None => format!("{UPLOADS_PREFIX}/{name}"),
        };

        tracing::debug!(%name, size = bytes.len(), "blob saved");
        Ok(StoredBlob {
            path,
            name,
            location,
        })
    }

    /// Resolve a stored name to its path, rejecting anything that could
    /// step outside the store.
    pub fn path_of(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty()
            || name.starts_with('.')
            || name.contains(['/', '\\'])
        {
            return Err(Error::validation(format!("invalid file name '{name}'")));
        }
        Ok(self.dir.join(name))
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_of(name)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound {
                    kind: "file",
                    name: name.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a blob. Missing files are not an error.
    pub fn remove(&self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.path_of(name)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Lowercased alphanumeric extension of a client-supplied file name.
fn extension_of(file_name: &str) -> Option<String> {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    let (stem, ext) = base.rsplit_once('.')?;
    if stem.is_empty()
        || ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
