//! Persistent storage for emergency contacts.
//!
//! Stores the contact book as a JSON file in the app data directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::registry::{ContactBook, ContactRegistry};

const CONTACTS_FILE: &str = "contacts.json";

pub struct ContactStore {
    path: PathBuf,
}

impl ContactStore {
    /// Create a store rooted at the app data directory.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(CONTACTS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the registry from disk.
    ///
    /// A missing file yields an empty registry. A corrupt file is logged and
    /// also yields an empty registry rather than blocking the app from starting.
    pub fn load(&self) -> io::Result<ContactRegistry> {
        if !self.path.exists() {
            return Ok(ContactRegistry::new());
        }
        let content = fs::read_to_string(&self.path)?;
        let book = serde_json::from_str::<ContactBook>(&content).unwrap_or_else(|e| {
            log::warn!("Ignoring unreadable contact file {:?}: {}", self.path, e);
            ContactBook::default()
        });
        Ok(ContactRegistry::from_book(book))
    }

    pub fn save(&self, registry: &ContactRegistry) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(registry.book())?;
        // Write then rename so a crash never leaves a half-written file behind
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)
    }
}
