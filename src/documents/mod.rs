//! Declarative document collections.
//!
//! A document file (YAML, TOML or JSON) holds named collections:
//!
//! ```yaml
//! collections:
//!   - name: faq
//!     description: Customer support answers
//!     data:
//!       - documents:
//!           - "Refunds are accepted within 30 days."
//!           - "Shipping takes three business days."
//!         metadata:
//!           source: support-handbook
//! ```
//!
//! Collection names must be unique across every file loaded into one
//! [`store::DocumentStore`].

pub mod store;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use grox_core::{GroxError, Metadata};

use crate::config::read_document;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentFile {
    #[serde(default)]
    pub collections: Vec<Collection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub data: Vec<DataEntry>,
    /// File the collection was loaded from.
    #[serde(skip)]
    pub source: PathBuf,
}

/// Text snippets sharing one metadata mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataEntry {
    #[serde(default)]
    pub documents: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Collection {
    pub fn snippet_count(&self) -> usize {
        self.data.iter().map(|d| d.documents.len()).sum()
    }
}

/// Parse every file and gather its collections by name.
///
/// Fails with [`GroxError::DuplicateCollection`] naming both files when a
/// name appears twice.
pub fn load_collections(paths: &[PathBuf]) -> Result<BTreeMap<String, Collection>> {
    let mut collections: BTreeMap<String, Collection> = BTreeMap::new();
    for path in paths {
        let file: DocumentFile = read_document(path)?;
        for mut collection in file.collections {
            collection.source = path.clone();
            insert_unique(&mut collections, collection)?;
        }
    }
    Ok(collections)
}

pub(crate) fn insert_unique(
    collections: &mut BTreeMap<String, Collection>,
    collection: Collection,
) -> Result<(), GroxError> {
    if let Some(existing) = collections.get(&collection.name) {
        return Err(GroxError::DuplicateCollection {
            name: collection.name.clone(),
            first: display(&existing.source),
            second: display(&collection.source),
        });
    }
    collections.insert(collection.name.clone(), collection);
    Ok(())
}

fn display(path: &Path) -> String {
    path.display().to_string()
}
