use anyhow::Result;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::tabular::{read_table, row_key};

/// Identifiers already present in an extractor's output file.
///
/// Built once per run from the output itself, so the file is the only state:
/// a key is checkpointed exactly when its row has been appended.
pub struct Checkpoint {
    path: PathBuf,
    processed: HashSet<String>,
}

impl Checkpoint {
    /// Scans `path` for the given key columns. A missing file yields an empty set.
    pub fn load<P: AsRef<Path>>(path: P, key_columns: &[&str]) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut processed = HashSet::new();

        let non_empty = std::fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
        if non_empty {
            let table = read_table(&path)?;
            let missing: Vec<&&str> = key_columns
                .iter()
                .filter(|c| !table.headers.iter().any(|h| h == **c))
                .collect();
            if !missing.is_empty() {
                warn!(
                    file = %path.display(),
                    "Output has no key column(s) {:?}; nothing is treated as processed",
                    missing
                );
            }
            for row in &table.rows {
                if let Some(key) = row_key(row, key_columns) {
                    processed.insert(key);
                }
            }
        }

        Ok(Self { path, processed })
    }

    pub fn mark_processed(&mut self, key: &str) {
        self.processed.insert(key.to_string());
    }

    pub fn is_processed(&self, key: &str) -> bool {
        self.processed.contains(key)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }
}
