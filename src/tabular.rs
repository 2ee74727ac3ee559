//! Delimited text tables: one file (or one set of numbered parts) per logical table,
//! header row first, UTF-8.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::warn;

pub type Row = HashMap<String, String>;

#[derive(Debug, Clone, Default)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
    /// Records the CSV reader could not decode; they are dropped.
    pub unreadable: usize,
}

fn clean_header(h: &str) -> String {
    h.trim_start_matches('\u{feff}').trim().to_string()
}

pub fn read_headers<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("Failed to read header of {}", path.display()))?;
    Ok(headers.iter().map(clean_header).collect())
}

pub fn read_table<P: AsRef<Path>>(path: P) -> Result<Table> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let headers: Vec<String> = reader
        .headers()
        .with_context(|| format!("Failed to read header of {}", path.display()))?
        .iter()
        .map(clean_header)
        .collect();

    let mut table = Table {
        headers,
        ..Default::default()
    };

    for (idx, record) in reader.records().enumerate() {
        match record {
            Ok(record) => {
                let row: Row = table
                    .headers
                    .iter()
                    .cloned()
                    .zip(record.iter().map(String::from))
                    .collect();
                table.rows.push(row);
            }
            Err(e) => {
                warn!(file = %path.display(), record = idx + 1, "Unreadable record: {}", e);
                table.unreadable += 1;
            }
        }
    }

    Ok(table)
}

/// Values of the given key columns, joined with `|` when there is more than one.
/// Rows where any key column is empty yield nothing.
pub fn row_key(row: &Row, key_columns: &[&str]) -> Option<String> {
    let mut parts = Vec::with_capacity(key_columns.len());
    for column in key_columns {
        let value = row.get(*column).map(|v| v.trim()).unwrap_or("");
        if value.is_empty() {
            return None;
        }
        parts.push(value);
    }
    Some(parts.join("|"))
}

/// Appends rows to a table file, flushing after every row so an interrupted run
/// keeps everything written so far.
pub struct TableAppender {
    writer: csv::Writer<File>,
    headers: Vec<String>,
    path: PathBuf,
}

impl TableAppender {
    /// Opens `path` for append. An existing non-empty file keeps its own header;
    /// otherwise `headers` is written first.
    pub fn open<P: AsRef<Path>>(path: P, headers: &[String]) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        ensure_parent(&path)?;

        let existing = match fs::metadata(&path) {
            Ok(meta) if meta.len() > 0 => Some(read_headers(&path)?),
            _ => None,
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {} for append", path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        let headers = match existing {
            Some(existing) => {
                let known: HashSet<&str> = existing.iter().map(String::as_str).collect();
                let dropped: Vec<&String> =
                    headers.iter().filter(|h| !known.contains(h.as_str())).collect();
                if !dropped.is_empty() {
                    warn!(
                        file = %path.display(),
                        "Existing header lacks columns {:?}; they will not be written",
                        dropped
                    );
                }
                existing
            }
            None => {
                writer.write_record(headers)?;
                writer.flush()?;
                headers.to_vec()
            }
        };

        Ok(Self {
            writer,
            headers,
            path,
        })
    }

    pub fn append(&mut self, row: &Row) -> Result<()> {
        let record: Vec<&str> = self
            .headers
            .iter()
            .map(|h| row.get(h).map(String::as_str).unwrap_or(""))
            .collect();
        self.writer
            .write_record(&record)
            .with_context(|| format!("Failed to write row to {}", self.path.display()))?;
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush {}", self.path.display()))?;
        Ok(())
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    Ok(())
}

pub fn write_table<P: AsRef<Path>>(path: P, headers: &[&str], rows: &[Row]) -> Result<()> {
    let path = path.as_ref();
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(headers)?;
    for row in rows {
        writer.write_record(
            headers
                .iter()
                .map(|h| row.get(*h).map(String::as_str).unwrap_or("")),
        )?;
    }
    writer.flush()?;
    Ok(())
}

/// Contiguous chunks of at most `max` rows, original order preserved.
pub fn partition<T>(rows: &[T], max: usize) -> Vec<&[T]> {
    rows.chunks(max.max(1)).collect()
}

pub fn part_path(base: &Path, part: usize) -> PathBuf {
    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    base.with_file_name(format!("{}_{}.csv", name, part))
}

/// Writes a logical table as `<base>.csv` when it fits under `max` rows,
/// otherwise as `<base>_1.csv`, `<base>_2.csv`, ...
pub fn write_table_parts(
    base: &Path,
    headers: &[&str],
    rows: &[Row],
    max: usize,
) -> Result<Vec<PathBuf>> {
    if rows.len() <= max {
        let name = base
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let path = base.with_file_name(format!("{}.csv", name));
        write_table(&path, headers, rows)?;
        return Ok(vec![path]);
    }

    let mut written = Vec::new();
    for (idx, chunk) in partition(rows, max).into_iter().enumerate() {
        let path = part_path(base, idx + 1);
        write_table(&path, headers, chunk)?;
        written.push(path);
    }
    Ok(written)
}

/// Files that make up table `name` in `dir`: `name.csv` and `name_<n>.csv`,
/// parts in numeric order. Names that merely share the prefix are not matched.
pub fn table_parts(dir: &Path, name: &str) -> Result<Vec<PathBuf>> {
    let mut single = None;
    let mut parts: Vec<(usize, PathBuf)> = Vec::new();

    let pattern = dir.join(format!("{}*.csv", name));
    for entry in glob::glob(&pattern.to_string_lossy())? {
        let path = match entry {
            Ok(p) => p,
            Err(e) => {
                warn!("Skipping unreadable path: {}", e);
                continue;
            }
        };
        let stem = match path.file_stem().and_then(|s| s.to_str()) {
            Some(s) => s,
            None => continue,
        };
        if stem == name {
            single = Some(path.clone());
        } else if let Some(n) = stem
            .strip_prefix(name)
            .and_then(|rest| rest.strip_prefix('_'))
            .and_then(|n| n.parse::<usize>().ok())
        {
            parts.push((n, path.clone()));
        }
    }

    parts.sort_by_key(|(n, _)| *n);
    Ok(single
        .into_iter()
        .chain(parts.into_iter().map(|(_, p)| p))
        .collect())
}
