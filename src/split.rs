use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::SplitConfig;
use crate::run::{RunReport, RunTracker};
use crate::tabular::{part_path, table_parts};

/// Splits `input` into `<output_base>_<n>.csv` files of at most `max_rows` data rows.
/// Every part repeats the header; records are copied unchanged and in order.
/// Parts left over from an earlier split with the same base are removed first.
pub fn split_file(input: &Path, output_base: &Path, max_rows: usize) -> Result<Vec<PathBuf>> {
    let max_rows = max_rows.max(1);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(input)
        .with_context(|| format!("Failed to open {}", input.display()))?;
    let header = reader
        .byte_headers()
        .with_context(|| format!("Failed to read header of {}", input.display()))?
        .clone();

    remove_stale_parts(input, output_base)?;

    let mut written = Vec::new();
    let mut current: Option<(csv::Writer<File>, usize)> = None;
    let mut record = csv::ByteRecord::new();
    while reader
        .read_byte_record(&mut record)
        .with_context(|| format!("Failed to read records of {}", input.display()))?
    {
        let full = current.as_ref().map_or(true, |(_, rows)| *rows >= max_rows);
        if full {
            if let Some((writer, rows)) = current.take() {
                close_part(writer, &written, rows)?;
            }
            let path = part_path(output_base, written.len() + 1);
            let mut writer = csv::WriterBuilder::new()
                .flexible(true)
                .from_path(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            writer.write_byte_record(&header)?;
            written.push(path);
            current = Some((writer, 0));
        }
        if let Some((writer, rows)) = current.as_mut() {
            writer.write_byte_record(&record)?;
            *rows += 1;
        }
    }
    if let Some((writer, rows)) = current {
        close_part(writer, &written, rows)?;
    }

    Ok(written)
}

fn close_part(mut writer: csv::Writer<File>, written: &[PathBuf], rows: usize) -> Result<()> {
    writer.flush()?;
    if let Some(path) = written.last() {
        info!(file = %path.display(), rows, "Wrote part");
    }
    Ok(())
}

/// Deletes `<base>_<n>.csv` files from a previous run. `<base>.csv` and the
/// input itself are left alone.
fn remove_stale_parts(input: &Path, output_base: &Path) -> Result<()> {
    let dir = match output_base.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let name = output_base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    for stale in table_parts(&dir, &name)? {
        let is_single = stale.file_stem().and_then(|s| s.to_str()) == Some(name.as_str());
        if is_single || stale == input {
            continue;
        }
        debug!(file = %stale.display(), "Removing stale part");
        fs::remove_file(&stale)
            .with_context(|| format!("Failed to remove {}", stale.display()))?;
    }
    Ok(())
}

pub fn run(config: SplitConfig) -> Result<RunReport> {
    let mut tracker = RunTracker::new("split");
    if !config.input.exists() {
        anyhow::bail!("Input file not found: {}", config.input.display());
    }
    tracker.start();

    let parts = split_file(&config.input, &config.output_base, config.max_rows)?;
    let rows: usize = parts
        .iter()
        .map(|p| count_rows(p))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .sum();

    tracker.processed(rows);
    tracker.written(rows);
    info!(
        parts = parts.len(),
        rows,
        max_rows = config.max_rows,
        "Split {}",
        config.input.display()
    );
    Ok(tracker.finish())
}

pub fn count_rows<P: AsRef<Path>>(path: P) -> Result<usize> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut count = 0;
    for record in reader.byte_records() {
        record?;
        count += 1;
    }
    Ok(count)
}
