use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{KeyedExtractConfig, Pacing};
use crate::error::FetchError;
use crate::run::{RunReport, RunTracker};
use crate::tabular::{read_table, Row, TableAppender};

mod checkpoint;
pub mod facebook;
pub mod mapping;
pub mod openalex;
pub mod scopus;

pub use checkpoint::Checkpoint;
pub use mapping::{flatten, FieldSpec, Shape};

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_NOT_FOUND: &str = "not_found";

/// A remote API that answers one lookup per identifier.
#[async_trait]
pub trait KeyedSource {
    fn name(&self) -> &'static str;

    /// Output column holding the normalized identifier.
    fn key_column(&self) -> &'static str;

    /// Output column recording whether the lookup found a record.
    fn status_column(&self) -> &'static str;

    fn fields(&self) -> &'static [FieldSpec];

    /// Canonical form of a raw identifier, or `None` when it is unusable.
    fn normalize_key(&self, raw: &str) -> Option<String>;

    /// `Ok(None)` means the API answered that the identifier does not exist.
    async fn fetch(&self, key: &str) -> Result<Option<Value>, FetchError>;
}

/// One line of `<output>.failed.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedLookup {
    pub source: String,
    pub key: String,
    pub error: String,
}

pub fn failed_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    output.with_file_name(format!("{}.failed.jsonl", name))
}

/// Append-only record of lookups that failed this run.
pub struct FailureLog {
    writer: BufWriter<File>,
    source: &'static str,
}

impl FailureLog {
    pub fn open(output: &Path, source: &'static str) -> Result<Self> {
        let path = failed_path(output);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
            source,
        })
    }

    pub fn record(&mut self, key: &str, error: &str) -> Result<()> {
        let entry = FailedLookup {
            source: self.source.to_string(),
            key: key.to_string(),
            error: error.to_string(),
        };
        writeln!(self.writer, "{}", serde_json::to_string(&entry)?)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Canonical bare DOI (`10.xxxx/...`, lowercase), or `None` if `raw` is not a DOI.
pub fn normalize_doi(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let lower = trimmed.to_lowercase();
    let prefixes = [
        "https://doi.org/",
        "http://doi.org/",
        "https://dx.doi.org/",
        "http://dx.doi.org/",
        "doi:",
    ];
    let bare = prefixes
        .iter()
        .find_map(|p| lower.strip_prefix(p))
        .unwrap_or(&lower)
        .trim();

    if bare.starts_with("10.") && bare.contains('/') {
        Some(bare.to_string())
    } else {
        None
    }
}

pub fn http_client(timeout: Duration, user_agent: &str) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(user_agent)
        .build()
        .context("Failed to build HTTP client")
}

/// Sends a request and decodes a JSON body. 404 and an empty body map to `Ok(None)`.
pub async fn get_json(request: RequestBuilder) -> Result<Option<Value>, FetchError> {
    let response = request.send().await?;
    let status = response.status();

    if status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !status.is_success() {
        return Err(FetchError::Status(status.as_u16()));
    }

    let text = response.text().await?;
    if text.trim().is_empty() {
        return Ok(None);
    }
    let body: Value =
        serde_json::from_str(&text).map_err(|e| FetchError::Payload(e.to_string()))?;
    if body.is_null() {
        return Ok(None);
    }
    Ok(Some(body))
}

/// Sleeps between requests and, after each full batch, for the batch pause.
pub struct Pacer {
    pacing: Pacing,
    in_batch: usize,
}

impl Pacer {
    pub fn new(pacing: Pacing) -> Self {
        Self { pacing, in_batch: 0 }
    }

    /// Call after every request. `more` tells whether anything is left to fetch.
    pub async fn after_request(&mut self, more: bool) {
        if !more {
            return;
        }
        if !self.pacing.request_delay.is_zero() {
            tokio::time::sleep(self.pacing.request_delay).await;
        }
        self.in_batch += 1;
        if self.in_batch >= self.pacing.batch_size {
            self.in_batch = 0;
            if !self.pacing.batch_pause.is_zero() {
                info!(
                    "Batch of {} done, pausing {}s",
                    self.pacing.batch_size,
                    self.pacing.batch_pause.as_secs()
                );
                tokio::time::sleep(self.pacing.batch_pause).await;
            }
        }
    }
}

pub fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

fn output_headers(input: &[String], source: &dyn KeyedSource) -> Vec<String> {
    let mut headers: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    let extra = [source.key_column(), source.status_column()];
    let candidates = input
        .iter()
        .map(String::as_str)
        .chain(extra)
        .chain(source.fields().iter().map(|f| f.column));
    for column in candidates {
        if seen.insert(column.to_string()) {
            headers.push(column.to_string());
        }
    }
    headers
}

/// Enriches each row of the input table with one remote lookup per identifier.
///
/// Rows go to the output as soon as they are fetched; identifiers already in the
/// output are not requested again. A failed lookup is recorded in the failure log
/// and left for the next run.
pub async fn extract_keyed<S>(source: &S, config: &KeyedExtractConfig) -> Result<RunReport>
where
    S: KeyedSource + Sync,
{
    let mut tracker = RunTracker::new(source.name());

    if !config.input.exists() {
        bail!("Input file not found: {}", config.input.display());
    }
    let input = read_table(&config.input)?;
    if !input.headers.iter().any(|h| h == &config.key_column) {
        bail!(
            "Input {} has no column {:?}",
            config.input.display(),
            config.key_column
        );
    }

    let key_column = source.key_column();
    let mut checkpoint = Checkpoint::load(&config.output, &[key_column])?;
    tracker.start();

    if !checkpoint.is_empty() {
        info!(
            "Resuming: {} identifiers already in {}",
            checkpoint.len(),
            checkpoint.path().display()
        );
    }

    let mut pending: Vec<(String, Row)> = Vec::new();
    let mut seen = HashSet::new();
    let mut invalid = 0usize;
    for row in input.rows {
        let raw = row.get(&config.key_column).map(String::as_str).unwrap_or("");
        let key = match source.normalize_key(raw) {
            Some(k) => k,
            None => {
                if !raw.trim().is_empty() {
                    debug!(raw, "Unusable identifier");
                }
                invalid += 1;
                continue;
            }
        };
        if !seen.insert(key.clone()) {
            continue;
        }
        if checkpoint.is_processed(&key) {
            tracker.already_done(1);
            continue;
        }
        pending.push((key, row));
    }

    if invalid > 0 {
        warn!("{} input rows have a missing or unusable identifier", invalid);
    }
    info!(
        source = source.name(),
        pending = pending.len(),
        "Identifiers to fetch"
    );

    if pending.is_empty() {
        return Ok(tracker.finish());
    }

    let headers = output_headers(&input.headers, source);
    let mut output = TableAppender::open(&config.output, &headers)?;
    let mut failures = FailureLog::open(&config.output, source.name())?;
    let mut pacer = Pacer::new(config.pacing.clone());
    let pb = progress_bar(pending.len() as u64);
    let total = pending.len();

    for (idx, (key, input_row)) in pending.into_iter().enumerate() {
        tracker.processed(1);

        let outcome = source.fetch(&key).await;
        let mut row = input_row;
        match outcome {
            Ok(Some(record)) => {
                row.extend(flatten(&record, source.fields()));
                row.insert(key_column.to_string(), key.clone());
                row.insert(source.status_column().to_string(), STATUS_SUCCESS.to_string());
                output.append(&row)?;
                checkpoint.mark_processed(&key);
                tracker.written(1);
            }
            Ok(None) => {
                debug!(key = %key, "Not found");
                row.insert(key_column.to_string(), key.clone());
                row.insert(source.status_column().to_string(), STATUS_NOT_FOUND.to_string());
                output.append(&row)?;
                checkpoint.mark_processed(&key);
                tracker.written(1);
            }
            Err(e) => {
                warn!(key = %key, "Lookup failed: {}", e);
                failures.record(&key, &e.to_string())?;
                tracker.skipped(1);
            }
        }

        pb.inc(1);
        pacer.after_request(idx + 1 < total).await;
    }

    pb.finish_and_clear();
    Ok(tracker.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_doi_strips_resolver_prefixes() {
        assert_eq!(
            normalize_doi("https://doi.org/10.1002/ADFM.202413884"),
            Some("10.1002/adfm.202413884".to_string())
        );
        assert_eq!(normalize_doi(" doi:10.1/X "), Some("10.1/x".to_string()));
        assert_eq!(normalize_doi("10.1/x"), Some("10.1/x".to_string()));
    }

    #[test]
    fn normalize_doi_rejects_non_dois() {
        assert_eq!(normalize_doi(""), None);
        assert_eq!(normalize_doi("invalid-doi-for-testing"), None);
        assert_eq!(normalize_doi("10.1234"), None);
    }

    fn pacing(batch_size: usize) -> Pacing {
        Pacing {
            batch_size,
            batch_pause: Duration::from_secs(5),
            request_delay: Duration::from_millis(100),
            request_timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_delays_each_request_and_pauses_after_a_batch() {
        let mut pacer = Pacer::new(pacing(2));
        let started = tokio::time::Instant::now();

        pacer.after_request(true).await;
        assert_eq!(started.elapsed(), Duration::from_millis(100));

        pacer.after_request(true).await;
        assert_eq!(started.elapsed(), Duration::from_millis(5200));

        pacer.after_request(true).await;
        assert_eq!(started.elapsed(), Duration::from_millis(5300));
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_does_not_sleep_after_the_last_request() {
        let mut pacer = Pacer::new(pacing(1));
        let started = tokio::time::Instant::now();

        pacer.after_request(false).await;

        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[test]
    fn failed_path_sits_next_to_output() {
        assert_eq!(
            failed_path(Path::new("out/enriched.csv")),
            PathBuf::from("out/enriched.csv.failed.jsonl")
        );
    }
}
