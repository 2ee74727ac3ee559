//! SCOPUS Search (paginated harvest) and Abstract Retrieval (lookup by DOI).

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

use super::mapping::{join, json, scalar, FieldSpec};
use super::{
    extract_keyed, get_json, http_client, normalize_doi, progress_bar, Checkpoint, FailureLog,
    KeyedSource, Pacer,
};
use crate::config::{ScopusAbstractsConfig, ScopusSearchConfig};
use crate::error::FetchError;
use crate::run::{RunReport, RunTracker};
use crate::tabular::{row_key, TableAppender};

const USER_AGENT: &str = concat!("research-etl/", env!("CARGO_PKG_VERSION"));

/// Fields requested from the Search API.
const SEARCH_FIELDS: &[&str] = &[
    "dc:identifier",
    "prism:doi",
    "prism:coverDate",
    "citedby-count",
    "prism:publicationName",
    "subtypeDescription",
    "subtype",
    "prism:url",
];

pub const SEARCH_ENTRY_FIELDS: &[FieldSpec] = &[
    scalar("prism_url", "/prism:url"),
    scalar("dc_identifier", "/dc:identifier"),
    scalar("prism_publicationname", "/prism:publicationName"),
    scalar("prism_coverdate", "/prism:coverDate"),
    scalar("prism_doi", "/prism:doi"),
    scalar("citedby_count", "/citedby-count"),
    scalar("subtype", "/subtype"),
    scalar("subtypedescription", "/subtypeDescription"),
];

pub const SEARCH_KEY: &str = "dc_identifier";

pub const ABSTRACT_FIELDS: &[FieldSpec] = &[
    scalar(
        "abs_identifier",
        "/abstracts-retrieval-response/coredata/dc:identifier",
    ),
    scalar("abs_title", "/abstracts-retrieval-response/coredata/dc:title"),
    scalar(
        "abs_cover_date",
        "/abstracts-retrieval-response/coredata/prism:coverDate",
    ),
    scalar(
        "abs_citedby_count",
        "/abstracts-retrieval-response/coredata/citedby-count",
    ),
    scalar(
        "abs_publication_name",
        "/abstracts-retrieval-response/coredata/prism:publicationName",
    ),
    scalar(
        "abs_subtype_description",
        "/abstracts-retrieval-response/coredata/subtypeDescription",
    ),
    scalar("abs_volume", "/abstracts-retrieval-response/coredata/prism:volume"),
    scalar(
        "abs_issue",
        "/abstracts-retrieval-response/coredata/prism:issueIdentifier",
    ),
    scalar(
        "abs_page_range",
        "/abstracts-retrieval-response/coredata/prism:pageRange",
    ),
    scalar(
        "abs_openaccess",
        "/abstracts-retrieval-response/coredata/openaccess",
    ),
    scalar(
        "abs_pubmed_id",
        "/abstracts-retrieval-response/coredata/pubmed-id",
    ),
    join(
        "abs_authors",
        "/abstracts-retrieval-response/authors/author",
        "/ce:indexed-name",
        "; ",
    ),
    json("abs_affiliations", "/abstracts-retrieval-response/affiliation"),
];

pub fn search_columns() -> Vec<String> {
    SEARCH_ENTRY_FIELDS
        .iter()
        .map(|f| f.column.to_string())
        .chain(["publication_year".to_string(), "publication_month".to_string()])
        .collect()
}

pub fn search_query(affiliation: &str, year: i32, doc_type: &str) -> String {
    format!(
        "AFFIL(\"{}\") AND PUBYEAR = {} AND SUBTYPE(\"{}\")",
        affiliation, year, doc_type
    )
}

/// One page of Search API results.
#[derive(Debug, Default)]
pub struct SearchPage {
    pub entries: Vec<Value>,
    pub total: usize,
}

pub struct ScopusClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl ScopusClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout, USER_AGENT)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub async fn search_page(
        &self,
        query: &str,
        start: usize,
        count: usize,
    ) -> Result<SearchPage, FetchError> {
        let request = self
            .client
            .get(format!("{}/content/search/scopus", self.base_url))
            .header("X-ELS-APIKey", &self.api_key)
            .header("Accept", "application/json")
            .query(&[
                ("query", query.to_string()),
                ("field", SEARCH_FIELDS.join(",")),
                ("count", count.to_string()),
                ("start", start.to_string()),
                ("sort", "citedby-count".to_string()),
            ]);

        let body = match get_json(request).await? {
            Some(body) => body,
            None => return Ok(SearchPage::default()),
        };
        parse_search_page(&body)
    }

    pub async fn abstract_by_doi(&self, doi: &str) -> Result<Option<Value>, FetchError> {
        let encoded: Vec<String> = doi
            .split('/')
            .map(|part| urlencoding::encode(part).into_owned())
            .collect();
        let request = self
            .client
            .get(format!(
                "{}/content/abstract/doi/{}",
                self.base_url,
                encoded.join("/")
            ))
            .header("X-ELS-APIKey", &self.api_key)
            .header("Accept", "application/json");

        match get_json(request).await? {
            Some(body) if body.pointer("/abstracts-retrieval-response/coredata").is_some() => {
                Ok(Some(body))
            }
            _ => Ok(None),
        }
    }
}

pub fn parse_search_page(body: &Value) -> Result<SearchPage, FetchError> {
    let results = body
        .get("search-results")
        .ok_or_else(|| FetchError::Payload("missing search-results".to_string()))?;

    let total = match results.get("opensearch:totalResults") {
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0) as usize,
        _ => 0,
    };

    // An empty result set comes back as a single entry carrying an "error" field.
    let entries = match results.get("entry") {
        Some(Value::Array(items)) => items
            .iter()
            .filter(|e| e.get("error").is_none())
            .cloned()
            .collect(),
        _ => Vec::new(),
    };

    Ok(SearchPage { entries, total })
}

/// Flattens a search entry and derives `publication_year` / `publication_month`
/// from the cover date (empty when the date is missing or malformed).
pub fn flatten_entry(entry: &Value) -> crate::tabular::Row {
    let mut row = super::flatten(entry, SEARCH_ENTRY_FIELDS);
    let cover = row
        .get("prism_coverdate")
        .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok());
    let (year, month) = match cover {
        Some(date) => (date.year().to_string(), date.month().to_string()),
        None => (String::new(), String::new()),
    };
    row.insert("publication_year".to_string(), year);
    row.insert("publication_month".to_string(), month);
    row
}

pub fn run_search(config: ScopusSearchConfig) -> Result<RunReport> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_search_async(config))
}

/// Harvests every `(year, document type)` query into the output file.
pub async fn run_search_async(config: ScopusSearchConfig) -> Result<RunReport> {
    let mut tracker = RunTracker::new("scopus-search");
    let client = ScopusClient::new(
        &config.base_url,
        &config.api_key,
        config.pacing.request_timeout,
    )?;
    let mut checkpoint = Checkpoint::load(&config.output, &[SEARCH_KEY])
        .context("Failed to scan existing output")?;
    let mut output = TableAppender::open(&config.output, &search_columns())?;
    let mut failures = FailureLog::open(&config.output, "scopus-search")?;
    let mut pacer = Pacer::new(config.pacing.clone());
    tracker.start();

    let queries: Vec<(i32, &String)> = config
        .years
        .iter()
        .flat_map(|year| config.doc_types.iter().map(move |t| (*year, t)))
        .collect();
    let pb = progress_bar(queries.len() as u64);

    for (idx, (year, doc_type)) in queries.iter().enumerate() {
        let queries_left = idx + 1 < queries.len();
        let query = search_query(&config.affiliation, *year, doc_type);
        info!(%query, "Searching SCOPUS");

        let mut start = 0usize;
        loop {
            let page = match client.search_page(&query, start, config.page_size).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(%query, start, "Search page failed: {}", e);
                    failures.record(&format!("{}@{}", query, start), &e.to_string())?;
                    tracker.skipped(1);
                    pacer.after_request(queries_left).await;
                    break;
                }
            };

            let received = page.entries.len();
            for entry in &page.entries {
                tracker.processed(1);
                let row = flatten_entry(entry);
                let key = match row_key(&row, &[SEARCH_KEY]) {
                    Some(k) => k,
                    None => {
                        warn!(%query, "Entry without dc:identifier ignored");
                        continue;
                    }
                };
                if checkpoint.is_processed(&key) {
                    tracker.already_done(1);
                    continue;
                }
                output.append(&row)?;
                checkpoint.mark_processed(&key);
                tracker.written(1);
            }

            start += received;
            let limit = page.total.min(config.max_results);
            let more_pages = received > 0 && received >= config.page_size && start < limit;
            pacer.after_request(more_pages || queries_left).await;
            if !more_pages {
                break;
            }
        }

        pb.inc(1);
    }

    pb.finish_and_clear();
    Ok(tracker.finish())
}

/// Abstract Retrieval API as a DOI-keyed source.
pub struct ScopusAbstracts {
    client: ScopusClient,
}

impl ScopusAbstracts {
    pub fn new(config: &ScopusAbstractsConfig) -> Result<Self> {
        Ok(Self {
            client: ScopusClient::new(
                &config.base_url,
                &config.api_key,
                config.run.pacing.request_timeout,
            )?,
        })
    }
}

#[async_trait]
impl KeyedSource for ScopusAbstracts {
    fn name(&self) -> &'static str {
        "scopus-abstracts"
    }

    fn key_column(&self) -> &'static str {
        "doi"
    }

    fn status_column(&self) -> &'static str {
        "abs_status"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        ABSTRACT_FIELDS
    }

    fn normalize_key(&self, raw: &str) -> Option<String> {
        normalize_doi(raw)
    }

    async fn fetch(&self, key: &str) -> Result<Option<Value>, FetchError> {
        self.client.abstract_by_doi(key).await
    }
}

pub fn run_abstracts(config: ScopusAbstractsConfig) -> Result<RunReport> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_abstracts_async(config))
}

pub async fn run_abstracts_async(config: ScopusAbstractsConfig) -> Result<RunReport> {
    let source = ScopusAbstracts::new(&config)?;
    extract_keyed(&source, &config.run).await
}
