//! Decomposes enriched publication rows into relational tables.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::NormalizeConfig;
use crate::extract::normalize_doi;
use crate::run::{RunReport, RunTracker};
use crate::schema::{
    TableSchema, AUTHORS, AUTHORSHIP_COUNTRIES, AUTHORSHIP_INSTITUTIONS, FUNDERS, INSTITUTIONS,
    PUBLICATIONS, PUBLICATION_AUTHORSHIPS, PUBLICATION_CITATION_COUNTS, PUBLICATION_FUNDING,
    RAW_SCOPUS_SEARCH,
};
use crate::tabular::{read_table, table_parts, write_table_parts, Row};

mod nested;

pub use nested::parse_nested;
use nested::{child, strings, text, Object};

/// Tables produced here, in write order.
pub const NORMALIZED_TABLES: [&TableSchema; 10] = [
    &RAW_SCOPUS_SEARCH,
    &PUBLICATIONS,
    &AUTHORS,
    &INSTITUTIONS,
    &FUNDERS,
    &PUBLICATION_AUTHORSHIPS,
    &AUTHORSHIP_INSTITUTIONS,
    &AUTHORSHIP_COUNTRIES,
    &PUBLICATION_FUNDING,
    &PUBLICATION_CITATION_COUNTS,
];

/// Rows of one table, deduplicated on its primary key. The first row wins.
struct TableRows {
    schema: &'static TableSchema,
    rows: Vec<Row>,
    keys: HashSet<Vec<String>>,
}

impl TableRows {
    fn new(schema: &'static TableSchema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
            keys: HashSet::new(),
        }
    }

    fn push(&mut self, row: Row) -> bool {
        let key: Vec<String> = self
            .schema
            .primary_key
            .iter()
            .map(|k| row.get(*k).cloned().unwrap_or_default())
            .collect();
        if self.keys.insert(key) {
            self.rows.push(row);
            true
        } else {
            false
        }
    }
}

fn row_of<const N: usize>(pairs: [(&str, String); N]) -> Row {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn project(input: &Row, schema: &TableSchema) -> Row {
    schema
        .columns
        .iter()
        .map(|c| {
            let value = input.get(c.name).cloned().unwrap_or_default();
            (c.name.to_string(), value)
        })
        .collect()
}

/// Accumulates every table across all input rows.
pub struct Normalizer {
    tables: Vec<TableRows>,
    pub rows_seen: usize,
    pub rows_without_doi: usize,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer {
    pub fn new() -> Self {
        Self {
            tables: NORMALIZED_TABLES.into_iter().map(TableRows::new).collect(),
            rows_seen: 0,
            rows_without_doi: 0,
        }
    }

    fn table(&mut self, schema: &TableSchema) -> &mut TableRows {
        let idx = NORMALIZED_TABLES
            .iter()
            .position(|t| t.name == schema.name)
            .unwrap_or(0);
        &mut self.tables[idx]
    }

    pub fn rows(&self, name: &str) -> &[Row] {
        self.tables
            .iter()
            .find(|t| t.schema.name == name)
            .map(|t| t.rows.as_slice())
            .unwrap_or(&[])
    }

    /// Adds one enriched row. Returns false when it has no DOI and was skipped.
    pub fn add_row(&mut self, input: &Row) -> bool {
        self.rows_seen += 1;
        let raw_doi = input.get("doi").map(|d| d.trim()).unwrap_or("");
        if raw_doi.is_empty() {
            self.rows_without_doi += 1;
            return false;
        }
        let doi = normalize_doi(raw_doi).unwrap_or_else(|| raw_doi.to_string());

        let has_scopus_id = input
            .get("dc_identifier")
            .is_some_and(|id| !id.trim().is_empty());
        if has_scopus_id {
            let mut raw = project(input, &RAW_SCOPUS_SEARCH);
            raw.insert("doi".into(), doi.clone());
            self.table(&RAW_SCOPUS_SEARCH).push(raw);
        }

        let mut publication = project(input, &PUBLICATIONS);
        publication.insert("doi".into(), doi.clone());
        self.table(&PUBLICATIONS).push(publication);

        let cell = |column: &str| input.get(column).map(String::as_str).unwrap_or("");

        for authorship in parse_nested(cell("oa_authorships")) {
            self.add_authorship(&doi, &authorship);
        }

        for grant in parse_nested(cell("oa_grants")) {
            let funder_id = text(&grant, "funder");
            if funder_id.is_empty() {
                continue;
            }
            self.table(&FUNDERS).push(row_of([
                ("oa_funder_id", funder_id.clone()),
                ("oa_funder_name", text(&grant, "funder_display_name")),
            ]));
            self.table(&PUBLICATION_FUNDING).push(row_of([
                ("doi", doi.clone()),
                ("oa_funder_id", funder_id),
                ("oa_award_id", text(&grant, "award_id")),
            ]));
        }

        for count in parse_nested(cell("oa_counts_by_year")) {
            let year = text(&count, "year");
            let cited = text(&count, "cited_by_count");
            if year.is_empty() || cited.is_empty() {
                continue;
            }
            self.table(&PUBLICATION_CITATION_COUNTS).push(row_of([
                ("doi", doi.clone()),
                ("year", year),
                ("cited_by_count", cited),
            ]));
        }

        true
    }

    fn add_authorship(&mut self, doi: &str, authorship: &Object) {
        let author = match child(authorship, "author") {
            Some(a) => a,
            None => return,
        };
        let author_id = text(author, "id");
        if author_id.is_empty() {
            return;
        }

        self.table(&AUTHORS).push(row_of([
            ("oa_author_id", author_id.clone()),
            ("oa_author_name", text(author, "display_name")),
            ("oa_author_orcid", text(author, "orcid")),
        ]));
        self.table(&PUBLICATION_AUTHORSHIPS).push(row_of([
            ("doi", doi.to_string()),
            ("oa_author_id", author_id.clone()),
            ("oa_author_position", text(authorship, "author_position")),
            (
                "oa_author_is_corresponding",
                text(authorship, "is_corresponding"),
            ),
            ("oa_author_raw_name", text(authorship, "raw_author_name")),
        ]));

        let affiliation = strings(authorship, "raw_affiliation_strings").join(", ");
        if let Some(serde_json::Value::Array(institutions)) = authorship.get("institutions") {
            for institution in institutions.iter().filter_map(|i| i.as_object()) {
                let institution_id = text(institution, "id");
                if institution_id.is_empty() {
                    continue;
                }
                self.table(&INSTITUTIONS).push(row_of([
                    ("oa_institution_id", institution_id.clone()),
                    ("oa_institution_name", text(institution, "display_name")),
                    ("oa_institution_ror", text(institution, "ror")),
                    (
                        "oa_institution_country_code",
                        text(institution, "country_code"),
                    ),
                    ("oa_institution_type", text(institution, "type")),
                ]));
                self.table(&AUTHORSHIP_INSTITUTIONS).push(row_of([
                    ("doi", doi.to_string()),
                    ("oa_author_id", author_id.clone()),
                    ("oa_institution_id", institution_id),
                    ("oa_raw_affiliation_string", affiliation.clone()),
                ]));
            }
        }

        for country in strings(authorship, "countries") {
            self.table(&AUTHORSHIP_COUNTRIES).push(row_of([
                ("doi", doi.to_string()),
                ("oa_author_id", author_id.clone()),
                ("oa_country_code", country),
            ]));
        }
    }

    /// Writes every non-empty table into `dir`, replacing earlier output of the
    /// same tables. Returns the number of rows written.
    pub fn write(&self, dir: &Path, max_rows: usize) -> Result<usize> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

        let mut written = 0;
        for table in &self.tables {
            let name = table.schema.name;
            for stale in table_parts(dir, name)? {
                fs::remove_file(&stale)
                    .with_context(|| format!("Failed to remove {}", stale.display()))?;
            }
            if table.rows.is_empty() {
                info!(table = name, "Empty, not written");
                continue;
            }
            let files = write_table_parts(
                &dir.join(name),
                &table.schema.column_names(),
                &table.rows,
                max_rows,
            )?;
            info!(
                table = name,
                rows = table.rows.len(),
                files = files.len(),
                "Wrote table"
            );
            written += table.rows.len();
        }
        Ok(written)
    }
}

pub fn input_files(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in glob::glob(pattern).with_context(|| format!("Invalid pattern {}", pattern))? {
        match entry {
            Ok(path) if path.is_file() => files.push(path),
            Ok(_) => {}
            Err(e) => warn!("Skipping unreadable path: {}", e),
        }
    }
    files.sort_by_key(|p| part_order(p));
    Ok(files)
}

/// Orders `data_part_2.csv` before `data_part_10.csv`.
fn part_order(path: &Path) -> (PathBuf, String, usize) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let digits = stem.len() - stem.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    let (prefix, number) = stem.split_at(stem.len() - digits);
    (
        path.parent().map(Path::to_path_buf).unwrap_or_default(),
        prefix.to_string(),
        number.parse().unwrap_or(0),
    )
}

pub fn run(config: NormalizeConfig) -> Result<RunReport> {
    let mut tracker = RunTracker::new("normalize");
    let files = input_files(&config.input_pattern)?;
    if files.is_empty() {
        bail!("No input files match {}", config.input_pattern);
    }
    info!("Found {} input files", files.len());
    tracker.start();

    let mut normalizer = Normalizer::new();
    for file in &files {
        let table = match read_table(file) {
            Ok(t) => t,
            Err(e) => {
                warn!(file = %file.display(), "Skipping unreadable file: {:#}", e);
                tracker.skipped(1);
                continue;
            }
        };
        if table.unreadable > 0 {
            tracker.skipped(table.unreadable);
        }
        info!(file = %file.display(), rows = table.rows.len(), "Normalizing");
        for row in &table.rows {
            tracker.processed(1);
            if !normalizer.add_row(row) {
                tracker.skipped(1);
            }
        }
    }

    if normalizer.rows_without_doi > 0 {
        warn!("Skipped {} rows without a DOI", normalizer.rows_without_doi);
    }

    let written = normalizer.write(&config.output_dir, config.max_rows)?;
    tracker.written(written);
    Ok(tracker.finish())
}
