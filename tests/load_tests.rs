use research_etl::load::{load_table, load_tables, MemoryStore, TableStore, Upserted};
use research_etl::run::{RunStatus, RunTracker};
use research_etl::schema::{
    Cell, AUTHORSHIP_COUNTRIES, CATALOG, PUBLICATIONS, PUBLICATION_CITATION_COUNTS,
    PUBLICATION_FUNDING,
};
use research_etl::tabular::Row;
use std::fs;
use tempfile::TempDir;

fn row(pairs: &[(&str, &str)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn test_upsert_unchanged_row_twice_keeps_one_row() {
    let mut store = MemoryStore::new();
    store.ensure_table(&PUBLICATIONS).await.unwrap();
    let cells = PUBLICATIONS.coerce(&row(&[("doi", "10.1/x"), ("oa_title", "A")]));

    let first = store.upsert(&PUBLICATIONS, &cells).await.unwrap();
    let second = store.upsert(&PUBLICATIONS, &cells).await.unwrap();

    assert_eq!(first, Upserted::Inserted);
    assert_eq!(second, Upserted::Unchanged);
    assert_eq!(store.len("publications"), 1);
}

#[tokio::test]
async fn test_changed_payload_updates_in_place() {
    let mut store = MemoryStore::new();
    store.ensure_table(&PUBLICATIONS).await.unwrap();

    let original = PUBLICATIONS.coerce(&row(&[("doi", "10.1/x"), ("oa_title", "A")]));
    let changed = PUBLICATIONS.coerce(&row(&[("doi", "10.1/x"), ("oa_title", "B")]));
    store.upsert(&PUBLICATIONS, &original).await.unwrap();
    let outcome = store.upsert(&PUBLICATIONS, &changed).await.unwrap();

    assert_eq!(outcome, Upserted::Updated);
    assert_eq!(store.len("publications"), 1);
    let stored = store.get("publications", &["10.1/x"]).unwrap();
    assert_eq!(stored[3], Cell::Text("B".to_string()));
}

#[tokio::test]
async fn test_upsert_before_ensure_table_fails() {
    let mut store = MemoryStore::new();
    let cells = PUBLICATIONS.coerce(&row(&[("doi", "10.1/x")]));
    assert!(store.upsert(&PUBLICATIONS, &cells).await.is_err());
}

#[tokio::test]
async fn test_null_key_is_rejected() {
    let mut store = MemoryStore::new();
    store.ensure_table(&PUBLICATION_CITATION_COUNTS).await.unwrap();
    let cells = PUBLICATION_CITATION_COUNTS.coerce(&row(&[("doi", "10.1/x"), ("year", "")]));
    assert!(store.upsert(&PUBLICATION_CITATION_COUNTS, &cells).await.is_err());
}

#[tokio::test]
async fn test_empty_award_id_still_loads() {
    let mut store = MemoryStore::new();
    store.ensure_table(&PUBLICATION_FUNDING).await.unwrap();
    let cells = PUBLICATION_FUNDING.coerce(&row(&[
        ("doi", "10.1/x"),
        ("oa_funder_id", "F1"),
        ("oa_award_id", ""),
    ]));

    let outcome = store.upsert(&PUBLICATION_FUNDING, &cells).await.unwrap();

    assert_eq!(outcome, Upserted::Inserted);
    assert!(store.get("publication_funding", &["10.1/x", "F1", ""]).is_some());
}

#[tokio::test]
async fn test_all_key_table_ignores_duplicates() {
    let mut store = MemoryStore::new();
    store.ensure_table(&AUTHORSHIP_COUNTRIES).await.unwrap();
    let cells = AUTHORSHIP_COUNTRIES.coerce(&row(&[
        ("doi", "10.1/x"),
        ("oa_author_id", "A1"),
        ("oa_country_code", "HK"),
    ]));

    store.upsert(&AUTHORSHIP_COUNTRIES, &cells).await.unwrap();
    let again = store.upsert(&AUTHORSHIP_COUNTRIES, &cells).await.unwrap();

    assert_eq!(again, Upserted::Unchanged);
    assert_eq!(store.len("authorship_countries"), 1);
}

#[tokio::test]
async fn test_duplicate_doi_across_files_last_write_wins() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("publications_1.csv"),
        "doi,oa_title,oa_cited_by_count\n10.1/x,First,1\n",
    )
    .unwrap();
    fs::write(
        temp_dir.path().join("publications_2.csv"),
        "doi,oa_title,oa_cited_by_count\n10.1/x,Second,2.0\n",
    )
    .unwrap();

    let mut store = MemoryStore::new();
    let mut tracker = RunTracker::new("load");
    tracker.start();
    let loads = load_tables(&mut store, temp_dir.path(), CATALOG, &mut tracker)
        .await
        .unwrap();

    assert_eq!(loads.len(), 1);
    assert_eq!(loads[0].files, 2);
    assert_eq!(loads[0].inserted, 1);
    assert_eq!(loads[0].updated, 1);
    assert_eq!(store.len("publications"), 1);
    let stored = store.get("publications", &["10.1/x"]).unwrap();
    assert_eq!(stored[3], Cell::Text("Second".to_string()));
    assert_eq!(stored[9], Cell::Integer(2));
    assert_eq!(tracker.finish().status, RunStatus::Completed);
}

#[tokio::test]
async fn test_tables_load_in_catalog_order_and_skip_missing() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("authors.csv"),
        "oa_author_id,oa_author_name,oa_author_orcid\nA1,Name,\n",
    )
    .unwrap();
    fs::write(
        temp_dir.path().join("authorship_countries.csv"),
        "doi,oa_author_id,oa_country_code\n10.1/x,A1,HK\n",
    )
    .unwrap();

    let mut store = MemoryStore::new();
    let mut tracker = RunTracker::new("load");
    let loads = load_tables(&mut store, temp_dir.path(), CATALOG, &mut tracker)
        .await
        .unwrap();

    let order: Vec<&str> = loads.iter().map(|l| l.table).collect();
    assert_eq!(order, vec!["authors", "authorship_countries"]);
    assert_eq!(store.len("authors"), 1);
    assert!(!store.has_table("publications"));
}

/// Fails every DDL statement.
struct BrokenDdl(MemoryStore);

#[async_trait::async_trait]
impl TableStore for BrokenDdl {
    async fn ensure_table(&mut self, schema: &research_etl::schema::TableSchema) -> anyhow::Result<()> {
        anyhow::bail!("permission denied for table {}", schema.name)
    }

    async fn upsert(
        &mut self,
        schema: &research_etl::schema::TableSchema,
        cells: &[Cell],
    ) -> anyhow::Result<Upserted> {
        self.0.upsert(schema, cells).await
    }
}

#[tokio::test]
async fn test_failed_ddl_skips_table() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("publications.csv");
    fs::write(&file, "doi\n10.1/a\n10.1/b\n").unwrap();

    let mut store = BrokenDdl(MemoryStore::new());
    let mut tracker = RunTracker::new("load");
    tracker.start();
    let load = load_table(&mut store, &PUBLICATIONS, &[file], &mut tracker)
        .await
        .unwrap();

    assert_eq!(load.failed, 2);
    let report = tracker.finish();
    assert_eq!(report.status, RunStatus::CompletedWithSkips);
    assert_eq!(report.skipped, 2);
}

#[tokio::test]
async fn test_unparseable_values_become_null() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("publication_citation_counts.csv"),
        "doi,year,cited_by_count\n10.1/x,2024,many\n",
    )
    .unwrap();

    let mut store = MemoryStore::new();
    let mut tracker = RunTracker::new("load");
    load_tables(&mut store, temp_dir.path(), CATALOG, &mut tracker)
        .await
        .unwrap();

    let stored = store
        .get("publication_citation_counts", &["10.1/x", "2024"])
        .unwrap();
    assert_eq!(stored[2], Cell::Null);
}

#[tokio::test]
async fn test_failed_row_is_skipped_and_later_rows_load() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("publication_citation_counts.csv");
    fs::write(
        &file,
        "doi,year,cited_by_count\n10.1/x,2023,1\n10.1/x,,2\n10.1/x,2024,3\n",
    )
    .unwrap();

    let mut store = MemoryStore::new();
    let mut tracker = RunTracker::new("load");
    tracker.start();
    let load = load_table(&mut store, &PUBLICATION_CITATION_COUNTS, &[file], &mut tracker)
        .await
        .unwrap();

    assert_eq!(load.rows, 3);
    assert_eq!(load.inserted, 2);
    assert_eq!(load.failed, 1);
    assert_eq!(store.len("publication_citation_counts"), 2);
    let latest = store
        .get("publication_citation_counts", &["10.1/x", "2024"])
        .unwrap();
    assert_eq!(latest[2], Cell::Integer(3));

    let report = tracker.finish();
    assert_eq!(report.status, RunStatus::CompletedWithSkips);
    assert_eq!(report.written, 2);
    assert_eq!(report.skipped, 1);
}
