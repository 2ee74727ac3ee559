use research_etl::config::{KeyedExtractConfig, OpenAlexConfig, Pacing};
use research_etl::extract::{failed_path, openalex, FailedLookup};
use research_etl::run::RunStatus;
use research_etl::tabular::read_table;
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn write_input(path: &Path, dois: &[&str]) {
    let mut content = String::from("dc_identifier,prism_doi\n");
    for (i, doi) in dois.iter().enumerate() {
        content.push_str(&format!("SCOPUS_ID:{},{}\n", i, doi));
    }
    fs::write(path, content).unwrap();
}

fn config(server: &MockServer, dir: &TempDir) -> OpenAlexConfig {
    OpenAlexConfig {
        email: "etl@example.org".to_string(),
        base_url: server.uri(),
        run: KeyedExtractConfig {
            input: dir.path().join("search.csv"),
            key_column: "prism_doi".to_string(),
            output: dir.path().join("enriched.csv"),
            pacing: Pacing::immediate(4),
        },
    }
}

fn work(id: &str) -> serde_json::Value {
    serde_json::json!({
        "id": format!("https://openalex.org/{}", id),
        "doi": "https://doi.org/10.1/x",
        "title": "A study",
        "publication_year": 2024,
        "primary_location": {"source": {"display_name": "Journal X", "host_organization_lineage_names": ["Pub A", "Pub B"]}},
        "authorships": [{"author": {"id": "A1"}, "author_position": "first"}],
        "counts_by_year": [{"year": 2024, "cited_by_count": 3}]
    })
}

#[tokio::test]
async fn test_single_doi_yields_one_row_with_bare_doi() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    write_input(&temp_dir.path().join("search.csv"), &["https://doi.org/10.1/X"]);

    Mock::given(method("GET"))
        .and(path("/works/doi:10.1/x"))
        .and(query_param("mailto", "etl@example.org"))
        .respond_with(ResponseTemplate::new(200).set_body_json(work("W1")))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = config(&mock_server, &temp_dir);
    let report = openalex::run_async(config.clone()).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.written, 1);

    let table = read_table(&config.run.output).unwrap();
    assert_eq!(table.rows.len(), 1);
    let row = &table.rows[0];
    assert_eq!(row["doi"], "10.1/x");
    assert_eq!(row["oa_status"], "success");
    assert_eq!(row["oa_id"], "https://openalex.org/W1");
    assert_eq!(row["oa_publication_year"], "2024");
    assert_eq!(row["oa_primary_location_source_name"], "Journal X");
    assert_eq!(
        row["oa_primary_location_source_host_org_lineage_names"],
        "Pub A; Pub B"
    );
    assert!(row["oa_authorships"].contains("\"A1\""));
    assert_eq!(row["dc_identifier"], "SCOPUS_ID:0");
}

#[tokio::test]
async fn test_failed_lookup_is_logged_and_retried_next_run() {
    let temp_dir = TempDir::new().unwrap();
    let dois: Vec<String> = (0..10).map(|i| format!("10.1000/a{}", i)).collect();
    let doi_refs: Vec<&str> = dois.iter().map(String::as_str).collect();
    write_input(&temp_dir.path().join("search.csv"), &doi_refs);

    // First run: a3 fails with a server error.
    let first_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/works/doi:10.1000/a3"))
        .respond_with(ResponseTemplate::new(500))
        .with_priority(1)
        .expect(1)
        .mount(&first_server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/works/doi:10\.1000/a\d$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(work("W")))
        .expect(9)
        .mount(&first_server)
        .await;

    let first = config(&first_server, &temp_dir);
    let report = openalex::run_async(first.clone()).await.unwrap();

    assert_eq!(report.status, RunStatus::CompletedWithSkips);
    assert_eq!(report.written, 9);
    assert_eq!(report.skipped, 1);

    let table = read_table(&first.run.output).unwrap();
    assert_eq!(table.rows.len(), 9);
    assert!(table.rows.iter().all(|r| r["oa_status"] == "success"));
    assert!(!table.rows.iter().any(|r| r["doi"] == "10.1000/a3"));

    let failed = fs::read_to_string(failed_path(&first.run.output)).unwrap();
    let entries: Vec<FailedLookup> = failed
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key, "10.1000/a3");
    assert_eq!(entries[0].source, "openalex");

    // Second run: only the failed key is requested.
    let second_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/works/doi:10.1000/a3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(work("W3")))
        .expect(1)
        .mount(&second_server)
        .await;

    let report = openalex::run_async(config(&second_server, &temp_dir))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.already_done, 9);
    assert_eq!(report.written, 1);

    let table = read_table(&first.run.output).unwrap();
    assert_eq!(table.rows.len(), 10);
}

#[tokio::test]
async fn test_rerun_on_complete_output_writes_nothing() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    write_input(
        &temp_dir.path().join("search.csv"),
        &["10.1/a", "10.1/b", "10.1/a"],
    );

    Mock::given(method("GET"))
        .and(path_regex(r"^/works/doi:10\.1/[ab]$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(work("W")))
        .expect(2)
        .mount(&mock_server)
        .await;

    let config = config(&mock_server, &temp_dir);
    openalex::run_async(config.clone()).await.unwrap();
    let before = fs::read_to_string(&config.run.output).unwrap();

    let report = openalex::run_async(config.clone()).await.unwrap();
    let after = fs::read_to_string(&config.run.output).unwrap();

    assert_eq!(report.written, 0);
    assert_eq!(report.already_done, 2);
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_not_found_is_recorded_and_not_retried() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    write_input(&temp_dir.path().join("search.csv"), &["10.9/missing"]);

    Mock::given(method("GET"))
        .and(path("/works/doi:10.9/missing"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = config(&mock_server, &temp_dir);
    let report = openalex::run_async(config.clone()).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);

    let table = read_table(&config.run.output).unwrap();
    assert_eq!(table.rows.len(), 1);
    assert_eq!(table.rows[0]["oa_status"], "not_found");
    assert_eq!(table.rows[0]["oa_title"], "");

    let report = openalex::run_async(config).await.unwrap();
    assert_eq!(report.already_done, 1);
}

#[tokio::test]
async fn test_empty_payload_counts_as_not_found() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    write_input(&temp_dir.path().join("search.csv"), &["10.9/empty"]);

    Mock::given(method("GET"))
        .and(path("/works/doi:10.9/empty"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = config(&mock_server, &temp_dir);
    let report = openalex::run_async(config.clone()).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.skipped, 0);
    let table = read_table(&config.run.output).unwrap();
    assert_eq!(table.rows[0]["oa_status"], "not_found");
    let failed = fs::read_to_string(failed_path(&config.run.output)).unwrap_or_default();
    assert!(failed.is_empty());
}

#[tokio::test]
async fn test_invalid_and_empty_dois_are_not_requested() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    write_input(
        &temp_dir.path().join("search.csv"),
        &["", "invalid-doi-for-testing", "10.1/ok"],
    );

    Mock::given(method("GET"))
        .and(path("/works/doi:10.1/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(work("W")))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = config(&mock_server, &temp_dir);
    let report = openalex::run_async(config.clone()).await.unwrap();

    assert_eq!(report.written, 1);
    assert_eq!(read_table(&config.run.output).unwrap().rows.len(), 1);
}

#[tokio::test]
async fn test_missing_key_column_is_fatal() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("search.csv"), "title\nA\n").unwrap();

    let config = config(&mock_server, &temp_dir);
    let err = openalex::run_async(config.clone()).await.unwrap_err();

    assert!(err.to_string().contains("prism_doi"));
    assert!(!config.run.output.exists());
}

#[tokio::test]
async fn test_missing_input_is_fatal() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();

    let result = openalex::run_async(config(&mock_server, &temp_dir)).await;

    assert!(result.is_err());
}
