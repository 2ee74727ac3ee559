use research_etl::config::{KeyedExtractConfig, NormalizeConfig, OpenAlexConfig, Pacing, SplitConfig};
use research_etl::extract::openalex;
use research_etl::load::{load_tables, MemoryStore};
use research_etl::run::{RunStatus, RunTracker};
use research_etl::schema::{Cell, CATALOG};
use research_etl::{normalize, split};
use std::fs;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn work(doi: &str, authors: &[(&str, &str)]) -> serde_json::Value {
    serde_json::json!({
        "id": format!("https://openalex.org/W-{}", doi),
        "doi": format!("https://doi.org/{}", doi),
        "title": format!("Work {}", doi),
        "publication_year": 2024,
        "publication_date": "2024-05-01",
        "cited_by_count": 4,
        "is_retracted": false,
        "authorships": authors.iter().map(|(id, position)| serde_json::json!({
            "author_position": position,
            "author": {"id": id, "display_name": format!("Author {}", id)},
            "institutions": [{"id": "I1", "display_name": "Inst", "country_code": "HK"}],
            "countries": ["HK"],
            "raw_affiliation_strings": ["Inst"]
        })).collect::<Vec<_>>(),
        "grants": [{"funder": "F1", "funder_display_name": "Fund", "award_id": null}],
        "counts_by_year": [{"year": 2024, "cited_by_count": 4}]
    })
}

#[tokio::test]
async fn test_full_pipeline_enrich_split_normalize_load() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();

    fs::write(
        root.join("scopus_search.csv"),
        "prism_url,dc_identifier,prism_doi,prism_coverdate,citedby_count\n\
         u1,SCOPUS_ID:1,10.1/a,2024-05-01,4\n\
         u2,SCOPUS_ID:2,10.1/b,2024-06-01,1\n\
         u3,SCOPUS_ID:3,10.1/c,2024-07-01,0\n",
    )
    .unwrap();

    Mock::given(method("GET"))
        .and(path("/works/doi:10.1/a"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(work("10.1/a", &[("A1", "first"), ("A2", "last")])),
        )
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/works/doi:10.1/b"))
        .respond_with(ResponseTemplate::new(200).set_body_json(work("10.1/b", &[("A1", "first")])))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/works/doi:10.1/c"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    // Extract
    let enriched = root.join("extracted").join("openalex_enriched.csv");
    let report = openalex::run_async(OpenAlexConfig {
        email: "etl@example.org".to_string(),
        base_url: mock_server.uri(),
        run: KeyedExtractConfig {
            input: root.join("scopus_search.csv"),
            key_column: "prism_doi".to_string(),
            output: enriched.clone(),
            pacing: Pacing::immediate(10),
        },
    })
    .await
    .unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.written, 3);

    // Split
    split::run(SplitConfig {
        input: enriched,
        output_base: root.join("output_splits").join("data_part"),
        max_rows: 2,
    })
    .unwrap();
    assert!(root.join("output_splits/data_part_2.csv").exists());

    // Normalize
    let normalized = root.join("normalized");
    let report = normalize::run(NormalizeConfig {
        input_pattern: root
            .join("output_splits")
            .join("data_part_*.csv")
            .to_string_lossy()
            .into_owned(),
        output_dir: normalized.clone(),
        max_rows: 5000,
    })
    .unwrap();
    assert_eq!(report.processed, 3);

    // Load
    let mut store = MemoryStore::new();
    let mut tracker = RunTracker::new("load");
    tracker.start();
    load_tables(&mut store, &normalized, CATALOG, &mut tracker)
        .await
        .unwrap();
    let report = tracker.finish();
    assert_eq!(report.status, RunStatus::Completed);

    assert_eq!(store.len("raw_scopus_search"), 3);
    assert_eq!(store.len("publications"), 3);
    assert_eq!(store.len("authors"), 2);
    assert_eq!(store.len("institutions"), 1);
    assert_eq!(store.len("funders"), 1);
    assert_eq!(store.len("publication_authorships"), 3);
    assert_eq!(store.len("authorship_institutions"), 3);
    assert_eq!(store.len("authorship_countries"), 3);
    assert_eq!(store.len("publication_funding"), 2);
    assert_eq!(store.len("publication_citation_counts"), 2);

    let publication = store.get("publications", &["10.1/a"]).unwrap();
    assert_eq!(publication[5], Cell::Integer(2024));
    assert_eq!(publication[11], Cell::Boolean(false));
    let missing = store.get("publications", &["10.1/c"]).unwrap();
    assert_eq!(missing[3], Cell::Null);
    assert_eq!(
        missing.last().unwrap(),
        &Cell::Text("not_found".to_string())
    );

    // A second load of the same files changes nothing.
    let mut tracker = RunTracker::new("load");
    let loads = load_tables(&mut store, &normalized, CATALOG, &mut tracker)
        .await
        .unwrap();
    assert!(loads.iter().all(|l| l.inserted == 0 && l.updated == 0));
}
