//! OpenAlex works lookup by DOI.
//!
//! Requests carry a `mailto` parameter and a user agent naming the contact
//! email, which puts them in the OpenAlex polite pool.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::mapping::{join, json, scalar, FieldSpec};
use super::{extract_keyed, get_json, http_client, normalize_doi, KeyedSource};
use crate::config::OpenAlexConfig;
use crate::error::FetchError;
use crate::run::RunReport;

pub const OPENALEX_FIELDS: &[FieldSpec] = &[
    scalar("oa_id", "/id"),
    scalar("oa_doi", "/doi"),
    scalar("oa_title", "/title"),
    scalar("oa_display_name", "/display_name"),
    scalar("oa_publication_year", "/publication_year"),
    scalar("oa_publication_date", "/publication_date"),
    scalar("oa_language", "/language"),
    scalar("oa_type", "/type"),
    scalar("oa_cited_by_count", "/cited_by_count"),
    scalar("oa_fwci", "/fwci"),
    scalar("oa_is_retracted", "/is_retracted"),
    scalar("oa_updated_date", "/updated_date"),
    scalar("oa_created_date", "/created_date"),
    scalar("oa_primary_location_is_oa", "/primary_location/is_oa"),
    scalar(
        "oa_primary_location_landing_page_url",
        "/primary_location/landing_page_url",
    ),
    scalar("oa_primary_location_source_id", "/primary_location/source/id"),
    scalar(
        "oa_primary_location_source_name",
        "/primary_location/source/display_name",
    ),
    scalar(
        "oa_primary_location_source_issn_l",
        "/primary_location/source/issn_l",
    ),
    scalar(
        "oa_primary_location_source_is_oa",
        "/primary_location/source/is_oa",
    ),
    scalar(
        "oa_primary_location_source_is_indexed_in_scopus",
        "/primary_location/source/is_indexed_in_scopus",
    ),
    scalar(
        "oa_primary_location_source_host_org_name",
        "/primary_location/source/host_organization_name",
    ),
    join(
        "oa_primary_location_source_host_org_lineage_names",
        "/primary_location/source/host_organization_lineage_names",
        "",
        "; ",
    ),
    scalar("oa_primary_location_source_type", "/primary_location/source/type"),
    scalar("oa_biblio_volume", "/biblio/volume"),
    scalar("oa_biblio_issue", "/biblio/issue"),
    scalar("oa_biblio_first_page", "/biblio/first_page"),
    scalar("oa_biblio_last_page", "/biblio/last_page"),
    scalar("oa_primary_topic_id", "/primary_topic/id"),
    scalar("oa_primary_topic_name", "/primary_topic/display_name"),
    scalar("oa_primary_topic_score", "/primary_topic/score"),
    scalar(
        "oa_primary_topic_subfield_name",
        "/primary_topic/subfield/display_name",
    ),
    scalar("oa_primary_topic_field_name", "/primary_topic/field/display_name"),
    scalar(
        "oa_primary_topic_domain_name",
        "/primary_topic/domain/display_name",
    ),
    scalar("oa_cnp_value", "/citation_normalized_percentile/value"),
    scalar(
        "oa_cnp_is_top_1_percent",
        "/citation_normalized_percentile/is_in_top_1_percent",
    ),
    scalar(
        "oa_cnp_is_top_10_percent",
        "/citation_normalized_percentile/is_in_top_10_percent",
    ),
    scalar("oa_cbpy_min", "/cited_by_percentile_year/min"),
    scalar("oa_cbpy_max", "/cited_by_percentile_year/max"),
    json("oa_authorships", "/authorships"),
    json("oa_grants", "/grants"),
    json("oa_counts_by_year", "/counts_by_year"),
];

pub struct OpenAlexClient {
    client: Client,
    base_url: String,
    email: String,
}

impl OpenAlexClient {
    pub fn new(config: &OpenAlexConfig) -> Result<Self> {
        let user_agent = format!("research-etl/{} (mailto:{})", env!("CARGO_PKG_VERSION"), config.email);
        Ok(Self {
            client: http_client(config.run.pacing.request_timeout, &user_agent)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            email: config.email.clone(),
        })
    }

    pub fn work_url(&self, doi: &str) -> String {
        let encoded: Vec<String> = doi
            .split('/')
            .map(|part| urlencoding::encode(part).into_owned())
            .collect();
        format!("{}/works/doi:{}", self.base_url, encoded.join("/"))
    }
}

#[async_trait]
impl KeyedSource for OpenAlexClient {
    fn name(&self) -> &'static str {
        "openalex"
    }

    fn key_column(&self) -> &'static str {
        "doi"
    }

    fn status_column(&self) -> &'static str {
        "oa_status"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        OPENALEX_FIELDS
    }

    fn normalize_key(&self, raw: &str) -> Option<String> {
        normalize_doi(raw)
    }

    async fn fetch(&self, key: &str) -> Result<Option<Value>, FetchError> {
        let request = self
            .client
            .get(self.work_url(key))
            .query(&[("mailto", self.email.as_str())])
            .header("Accept", "application/json");

        match get_json(request).await? {
            Some(work) if work.get("id").is_some() => Ok(Some(work)),
            Some(_) => Ok(None),
            None => Ok(None),
        }
    }
}

pub fn run(config: OpenAlexConfig) -> Result<RunReport> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(config))
}

pub async fn run_async(config: OpenAlexConfig) -> Result<RunReport> {
    let client = OpenAlexClient::new(&config)?;
    extract_keyed(&client, &config.run).await
}
