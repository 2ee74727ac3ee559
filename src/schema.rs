//! Table catalog for the normalized output and the database.
//!
//! The normalizer takes its column lists from here and the loader its DDL,
//! primary keys, and per-column coercion.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Varchar(u16),
    Integer,
    Float,
    Boolean,
    Date,
    Timestamp,
    TimestampTz,
}

impl ColumnType {
    pub fn is_text(self) -> bool {
        matches!(self, ColumnType::Text | ColumnType::Varchar(_))
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Text => f.write_str("TEXT"),
            ColumnType::Varchar(n) => write!(f, "VARCHAR({})", n),
            ColumnType::Integer => f.write_str("INTEGER"),
            ColumnType::Float => f.write_str("DOUBLE PRECISION"),
            ColumnType::Boolean => f.write_str("BOOLEAN"),
            ColumnType::Date => f.write_str("DATE"),
            ColumnType::Timestamp => f.write_str("TIMESTAMP"),
            ColumnType::TimestampTz => f.write_str("TIMESTAMPTZ"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub sql_type: ColumnType,
}

const fn col(name: &'static str, sql_type: ColumnType) -> Column {
    Column { name, sql_type }
}

#[derive(Debug)]
pub struct TableSchema {
    pub name: &'static str,
    pub columns: &'static [Column],
    pub primary_key: &'static [&'static str],
}

impl TableSchema {
    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }

    pub fn is_key(&self, column: &str) -> bool {
        self.primary_key.contains(&column)
    }

    pub fn non_key_columns(&self) -> impl Iterator<Item = &Column> + '_ {
        self.columns.iter().filter(|c| !self.is_key(c.name))
    }

    /// Coerces a raw row into one cell per column, in column order.
    pub fn coerce(&self, row: &crate::tabular::Row) -> Vec<Cell> {
        self.columns
            .iter()
            .map(|c| {
                let raw = row.get(c.name).map(String::as_str).unwrap_or("");
                Cell::parse(raw, c.sql_type, self.is_key(c.name))
            })
            .collect()
    }
}

use ColumnType::*;

pub const RAW_SCOPUS_SEARCH: TableSchema = TableSchema {
    name: "raw_scopus_search",
    columns: &[
        col("prism_url", Text),
        col("dc_identifier", Text),
        col("prism_publicationname", Text),
        col("prism_coverdate", Date),
        col("prism_doi", Text),
        col("citedby_count", Integer),
        col("subtype", Text),
        col("subtypedescription", Text),
        col("publication_year", Integer),
        col("publication_month", Integer),
        col("doi", Text),
    ],
    primary_key: &["dc_identifier"],
};

pub const PUBLICATIONS: TableSchema = TableSchema {
    name: "publications",
    columns: &[
        col("doi", Text),
        col("oa_id", Text),
        col("oa_doi", Text),
        col("oa_title", Text),
        col("oa_display_name", Text),
        col("oa_publication_year", Integer),
        col("oa_publication_date", Date),
        col("oa_language", Varchar(10)),
        col("oa_type", Text),
        col("oa_cited_by_count", Integer),
        col("oa_fwci", Float),
        col("oa_is_retracted", Boolean),
        col("oa_updated_date", Timestamp),
        col("oa_created_date", Date),
        col("oa_primary_location_is_oa", Boolean),
        col("oa_primary_location_landing_page_url", Text),
        col("oa_primary_location_source_id", Text),
        col("oa_primary_location_source_name", Text),
        col("oa_primary_location_source_issn_l", Text),
        col("oa_primary_location_source_is_oa", Boolean),
        col("oa_primary_location_source_is_indexed_in_scopus", Boolean),
        col("oa_primary_location_source_host_org_name", Text),
        col("oa_primary_location_source_host_org_lineage_names", Text),
        col("oa_primary_location_source_type", Text),
        col("oa_biblio_volume", Text),
        col("oa_biblio_issue", Text),
        col("oa_biblio_first_page", Text),
        col("oa_biblio_last_page", Text),
        col("oa_primary_topic_id", Text),
        col("oa_primary_topic_name", Text),
        col("oa_primary_topic_score", Float),
        col("oa_primary_topic_subfield_name", Text),
        col("oa_primary_topic_field_name", Text),
        col("oa_primary_topic_domain_name", Text),
        col("oa_cnp_value", Float),
        col("oa_cnp_is_top_1_percent", Boolean),
        col("oa_cnp_is_top_10_percent", Boolean),
        col("oa_cbpy_min", Integer),
        col("oa_cbpy_max", Integer),
        col("oa_status", Text),
    ],
    primary_key: &["doi"],
};

pub const AUTHORS: TableSchema = TableSchema {
    name: "authors",
    columns: &[
        col("oa_author_id", Text),
        col("oa_author_name", Text),
        col("oa_author_orcid", Text),
    ],
    primary_key: &["oa_author_id"],
};

pub const INSTITUTIONS: TableSchema = TableSchema {
    name: "institutions",
    columns: &[
        col("oa_institution_id", Text),
        col("oa_institution_name", Text),
        col("oa_institution_ror", Text),
        col("oa_institution_country_code", Varchar(10)),
        col("oa_institution_type", Text),
    ],
    primary_key: &["oa_institution_id"],
};

pub const FUNDERS: TableSchema = TableSchema {
    name: "funders",
    columns: &[col("oa_funder_id", Text), col("oa_funder_name", Text)],
    primary_key: &["oa_funder_id"],
};

pub const PUBLICATION_AUTHORSHIPS: TableSchema = TableSchema {
    name: "publication_authorships",
    columns: &[
        col("doi", Text),
        col("oa_author_id", Text),
        col("oa_author_position", Text),
        col("oa_author_is_corresponding", Boolean),
        col("oa_author_raw_name", Text),
    ],
    primary_key: &["doi", "oa_author_id", "oa_author_position"],
};

pub const AUTHORSHIP_INSTITUTIONS: TableSchema = TableSchema {
    name: "authorship_institutions",
    columns: &[
        col("doi", Text),
        col("oa_author_id", Text),
        col("oa_institution_id", Text),
        col("oa_raw_affiliation_string", Text),
    ],
    primary_key: &["doi", "oa_author_id", "oa_institution_id"],
};

pub const AUTHORSHIP_COUNTRIES: TableSchema = TableSchema {
    name: "authorship_countries",
    columns: &[
        col("doi", Text),
        col("oa_author_id", Text),
        col("oa_country_code", Varchar(10)),
    ],
    primary_key: &["doi", "oa_author_id", "oa_country_code"],
};

pub const PUBLICATION_FUNDING: TableSchema = TableSchema {
    name: "publication_funding",
    columns: &[
        col("doi", Text),
        col("oa_funder_id", Text),
        col("oa_award_id", Text),
    ],
    primary_key: &["doi", "oa_funder_id", "oa_award_id"],
};

pub const PUBLICATION_CITATION_COUNTS: TableSchema = TableSchema {
    name: "publication_citation_counts",
    columns: &[
        col("doi", Text),
        col("year", Integer),
        col("cited_by_count", Integer),
    ],
    primary_key: &["doi", "year"],
};

pub const RAW_SPEND_FACEBOOK: TableSchema = TableSchema {
    name: "raw_spend_facebook",
    columns: &[
        col("date", Date),
        col("campaign_id", Text),
        col("campaign_name", Text),
        col("delivery_status", Text),
        col("spend", Float),
        col("reach", Integer),
        col("link_click", Integer),
        col("frequency", Float),
        col("impressions", Integer),
        col("results", Integer),
        col("result_type", Text),
        col("cost_per_result", Float),
        col("delivery_level", Text),
        col("date_start", Date),
        col("date_stop", Date),
        col("report_start_date", Date),
        col("report_end_date", Date),
        col("updated_at", TimestampTz),
        col("ad_start_time", TimestampTz),
        col("ad_stop_time", TimestampTz),
    ],
    primary_key: &["date", "campaign_id"],
};

/// SCOPUS Abstract Retrieval output, one row per looked-up DOI.
pub const SCOPUS_ABSTRACTS: TableSchema = TableSchema {
    name: "scopus_abstracts",
    columns: &[
        col("doi", Text),
        col("dc_identifier", Text),
        col("abs_identifier", Text),
        col("abs_title", Text),
        col("abs_cover_date", Date),
        col("abs_citedby_count", Integer),
        col("abs_publication_name", Text),
        col("abs_subtype_description", Text),
        col("abs_volume", Text),
        col("abs_issue", Text),
        col("abs_page_range", Text),
        col("abs_openaccess", Boolean),
        col("abs_pubmed_id", Text),
        col("abs_authors", Text),
        col("abs_affiliations", Text),
        col("abs_status", Text),
    ],
    primary_key: &["doi"],
};

/// Every table, parents before children.
pub const CATALOG: &[&TableSchema] = &[
    &RAW_SCOPUS_SEARCH,
    &SCOPUS_ABSTRACTS,
    &PUBLICATIONS,
    &AUTHORS,
    &INSTITUTIONS,
    &FUNDERS,
    &PUBLICATION_AUTHORSHIPS,
    &AUTHORSHIP_INSTITUTIONS,
    &AUTHORSHIP_COUNTRIES,
    &PUBLICATION_FUNDING,
    &PUBLICATION_CITATION_COUNTS,
    &RAW_SPEND_FACEBOOK,
];

/// A typed database value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Text(String),
    Integer(i32),
    Float(f64),
    Boolean(bool),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
}

impl Cell {
    /// Coerces a raw text value. Never fails: unusable values become `Null`.
    /// Empty text in a key column stays an empty string so the row keeps its key.
    pub fn parse(raw: &str, sql_type: ColumnType, in_key: bool) -> Cell {
        let value = raw.trim();
        if value.is_empty() {
            return if in_key && sql_type.is_text() {
                Cell::Text(String::new())
            } else {
                Cell::Null
            };
        }

        let cell = match sql_type {
            Text | Varchar(_) => Some(Cell::Text(raw.to_string())),
            Integer => parse_integer(value).map(Cell::Integer),
            Float => value
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Cell::Float),
            Boolean => parse_bool(value).map(Cell::Boolean),
            Date => parse_date(value).map(Cell::Date),
            Timestamp => parse_timestamp(value).map(|t| Cell::Timestamp(t.naive_utc())),
            TimestampTz => parse_timestamp(value).map(Cell::TimestampTz),
        };
        cell.unwrap_or(Cell::Null)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

fn parse_integer(value: &str) -> Option<i32> {
    if let Ok(i) = value.parse::<i32>() {
        return Some(i);
    }
    let f = value.parse::<f64>().ok()?;
    if f.fract() == 0.0 && f >= f64::from(i32::MIN) && f <= f64::from(i32::MAX) {
        Some(f as i32)
    } else {
        None
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "y" => Some(true),
        "false" | "f" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(value).map(|t| t.date_naive()))
}

/// RFC 3339, Graph API style `+0800` offsets, naive timestamps (taken as UTC)
/// and bare dates (midnight UTC).
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(t.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(value, format) {
            return Some(t.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
}
