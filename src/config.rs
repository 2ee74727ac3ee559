//! Run configuration.
//!
//! Every stage reads a fixed set of named options from the environment (after an
//! optional `.env` file). Values are parsed into an explicit config struct per stage
//! before any work starts; all missing required keys are reported in one error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Snapshot of the configuration variables a run can see.
#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: HashMap<String, String>,
}

impl Env {
    /// Reads `.env` (if present) and then the process environment.
    pub fn load() -> Self {
        dotenv::dotenv().ok();
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Blank values count as unset.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn reader(&self) -> Reader<'_> {
        Reader {
            env: self,
            missing: Vec::new(),
        }
    }
}

/// Collects every missing required key before failing.
struct Reader<'a> {
    env: &'a Env,
    missing: Vec<String>,
}

impl Reader<'_> {
    fn required(&mut self, key: &str) -> String {
        match self.env.get(key) {
            Some(v) => v.to_string(),
            None => {
                self.missing.push(key.to_string());
                String::new()
            }
        }
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.env.get(key).unwrap_or(default).to_string()
    }

    fn path(&self, key: &str, default: &str) -> PathBuf {
        PathBuf::from(self.string(key, default))
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.env.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn positive(&self, key: &str, default: usize) -> Result<usize, ConfigError> {
        let value = self.parsed(key, default)?;
        if value == 0 {
            return Err(ConfigError::Invalid {
                key: key.to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(value)
    }

    fn finish(self) -> Result<(), ConfigError> {
        if self.missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Missing(self.missing))
        }
    }
}

fn list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Rate-limit courtesy delays shared by every extractor.
#[derive(Debug, Clone)]
pub struct Pacing {
    pub batch_size: usize,
    pub batch_pause: Duration,
    pub request_delay: Duration,
    pub request_timeout: Duration,
}

impl Pacing {
    /// No pauses; for tests and local mirrors.
    pub fn immediate(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            batch_pause: Duration::ZERO,
            request_delay: Duration::ZERO,
            request_timeout: Duration::from_secs(10),
        }
    }

    fn from_reader(r: &Reader<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            batch_size: r.positive("BATCH_SIZE", 200)?,
            batch_pause: Duration::from_secs(r.parsed("BATCH_PAUSE_SECS", 60)?),
            request_delay: Duration::from_millis(r.parsed("REQUEST_DELAY_MS", 150)?),
            request_timeout: Duration::from_secs(r.parsed("REQUEST_TIMEOUT_SECS", 30)?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ScopusSearchConfig {
    pub api_key: String,
    pub base_url: String,
    pub affiliation: String,
    pub years: Vec<i32>,
    pub doc_types: Vec<String>,
    pub page_size: usize,
    pub max_results: usize,
    pub output: PathBuf,
    pub pacing: Pacing,
}

impl ScopusSearchConfig {
    pub fn from_env(env: &Env) -> Result<Self, ConfigError> {
        let mut r = env.reader();
        let api_key = r.required("SCOPUS_API_KEY");
        let affiliation = r.required("SCOPUS_AFFILIATION");
        let raw_years = r.required("SCOPUS_YEARS");
        let years = list(&raw_years)
            .iter()
            .map(|y| {
                y.parse::<i32>().map_err(|e| ConfigError::Invalid {
                    key: "SCOPUS_YEARS".to_string(),
                    value: raw_years.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let config = Self {
            api_key,
            base_url: r.string("SCOPUS_BASE_URL", "https://api.elsevier.com"),
            affiliation,
            years,
            doc_types: list(&r.string("SCOPUS_DOC_TYPES", "ar,cp,re")),
            page_size: r.positive("SCOPUS_PAGE_SIZE", 25)?,
            max_results: r.positive("SCOPUS_MAX_RESULTS", 5000)?,
            output: r.path("SCOPUS_OUTPUT_FILE", "extracted/scopus_search.csv"),
            pacing: Pacing::from_reader(&r)?,
        };
        r.finish()?;
        if config.doc_types.is_empty() {
            return Err(ConfigError::Invalid {
                key: "SCOPUS_DOC_TYPES".to_string(),
                value: String::new(),
                reason: "at least one document type is required".to_string(),
            });
        }
        Ok(config)
    }
}

/// Settings for a DOI-keyed enrichment run (OpenAlex or SCOPUS abstracts).
#[derive(Debug, Clone)]
pub struct KeyedExtractConfig {
    pub input: PathBuf,
    pub key_column: String,
    pub output: PathBuf,
    pub pacing: Pacing,
}

#[derive(Debug, Clone)]
pub struct OpenAlexConfig {
    pub email: String,
    pub base_url: String,
    pub run: KeyedExtractConfig,
}

impl OpenAlexConfig {
    pub fn from_env(env: &Env) -> Result<Self, ConfigError> {
        let mut r = env.reader();
        let email = r.required("OPENALEX_EMAIL");
        let config = Self {
            email,
            base_url: r.string("OPENALEX_BASE_URL", "https://api.openalex.org"),
            run: KeyedExtractConfig {
                input: r.path("OPENALEX_INPUT_FILE", "extracted/scopus_search.csv"),
                key_column: r.string("OPENALEX_KEY_COLUMN", "prism_doi"),
                output: r.path("OPENALEX_OUTPUT_FILE", "extracted/openalex_enriched.csv"),
                pacing: Pacing::from_reader(&r)?,
            },
        };
        r.finish()?;
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct ScopusAbstractsConfig {
    pub api_key: String,
    pub base_url: String,
    pub run: KeyedExtractConfig,
}

impl ScopusAbstractsConfig {
    pub fn from_env(env: &Env) -> Result<Self, ConfigError> {
        let mut r = env.reader();
        let api_key = r.required("SCOPUS_API_KEY");
        let config = Self {
            api_key,
            base_url: r.string("SCOPUS_BASE_URL", "https://api.elsevier.com"),
            run: KeyedExtractConfig {
                input: r.path("ABSTRACTS_INPUT_FILE", "extracted/scopus_search.csv"),
                key_column: r.string("ABSTRACTS_KEY_COLUMN", "prism_doi"),
                output: r.path("ABSTRACTS_OUTPUT_FILE", "normalized/scopus_abstracts.csv"),
                pacing: Pacing::from_reader(&r)?,
            },
        };
        r.finish()?;
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct FacebookConfig {
    pub access_token: String,
    pub ad_account_id: String,
    pub base_url: String,
    pub days_back: u32,
    pub utc_offset_hours: i32,
    pub output: PathBuf,
    pub pacing: Pacing,
}

impl FacebookConfig {
    pub fn from_env(env: &Env) -> Result<Self, ConfigError> {
        let mut r = env.reader();
        let access_token = r.required("FB_ACCESS_TOKEN");
        let ad_account_id = r.required("FB_AD_ACCOUNT_ID");
        let config = Self {
            access_token,
            ad_account_id,
            base_url: r.string("FB_BASE_URL", "https://graph.facebook.com/v22.0"),
            days_back: r.parsed("FB_DAYS_BACK", 3)?,
            utc_offset_hours: r.parsed("FB_UTC_OFFSET_HOURS", 8)?,
            output: r.path("FB_OUTPUT_FILE", "normalized/raw_spend_facebook.csv"),
            pacing: Pacing::from_reader(&r)?,
        };
        r.finish()?;
        if config.days_back == 0 {
            return Err(ConfigError::Invalid {
                key: "FB_DAYS_BACK".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct SplitConfig {
    pub input: PathBuf,
    pub output_base: PathBuf,
    pub max_rows: usize,
}

impl SplitConfig {
    pub fn from_env(env: &Env) -> Result<Self, ConfigError> {
        let r = env.reader();
        Ok(Self {
            input: r.path("SPLIT_INPUT_FILE", "extracted/openalex_enriched.csv"),
            output_base: r.path("SPLIT_OUTPUT_BASE", "output_splits/data_part"),
            max_rows: r.positive("MAX_ROWS_PER_FILE", 5000)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NormalizeConfig {
    pub input_pattern: String,
    pub output_dir: PathBuf,
    pub max_rows: usize,
}

impl NormalizeConfig {
    pub fn from_env(env: &Env) -> Result<Self, ConfigError> {
        let r = env.reader();
        Ok(Self {
            input_pattern: r.string("NORMALIZE_INPUT_PATTERN", "output_splits/data_part_*.csv"),
            output_dir: r.path("NORMALIZED_DIR", "normalized"),
            max_rows: r.positive("MAX_ROWS_PER_FILE", 5000)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub schema: String,
}

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub db: DbConfig,
    pub input_dir: PathBuf,
}

impl LoadConfig {
    pub fn from_env(env: &Env) -> Result<Self, ConfigError> {
        let mut r = env.reader();
        let host = r.required("DB_HOST");
        let user = r.required("DB_USER");
        let password = r.required("DB_PASSWORD");
        let database = r.required("DB_NAME");
        let config = Self {
            db: DbConfig {
                host,
                port: r.parsed("DB_PORT", 5432)?,
                user,
                password,
                database,
                schema: r.string("DB_SCHEMA", "public"),
            },
            input_dir: r.path("NORMALIZED_DIR", "normalized"),
        };
        r.finish()?;
        Ok(config)
    }
}
