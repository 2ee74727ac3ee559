//! Research publication and ad-spend ETL.
//!
//! Each stage is a separate command that reads files and writes files:
//! extractors pull SCOPUS, OpenAlex and Facebook data into flat CSV, the splitter
//! and normalizer reshape it into keyed tables, and the loader upserts those
//! tables into PostgreSQL.

pub mod config;
pub mod error;
pub mod extract;
pub mod load;
pub mod normalize;
pub mod run;
pub mod schema;
pub mod split;
pub mod tabular;

use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_tracing(verbose: bool) {
    let default = if verbose {
        "research_etl=debug"
    } else {
        "research_etl=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
