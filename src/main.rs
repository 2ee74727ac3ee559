use anyhow::Result;
use clap::{Parser, Subcommand};
use research_etl::config::{
    Env, FacebookConfig, LoadConfig, NormalizeConfig, OpenAlexConfig, ScopusAbstractsConfig,
    ScopusSearchConfig, SplitConfig,
};
use research_etl::extract::{facebook, openalex, scopus};
use research_etl::run::RunReport;
use research_etl::{init_tracing, load, normalize, split};

#[derive(Parser)]
#[command(name = "research-etl")]
#[command(about = "Extract SCOPUS, OpenAlex and Facebook data, normalize it, load it into PostgreSQL")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Paths and parameters come from the environment (and `.env`).
#[derive(Subcommand)]
enum Commands {
    /// Harvest SCOPUS search results for the configured affiliation and years
    ScopusSearch,
    /// Look up SCOPUS abstracts for each DOI in the input file
    ScopusAbstracts,
    /// Enrich each DOI in the input file from OpenAlex
    Openalex,
    /// Fetch recent daily campaign spend from the Facebook Marketing API
    Facebook,
    /// Split a large CSV into numbered parts
    Split,
    /// Decompose enriched rows into relational tables
    Normalize,
    /// Upsert normalized tables into PostgreSQL
    Load,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let env = Env::load();
    let report: RunReport = match cli.command {
        Commands::ScopusSearch => scopus::run_search(ScopusSearchConfig::from_env(&env)?)?,
        Commands::ScopusAbstracts => {
            scopus::run_abstracts(ScopusAbstractsConfig::from_env(&env)?)?
        }
        Commands::Openalex => openalex::run(OpenAlexConfig::from_env(&env)?)?,
        Commands::Facebook => facebook::run(FacebookConfig::from_env(&env)?)?,
        Commands::Split => split::run(SplitConfig::from_env(&env)?)?,
        Commands::Normalize => normalize::run(NormalizeConfig::from_env(&env)?)?,
        Commands::Load => load::run(LoadConfig::from_env(&env)?)?,
    };

    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}
