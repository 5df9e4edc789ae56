//! OpenRecall CLI
//!
//! Operator interface: migrations, health, and manual save/search/purge.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use console::style;
use openrecall::config::{Config, LogConfig};
use openrecall::core::Metadata;
use openrecall::database::{init_pool_for_migrations, migrations};
use openrecall::memory::{ContextOutcome, RetrieveOptions, SaveOutcome, SearchOptions};
use openrecall::{MemoryService, SearchQuery, VERSION};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "openrecall",
    author = "OpenRecall Contributors",
    version = VERSION,
    about = "OpenRecall - conversational memory engine",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,

    /// Check backend reachability and breaker states
    Status,

    /// Embed and save one exchange
    Save {
        /// What the user said
        #[arg(short, long, default_value = "")]
        user: String,
        /// What the assistant answered
        #[arg(short, long, default_value = "")]
        assistant: String,
        /// Session the exchange belongs to
        #[arg(short, long)]
        session: Option<String>,
        /// Metadata as a JSON object
        #[arg(short, long)]
        metadata: Option<String>,
    },

    /// Search the whole corpus (or one session) by text
    Search {
        /// Query text
        query: String,
        /// Maximum results
        #[arg(short, long)]
        limit: Option<usize>,
        /// Restrict to one session
        #[arg(short, long)]
        session: Option<String>,
        /// Minimum similarity
        #[arg(short, long)]
        floor: Option<f32>,
    },

    /// Run the retrieval pipeline and print the context
    Context {
        /// Query text
        query: String,
        /// Output budget in tokens
        #[arg(short, long)]
        max_tokens: Option<usize>,
    },

    /// Delete turns older than a duration (e.g. "30d"), or the retention age
    Purge {
        #[arg(long)]
        older_than: Option<String>,
    },

    /// Delete one turn
    Delete {
        /// Turn id
        id: Uuid,
    },
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if log.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.pretty().init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load().context("failed to load configuration")?;
    init_tracing(&config.log);

    match cli.command {
        Commands::Migrate => run_migrations(&config).await,
        Commands::Status => check_status(config).await,
        Commands::Save {
            user,
            assistant,
            session,
            metadata,
        } => save(config, session, &user, &assistant, metadata.as_deref()).await,
        Commands::Search {
            query,
            limit,
            session,
            floor,
        } => search(config, &query, SearchOptions {
            limit,
            session_id: session,
            similarity_floor: floor,
        })
        .await,
        Commands::Context { query, max_tokens } => context(config, &query, max_tokens).await,
        Commands::Purge { older_than } => purge(config, older_than.as_deref()).await,
        Commands::Delete { id } => delete(config, id).await,
    }
}

/// Run database migrations
async fn run_migrations(config: &Config) -> anyhow::Result<()> {
    println!("Running database migrations...\n");

    config.require_database()?;
    // Skip the pgvector check; migrations create the extension
    let pool = init_pool_for_migrations(&config.database).await?;
    migrations::run(&pool, config.embedding.dimensions, config.retrieval.lists).await?;

    println!("{} Migrations complete", style("✔").green());
    Ok(())
}

async fn connect(config: Config) -> anyhow::Result<MemoryService> {
    MemoryService::connect(config)
        .await
        .context("failed to connect memory service")
}

/// Check backend reachability and breaker states
async fn check_status(config: Config) -> anyhow::Result<()> {
    println!("{}\n", style("OpenRecall Status").bold());
    println!("  Embedding: {} ({} dims)", config.embedding.model, config.embedding.dimensions);
    println!(
        "  Compression: {}",
        if config.compression.enabled {
            config.compression.model.as_str()
        } else {
            "disabled"
        }
    );
    println!("  Index mode: {:?}", config.retrieval.index_mode);

    let service = connect(config).await?;
    let status = service.status().await;

    match status.error {
        None => println!("  Store ({}): {}", status.backend, style("reachable").green()),
        Some(e) => println!("  Store ({}): {} {}", status.backend, style("unreachable").red(), e),
    }
    for (name, state) in &status.breakers {
        println!("  Breaker {}: {:?}", name, state);
    }

    service.shutdown().await;
    Ok(())
}

async fn save(
    config: Config,
    session: Option<String>,
    user: &str,
    assistant: &str,
    metadata: Option<&str>,
) -> anyhow::Result<()> {
    let metadata = match metadata {
        Some(raw) => {
            let value: serde_json::Value =
                serde_json::from_str(raw).context("--metadata must be valid JSON")?;
            Metadata::try_from(value)?
        }
        None => Metadata::new(),
    };

    let service = connect(config).await?;
    let outcome = service.save_text(session, user, assistant, metadata).await;
    service.shutdown().await;

    match outcome? {
        SaveOutcome::Inserted(id) => println!("{} Saved {}", style("✔").green(), id),
        SaveOutcome::Deduplicated(id) => {
            println!("{} Duplicate of {}, not stored", style("•").yellow(), id)
        }
    }
    Ok(())
}

async fn search(config: Config, query: &str, options: SearchOptions) -> anyhow::Result<()> {
    let service = connect(config).await?;
    let hits = service.search(SearchQuery::Text(query), &options).await;
    service.shutdown().await;

    let hits = hits?;
    if hits.is_empty() {
        println!("No matches");
        return Ok(());
    }
    for hit in hits {
        println!(
            "{} {} {}",
            style(format!("{:.3}", hit.score)).cyan(),
            style(hit.turn.id).dim(),
            hit.turn.session_id.as_deref().unwrap_or("-")
        );
        println!("  {}\n", hit.turn.chunk_text().replace('\n', "\n  "));
    }
    Ok(())
}

async fn context(config: Config, query: &str, max_tokens: Option<usize>) -> anyhow::Result<()> {
    let service = connect(config).await?;
    let options = RetrieveOptions {
        max_tokens,
        ..RetrieveOptions::default()
    };
    let result = service.retrieve(query, &options).await;
    service.shutdown().await;

    let context = result?;
    let label = match context.outcome {
        ContextOutcome::Compressed => style("compressed").green(),
        ContextOutcome::Fallback => style("fallback").yellow(),
        ContextOutcome::NoMatches => style("no matches").dim(),
    };
    eprintln!("{} from {} hits", label, context.hits);
    println!("{}", context.text);
    Ok(())
}

async fn purge(config: Config, older_than: Option<&str>) -> anyhow::Result<()> {
    let service = connect(config).await?;
    let removed = match older_than {
        Some(raw) => {
            let age = humantime::parse_duration(raw)
                .with_context(|| format!("invalid duration: {}", raw))?;
            let cutoff = chrono::Utc::now() - chrono::Duration::from_std(age)?;
            service.purge(cutoff).await
        }
        None => service.purge_expired().await,
    };
    service.shutdown().await;

    println!("{} Removed {} turns", style("✔").green(), removed?);
    Ok(())
}

async fn delete(config: Config, id: Uuid) -> anyhow::Result<()> {
    let service = connect(config).await?;
    let existed = service.delete(id).await;
    service.shutdown().await;

    if !existed? {
        bail!("turn {} not found", id);
    }
    println!("{} Deleted {}", style("✔").green(), id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_help_needs_no_configuration() {
        let err = Cli::try_parse_from(["openrecall", "--help"]).err().unwrap();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_parses_search_options() {
        let cli = Cli::try_parse_from(["openrecall", "search", "deploy", "-l", "5", "-f", "0.8"]).unwrap();
        match cli.command {
            Commands::Search { query, limit, floor, .. } => {
                assert_eq!(query, "deploy");
                assert_eq!(limit, Some(5));
                assert_eq!(floor, Some(0.8));
            }
            _ => panic!("expected search"),
        }
    }
}
