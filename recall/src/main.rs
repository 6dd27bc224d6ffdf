use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use recall_core::storage::SqliteStore;
use recall_core::{
    ContextQuery, DecisionFilter, DecisionStatus, FetchOptions, Generation, HashingEmbedder, InvalidationEvent,
    InvalidationTarget, Recall, RecallConfig,
};

#[derive(Parser)]
#[command(name = "recall")]
#[command(about = "Decision-aware semantic cache: admin and maintenance", long_about = None)]
struct Cli {
    /// SQLite database file (defaults to the user data directory)
    #[arg(short, long, env = "RECALL_DB")]
    db: Option<PathBuf>,

    /// JSON config file; RECALL_* environment variables are used otherwise
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a generated response
    Store {
        /// Query text the response answers
        query: String,

        /// Response text
        response: String,

        #[arg(short, long, default_value = "default")]
        namespace: String,

        /// Entity or file the response depends on (repeatable)
        #[arg(short, long = "entity")]
        entities: Vec<String>,

        /// TTL in seconds (defaults to the configured TTL)
        #[arg(long)]
        ttl: Option<u64>,

        #[arg(short, long)]
        session: Option<String>,
    },

    /// Fetch merged context for a query
    Fetch {
        query: String,

        #[arg(short, long, default_value = "default")]
        namespace: String,

        /// Query entities, used for decision filtering and overlap scoring
        #[arg(short, long = "entity")]
        entities: Vec<String>,

        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Use the cold-path deadline
        #[arg(long)]
        cold: bool,

        #[arg(short, long)]
        session: Option<String>,
    },

    /// Record a decision; contradicted open decisions are superseded
    Decide {
        /// Decision head, e.g. "Use SQLite for storage"
        head: String,

        #[arg(short, long = "entity")]
        entities: Vec<String>,

        #[arg(short, long = "file")]
        files: Vec<String>,
    },

    /// List decisions
    Decisions {
        #[arg(short, long)]
        entity: Option<String>,

        #[arg(short, long)]
        file: Option<String>,

        /// open, closed or superseded
        #[arg(short, long)]
        status: Option<String>,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Follow a decision's supersedence chain to its current head
    Resolve {
        decision_id: String,
    },

    /// Close an open decision
    Close {
        decision_id: String,
    },

    /// Invalidate cache entries
    Invalidate {
        #[arg(long, conflicts_with = "entity", required_unless_present = "entity")]
        namespace: Option<String>,

        #[arg(long)]
        entity: Option<String>,
    },

    /// Run one maintenance cycle
    Cleanup {
        /// Release a single session instead
        #[arg(long)]
        session: Option<String>,
    },

    /// Show cache statistics
    Stats,

    /// Run the maintenance loop until Ctrl-C
    Maintain,

    /// Check the database
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "recall=info,recall_core=info".into())
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let db_path = resolve_db_path(&cli)?;
    debug!(path = %db_path.display(), "Opening recall store");
    let store = std::sync::Arc::new(
        SqliteStore::open(&db_path)
            .await
            .with_context(|| format!("opening {}", db_path.display()))?,
    );

    let recall = Recall::with_store(store.clone(), std::sync::Arc::new(HashingEmbedder::default()), config).await?;

    match cli.command {
        Commands::Store { ref query, ref response, ref namespace, ref entities, ttl, ref session } => {
            let mut generation = Generation::new(query.as_str(), recall.embed(query), response.as_str())
                .with_namespace(namespace.as_str())
                .with_entities(entities.iter().cloned());
            if let Some(secs) = ttl {
                generation = generation.with_ttl(std::time::Duration::from_secs(secs));
            }
            if let Some(session) = session {
                generation = generation.with_session(session.as_str());
            }
            let id = recall.store_generation(generation).await?;
            println!("{}", id);
        }

        Commands::Fetch { ref query, ref namespace, ref entities, limit, cold, ref session } => {
            let mut context_query = ContextQuery::new(query.as_str(), recall.embed(query))
                .with_namespace(namespace.as_str())
                .with_entities(entities.iter().cloned());
            if let Some(session) = session {
                context_query = context_query.with_session(session.as_str());
            }
            let mut options = FetchOptions::new().with_limit(limit);
            if cold {
                options = options.cold();
            }

            let response = recall.fetch_context(context_query, &options).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                println!("{:?} | cache hit: {} | {}ms", response.status, response.cache_hit, response.latency_ms);
                println!("{}", "=".repeat(70));
                for (i, candidate) in response.candidates.iter().enumerate() {
                    println!("[{}] {} {} (score: {:.3})", i + 1, candidate.source, candidate.origin_id, candidate.adjusted_score);
                    println!("    {}", preview(&candidate.payload, 200));
                }
                for failure in &response.failures {
                    println!("! {} failed ({:?}): {}", failure.source, failure.kind, failure.message);
                }
            }
        }

        Commands::Decide { ref head, ref entities, ref files } => {
            let outcome = recall.submit_decision(head, entities.iter().cloned(), files.iter().cloned()).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!("Recorded decision {}", outcome.decision_id);
                if let Some(previous) = &outcome.superseded_previous {
                    println!("  supersedes {}", previous);
                }
            }
        }

        Commands::Decisions { ref entity, ref file, ref status, limit } => {
            let mut filter = DecisionFilter::new().limit(limit);
            if let Some(entity) = entity {
                filter = filter.entity(entity.as_str());
            }
            if let Some(file) = file {
                filter = filter.file(file.as_str());
            }
            if let Some(status) = status {
                let status: DecisionStatus = status.parse().map_err(anyhow::Error::msg)?;
                filter = filter.status(status);
            }

            let records = recall.retrieve_decisions(&filter).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No decisions found.");
            } else {
                for record in records {
                    let marker = match record.status {
                        DecisionStatus::Open => "●",
                        DecisionStatus::Closed => "◌",
                        DecisionStatus::Superseded => "✗",
                    };
                    println!("{} {}  {}  {}", marker, record.id, record.created_at.format("%Y-%m-%d %H:%M"), record.decision_head);
                    if let Some(successor) = &record.superseded_by {
                        println!("    superseded by {}", successor);
                    }
                }
            }
        }

        Commands::Resolve { ref decision_id } => {
            let (head, hops) = recall.resolve_decision(decision_id).await?;
            println!("{} ({} hops)", head.id, hops);
            println!("  {}", head.decision_head);
        }

        Commands::Close { ref decision_id } => {
            let record = recall.close_decision(decision_id).await?;
            println!("Closed {}", record.id);
        }

        Commands::Invalidate { ref namespace, ref entity } => {
            let target = match (namespace, entity) {
                (Some(namespace), _) => InvalidationTarget::Namespace(namespace.clone()),
                (None, Some(entity)) => InvalidationTarget::Entity(entity.clone()),
                (None, None) => anyhow::bail!("pass --namespace or --entity"),
            };
            let event = recall.invalidate(target).await?;
            print_event(&event, cli.json)?;
        }

        Commands::Cleanup { ref session } => {
            if let Some(session) = session {
                let event = recall.cleanup_session(session).await?;
                print_event(&event, cli.json)?;
            } else {
                let report = recall.run_cleanup().await;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    println!("{}", report);
                    for error in &report.errors {
                        println!("  ! {}", error);
                    }
                }
            }
        }

        Commands::Stats => {
            let stats = recall.cache_stats().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Cache Statistics:");
                println!("  Entries:     {} fresh, {} stale, {} invalid", stats.entries.fresh, stats.entries.stale, stats.entries.invalid);
                println!("  Indexed:     {}", stats.indexed);
                println!("  Hits:        {} ({} exact, {} semantic)", stats.hits(), stats.exact_hits, stats.semantic_hits);
                println!("  Misses:      {} ({} degraded)", stats.misses, stats.degraded_misses);
                println!("  Hit rate:    {:.1}%", stats.hit_rate() * 100.0);
            }
        }

        Commands::Maintain => {
            let handle = recall.spawn_maintenance();
            println!("Maintenance running every {}s, Ctrl-C to stop", recall.config().cleanup_interval_secs);
            tokio::signal::ctrl_c().await?;
            handle.shutdown().await;
            println!("Maintenance stopped");
        }

        Commands::Health => {
            let result = store.health_check(recall.config().warm_path_timeout()).await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{} ({}ms) {}", result.status, result.response_time_ms, db_path.display());
                if let Some(error) = &result.error {
                    println!("  error: {}", error);
                }
            }
        }
    }

    store.close().await;
    Ok(())
}

fn load_config(cli: &Cli) -> Result<RecallConfig> {
    let config = match &cli.config {
        Some(path) => RecallConfig::from_json_file(path)?,
        None => RecallConfig::from_env()?,
    };
    Ok(config)
}

fn resolve_db_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = &cli.db {
        return Ok(path.clone());
    }
    let dir = dirs::data_dir()
        .context("no user data directory; pass --db")?
        .join("recall");
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    Ok(dir.join("recall.db"))
}

fn print_event(event: &InvalidationEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(event)?);
    } else {
        println!("Invalidated {} entries ({})", event.ids.len(), event.reason);
        if !event.failed_ids.is_empty() {
            println!("  {} entries could not be invalidated", event.failed_ids.len());
        }
    }
    Ok(())
}

fn preview(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push_str("...");
    }
    out.replace('\n', " ")
}
