//! Plotari application binary - composition root.
//!
//! 1. Load configuration from TOML and apply CLI overrides
//! 2. Open the conversation store (SQLite, or memory with --ephemeral)
//! 3. Build the listing index, hybrid search and POI finder
//! 4. Pick the language model (OpenAI-compatible, or offline templates)
//! 5. Run the chat loop on stdin with a periodic sweep in the background

mod cli;

use std::error::Error;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use plotari_chat::{
    ChatRequest, ConversationOrchestrator, LanguageModel, OpenAiChatModel, UnavailableModel,
};
use plotari_core::config::PlotariConfig;
use plotari_core::types::ConversationKey;
use plotari_search::{
    DynEmbeddingService, HashingEmbedder, HybridSearchFusion, LocalPropertyIndex,
    OverpassProvider, PoiFinder,
};
use plotari_storage::{
    ConversationCache, ConversationStore, Database, MemoryConversationStore,
    SqliteConversationStore,
};

use cli::{CliArgs, Command};

const HISTORY_LIMIT: usize = 20;

/// Expand ~ to home directory in a path string.
fn resolve_data_dir(data_dir: &str) -> PathBuf {
    if data_dir.starts_with("~/") || data_dir.starts_with("~\\") {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(&data_dir[2..])
    } else {
        PathBuf::from(data_dir)
    }
}

fn open_store(
    config: &PlotariConfig,
    ephemeral: bool,
) -> Result<Arc<dyn ConversationStore>, Box<dyn Error>> {
    if ephemeral {
        tracing::info!("Ephemeral mode: conversations are kept in memory only");
        return Ok(Arc::new(MemoryConversationStore::new()));
    }

    let data_dir = resolve_data_dir(&config.general.data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }
    let db_path = data_dir.join("plotari.db");
    let db = Database::new(&db_path)?;
    tracing::info!(path = %db_path.display(), "SQLite database opened");
    Ok(Arc::new(SqliteConversationStore::new(Arc::new(db))))
}

fn pick_model(config: &PlotariConfig) -> Arc<dyn LanguageModel> {
    match OpenAiChatModel::from_env(&config.llm) {
        Some(model) => {
            tracing::info!(model = %config.llm.model, base_url = %config.llm.base_url, "Language model configured");
            Arc::new(model)
        }
        None => {
            tracing::info!(
                key_env = %config.llm.api_key_env,
                "No language model available, using heuristic intents and templated replies"
            );
            Arc::new(UnavailableModel)
        }
    }
}

fn poi_finder(config: &PlotariConfig) -> Option<Arc<PoiFinder>> {
    if !config.geo.enabled {
        tracing::info!("Geospatial lookups disabled in config");
        return None;
    }
    match OverpassProvider::new(&config.geo) {
        Ok(provider) => {
            tracing::info!(endpoint = %config.geo.endpoint, "Geospatial provider ready");
            Some(Arc::new(PoiFinder::new(Arc::new(provider), &config.geo)))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Geospatial provider unavailable, POI lookups disabled");
            None
        }
    }
}

async fn build_orchestrator(
    config: &PlotariConfig,
    ephemeral: bool,
) -> Result<ConversationOrchestrator, Box<dyn Error>> {
    let cache = Arc::new(ConversationCache::new(
        open_store(config, ephemeral)?,
        &config.cache,
    ));

    let embedder: Arc<dyn DynEmbeddingService> =
        Arc::new(HashingEmbedder::new(config.search.embedding_dim));
    let index = match &config.search.properties_path {
        Some(path) => LocalPropertyIndex::load_json(Path::new(path), Arc::clone(&embedder)).await?,
        None => {
            tracing::warn!("search.properties_path not set, the listing index is empty");
            LocalPropertyIndex::new(Arc::clone(&embedder))
        }
    };
    let search = Arc::new(HybridSearchFusion::new(
        Arc::new(index),
        embedder,
        &config.search,
    ));

    Ok(ConversationOrchestrator::new(
        config,
        pick_model(config),
        search,
        poi_finder(config),
        cache,
    ))
}

/// Run `sweep()` every `interval_secs` until aborted.
fn spawn_sweeper(orchestrator: Arc<ConversationOrchestrator>, interval_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(interval_secs, "Conversation sweeper started");
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = orchestrator.sweep().await {
                tracing::warn!(error = %e, "Conversation sweep failed");
            }
        }
    })
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

/// Interactive loop on stdin. Lines starting with `/` are commands.
async fn chat_loop(
    orchestrator: &ConversationOrchestrator,
    user: String,
    session: String,
) -> Result<(), Box<dyn Error>> {
    let key = ConversationKey::new(user.clone(), session.clone());
    println!("Plotari chat - session {} (/history, /clear, /stats, /quit)", key);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt();
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                tracing::info!("Ctrl-C received, shutting down");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            "/quit" | "/exit" => break,
            "/history" => {
                for message in orchestrator.history(&key, HISTORY_LIMIT).await? {
                    println!("[{:?}] {}", message.role, message.text);
                }
            }
            "/clear" => {
                let removed = orchestrator.clear(&key).await?;
                println!("{}", if removed { "Conversation cleared." } else { "Nothing to clear." });
            }
            "/stats" => {
                let stats = orchestrator.stats()?;
                println!(
                    "memory: {}/{} conversations, pending writes: {}",
                    stats.memory_entries, stats.capacity, stats.pending_reconciliation
                );
            }
            message => {
                let request = ChatRequest::new(user.clone(), session.clone(), message);
                match orchestrator.handle_message(request).await {
                    Ok(reply) => {
                        println!("{}", reply.reply);
                        for nearby in &reply.nearby {
                            let names: Vec<&str> =
                                nearby.pois.iter().map(|p| p.name.as_str()).take(5).collect();
                            if !names.is_empty() {
                                println!("  near {}: {}", nearby.property_id, names.join(", "));
                            }
                        }
                        if reply.metadata.degraded || reply.metadata.pending_reconciliation {
                            tracing::debug!(metadata = ?reply.metadata, "Reduced reply");
                        }
                    }
                    Err(e) => println!("{}", e),
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = CliArgs::parse();

    // Config, with CLI overrides.
    let config_file = args.resolve_config_path();
    let loaded = PlotariConfig::load(&config_file);
    let mut config = loaded.as_ref().ok().cloned().unwrap_or_default();
    if let Some(dir) = args.resolve_data_dir() {
        config.general.data_dir = dir;
    }
    if let Some(ref level) = args.log_level {
        config.general.log_level = level.clone();
    }

    // Tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting Plotari v{}", env!("CARGO_PKG_VERSION"));
    match loaded {
        Ok(_) => tracing::info!(path = %config_file.display(), "Configuration loaded"),
        Err(e) => tracing::warn!(path = %config_file.display(), error = %e, "Using default configuration"),
    }

    let orchestrator = Arc::new(build_orchestrator(&config, args.ephemeral).await?);

    match args.command() {
        Command::Sweep => {
            let removed = orchestrator.sweep().await?;
            println!("Removed {} expired conversation(s).", removed);
        }
        Command::Chat { user, session } => {
            let session = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let sweeper = spawn_sweeper(Arc::clone(&orchestrator), config.cache.sweep_interval_secs);
            let result = chat_loop(&orchestrator, user, session).await;
            sweeper.abort();
            result?;
        }
    }

    tracing::info!("Plotari stopped");
    Ok(())
}
