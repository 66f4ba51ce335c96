use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hsearch_adapters::adapter_for_site;
use hsearch_core::Subscriber;
use hsearch_storage::{ListingStore, MemoryStore, PageFetcher};
use hsearch_sync::{load_sites, Engine, LogNotifier, SyncConfig, TracingReporter};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hsearch-cli")]
#[command(about = "Apartment listing search assistant")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the grabber, matcher and garbage cycles until Ctrl-C.
    Run,
    /// Run one grabber tick and print a per-site summary.
    Crawl,
    /// Print the effective site registry.
    Sites,
    /// Probe one listing URL the way the garbage cycle does.
    Probe {
        url: String,
        #[arg(long)]
        proxy: bool,
    },
    /// Add or replace a subscriber in the state file.
    Subscribe {
        chat_id: i64,
        #[arg(long, default_value = "")]
        title: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("reading configuration")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await?,
        Commands::Crawl => crawl(config).await?,
        Commands::Sites => {
            for site in load_sites(&config).await? {
                let status = match adapter_for_site(&site) {
                    Ok(_) => "ok".to_string(),
                    Err(err) => err.to_string(),
                };
                println!(
                    "{} proxy={} url={} adapter={}",
                    site.name, site.use_proxy, site.crawl_url, status
                );
            }
        }
        Commands::Probe { url, proxy } => {
            let fetcher = hsearch_sync::http_fetcher(&config)?;
            println!("{url}: {:?}", fetcher.probe(&url, proxy).await);
        }
        Commands::Subscribe { chat_id, title } => {
            let store = MemoryStore::load(&config.state_file).await?;
            store.insert_subscriber(Subscriber::new(chat_id, title)).await;
            store.save(&config.state_file).await?;
            println!("subscriber {chat_id} saved to {}", config.state_file.display());
        }
    }

    Ok(())
}

async fn open_store(config: &SyncConfig) -> Result<Arc<MemoryStore>> {
    let mut store = MemoryStore::load(&config.state_file).await?;
    if let Some(window) = config.relevance {
        store = store.with_relevance_window(window);
    }
    Ok(Arc::new(store))
}

async fn engine(config: SyncConfig, store: Arc<MemoryStore>) -> Result<Engine> {
    let sites = load_sites(&config).await?;
    let fetcher = Arc::new(hsearch_sync::http_fetcher(&config)?);
    if sites.iter().any(|site| site.use_proxy) && !fetcher.has_proxy() {
        warn!("some sites require a proxy but PROXY_HOST is not set; their requests will fail");
    }
    let store: Arc<dyn ListingStore> = store;
    Engine::new(
        config,
        &sites,
        store,
        fetcher,
        Arc::new(LogNotifier::new()),
        Arc::new(TracingReporter),
    )
}

async fn run(config: SyncConfig) -> Result<()> {
    let state_file = config.state_file.clone();
    let snapshot_every = config.crawl_every;
    let store = open_store(&config).await?;
    let engine = engine(config, Arc::clone(&store)).await?;

    info!(sites = engine.grabber().adapters().len(), "starting cycles");
    let handle = engine.scheduler().start();

    let mut snapshots = tokio::time::interval(snapshot_every);
    snapshots.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("listening for ctrl-c")?;
                break;
            }
            _ = snapshots.tick() => {
                if let Err(err) = store.save(&state_file).await {
                    warn!(error = %err, "state snapshot failed");
                }
            }
        }
    }

    info!("shutting down");
    handle.shutdown().await;
    store.save(&state_file).await?;
    Ok(())
}

async fn crawl(config: SyncConfig) -> Result<()> {
    let state_file = config.state_file.clone();
    let store = open_store(&config).await?;
    let engine = engine(config, Arc::clone(&store)).await?;

    let summary = engine.grabber().tick(&CancellationToken::new()).await;
    for pass in &summary.passes {
        println!(
            "{}: enumerated={} new={} failed={} persisted={}",
            pass.site, pass.enumerated, pass.new_candidates, pass.failed, pass.persisted
        );
    }
    for site in &summary.failed_sites {
        println!("{site}: failed");
    }

    store.save(&state_file).await?;
    println!("crawl complete: persisted={}", summary.persisted());
    Ok(())
}
