// Command-line entry point for scrape sessions, predictions and history upkeep

mod config;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gemini_client::GeminiClient;
use harvest::{
    normalize_site, CredentialPool, Enrichment, ExtractionPipeline, GeminiBackend,
    GenerationClient, GenerationConfig, HistoryStore, JsonFileStore, LockConfig, LockManager,
    OperationKind, PredictionConfig, PredictionPipeline, RunControl, ScrapeSession,
    StaticPageSource, StopSignal, SystemClock,
};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "harvest", about = "Extract, track and predict funding calls")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage the API credential pool
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },
    /// Run a scrape session over cached pages
    Extract {
        #[arg(long)]
        site: String,
        /// JSON array of fetched pages
        #[arg(long)]
        pages: PathBuf,
        /// JSON object of per-URL enrichment (snapshots, previous versions)
        #[arg(long)]
        enrichment: Option<PathBuf>,
    },
    /// Predict the next opening of closed calls
    Predict {
        #[arg(long)]
        site: String,
    },
    /// Ask a running session to stop
    Stop {
        #[arg(long)]
        site: String,
    },
    /// Inspect and repair a site's history
    History {
        #[command(subcommand)]
        action: HistoryAction,
        #[arg(long, global = true)]
        site: Option<String>,
    },
}

#[derive(Subcommand)]
enum KeysAction {
    List,
    Add { token: String },
    Remove { token: String },
}

#[derive(Subcommand)]
enum HistoryAction {
    /// Entries missing a name, status or dates
    Incomplete,
    /// Mark entries with suspended URLs as suspended
    FixSuspended,
    /// Remove one entry
    Delete { url: String },
    /// Remove every entry
    Clear,
    /// Fix suspended entries and re-extract incomplete ones from cached pages
    Repair {
        /// JSON array of fetched detail pages
        #[arg(long)]
        pages: PathBuf,
        #[arg(long)]
        enrichment: Option<PathBuf>,
    },
}

/// Stores, locks and clock shared by all commands.
struct App {
    config: Config,
    store: Arc<JsonFileStore>,
    clock: Arc<SystemClock>,
    locks: Arc<LockManager>,
    history: Arc<HistoryStore>,
}

impl App {
    fn new(config: Config) -> Self {
        let clock = Arc::new(SystemClock);
        let store = Arc::new(JsonFileStore::new(&config.data_dir).with_clock(clock.clone()));
        let locks = Arc::new(LockManager::new(
            config.data_dir.join("locks"),
            LockConfig::default(),
            clock.clone(),
        ));
        let history = Arc::new(HistoryStore::new(store.clone(), clock.clone()));

        Self {
            config,
            store,
            clock,
            locks,
            history,
        }
    }

    async fn pool(&self) -> Result<Arc<CredentialPool>> {
        let pool = CredentialPool::open(self.store.clone(), self.clock.clone())
            .await
            .context("Failed to load credential pool")?;
        for token in &self.config.api_keys {
            pool.add(token.as_str()).await?;
        }
        Ok(Arc::new(pool))
    }

    async fn session(&self) -> Result<ScrapeSession> {
        let pipeline = ExtractionPipeline::new(self.client().await?, self.config.extraction(), self.clock.clone())
            .with_sink(Arc::new(|event: &harvest::PipelineEvent| {
                tracing::info!(event = ?event, "Pipeline event");
            }));
        Ok(ScrapeSession::new(pipeline, self.history.clone(), self.locks.clone()))
    }

    async fn client(&self) -> Result<GenerationClient> {
        let mut gemini = GeminiClient::new();
        if let Some(base_url) = &self.config.base_url {
            gemini = gemini.with_base_url(base_url);
        }
        let backend = GeminiBackend::new()
            .with_client(gemini)
            .with_model(&self.config.model);

        Ok(GenerationClient::new(
            Arc::new(backend),
            self.pool().await?,
            GenerationConfig::default(),
        ))
    }

    /// Run control that also observes `harvest stop` and Ctrl-C.
    fn control(&self, site: &str) -> RunControl {
        let control = RunControl::new(normalize_site(site)).with_signal(self.store.clone());
        let token = control.token().clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, stopping after the current batch");
                token.cancel();
            }
        });
        control
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,harvest=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::debug!(data_dir = %config.data_dir.display(), model = %config.model, "Configuration loaded");
    let app = App::new(config);

    match cli.command {
        Command::Keys { action } => keys(&app, action).await,
        Command::Extract {
            site,
            pages,
            enrichment,
        } => extract(&app, &site, &pages, enrichment.as_deref()).await,
        Command::Predict { site } => predict(&app, &site).await,
        Command::Stop { site } => {
            let site = normalize_site(&site);
            app.store.request_stop(&site).await?;
            print_json(&serde_json::json!({
                "site": site,
                "stop_requested": true,
                "in_progress": app.store.is_in_progress(&site).await?,
            }))
        }
        Command::History { action, site } => {
            let site = site.context("--site is required for history commands")?;
            history(&app, action, &site).await
        }
    }
}

async fn keys(app: &App, action: KeysAction) -> Result<()> {
    let pool = app.pool().await?;
    match action {
        KeysAction::List => {}
        KeysAction::Add { token } => {
            if !pool.add(token).await? {
                tracing::info!("Credential already in the pool");
            }
        }
        KeysAction::Remove { token } => {
            if !pool.remove(&token).await? {
                anyhow::bail!("Credential not found in the pool");
            }
        }
    }
    print_json(&pool.status().await)
}

async fn load_pages(pages: &Path) -> Result<StaticPageSource> {
    StaticPageSource::load(pages)
        .await
        .with_context(|| format!("Failed to load pages from {}", pages.display()))
}

async fn load_enrichment(enrichment: Option<&Path>) -> Result<HashMap<String, Enrichment>> {
    match enrichment {
        Some(path) => {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_slice(&bytes).context("Invalid enrichment file")
        }
        None => Ok(HashMap::new()),
    }
}

async fn extract(app: &App, site: &str, pages: &Path, enrichment: Option<&Path>) -> Result<()> {
    let source = load_pages(pages).await?;
    let enrichment = load_enrichment(enrichment).await?;
    let session = app.session().await?;

    let outcome = session
        .fetch_and_run(site, &source, &source.urls(), &enrichment, &app.control(site))
        .await?;
    print_json(&outcome)
}

async fn predict(app: &App, site: &str) -> Result<()> {
    let pipeline = PredictionPipeline::new(
        app.client().await?,
        app.history.clone(),
        app.store.clone(),
        app.locks.clone(),
        PredictionConfig::default(),
        app.clock.clone(),
    );
    let predictions = pipeline.run(site, &app.control(site)).await?;
    print_json(&predictions)
}

async fn history(app: &App, action: HistoryAction, site: &str) -> Result<()> {
    let site = normalize_site(site);
    let action = match action {
        HistoryAction::Repair { pages, enrichment } => {
            return repair(app, &site, &pages, enrichment.as_deref()).await;
        }
        other => other,
    };

    let guard = app
        .locks
        .acquire(&site, OperationKind::Repair, None)
        .await?;

    let result = match action {
        HistoryAction::Incomplete => app
            .history
            .find_incomplete(&site)
            .await
            .map(|entries| serde_json::json!({ "incomplete": entries })),
        HistoryAction::FixSuspended => app
            .history
            .fix_suspended_by_url(&site)
            .await
            .map(|fixed| serde_json::json!({ "fixed": fixed })),
        HistoryAction::Delete { url } => app
            .history
            .delete_entry(&site, &url)
            .await
            .map(|deleted| serde_json::json!({ "url": url, "deleted": deleted })),
        HistoryAction::Clear => app
            .history
            .clear(&site)
            .await
            .map(|removed| serde_json::json!({ "removed": removed })),
        HistoryAction::Repair { .. } => Ok(serde_json::Value::Null),
    };
    guard.release()?;

    print_json(&result?)
}

/// Repairs take the history lock inside the session.
async fn repair(app: &App, site: &str, pages: &Path, enrichment: Option<&Path>) -> Result<()> {
    let source = load_pages(pages).await?;
    let enrichment = load_enrichment(enrichment).await?;
    let session = app.session().await?;

    let outcome = session
        .repair(site, &source, &enrichment, &app.control(site))
        .await?;
    print_json(&outcome)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
