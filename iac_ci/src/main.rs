//! iac-ci server and one-shot build checker.
//!
//! `serve` receives GitHub webhooks and check-build events over HTTP.
//! `check-build` runs a single poll pass for an event read from a file or
//! stdin and prints the orchestrator response; it shares the run store and
//! local build state with `serve`. `migrate` creates the run
//! store tables.

use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use clap::{Parser, Subcommand};
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use iac_ci::backends::local::{FsLogStore, LocalFunctionRunner, ShellBuildRunner};
use iac_ci::clock::RunContext;
use iac_ci::config::IacCiConfig;
use iac_ci::routes::{self, AppState};
use iac_ci::services::check_build::BuildChecker;
use iac_ci::services::dispatcher::BuildDispatcher;
use iac_ci::services::github_service::GitHubComments;
use iac_ci::services::log_retriever::LogRetriever;
use iac_ci::services::notify::CommentService;
use iac_ci::services::poller::StatusPoller;
use iac_ci::services::reporter::RunReporter;
use iac_ci::services::slack_service::SlackNotifier;
use iac_ci::services::trigger_build::BuildTrigger;
use iac_ci::store::{InMemoryStore, PgStore, RunStore, SettingsStore};

#[derive(Parser)]
#[command(name = "iac-ci", about = "Webhook-driven IaC build orchestration")]
struct Cli {
    /// Run without PR comments when no GitHub token is configured
    #[arg(long, env = "IAC_CI_NO_COMMENTS", global = true)]
    no_comments: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve webhooks and check-build requests
    Serve {
        /// Server port
        #[arg(short, long, env = "IAC_CI_PORT", default_value = "9090")]
        port: u16,
    },
    /// Run one check-build pass for an event (file path, or stdin)
    CheckBuild {
        #[arg(short, long)]
        event: Option<PathBuf>,
    },
    /// Create the run store tables
    Migrate,
}

struct Stores {
    runs: Arc<dyn RunStore>,
    settings: Arc<dyn SettingsStore>,
}

async fn open_stores(config: &IacCiConfig) -> anyhow::Result<Stores> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url, 8)?;
            store.run_migration().await?;
            let store = Arc::new(store);
            Ok(Stores {
                runs: store.clone(),
                settings: store,
            })
        }
        None => {
            let store = Arc::new(InMemoryStore::new());
            Ok(Stores {
                runs: store.clone(),
                settings: store,
            })
        }
    }
}

fn comment_service(config: &IacCiConfig, no_comments: bool) -> anyhow::Result<Option<Arc<dyn CommentService>>> {
    if no_comments {
        tracing::warn!("PR comments disabled");
        return Ok(None);
    }
    let comments = GitHubComments::new(&config.github_token, &config.github_api_url)?;
    Ok(Some(Arc::new(comments)))
}

fn build_state(
    config: IacCiConfig,
    stores: Stores,
    comments: Option<Arc<dyn CommentService>>,
) -> AppState {
    let logs = FsLogStore::new(&config.log_store_dir);
    let managed = Arc::new(ShellBuildRunner::new(
        &config.workspace_dir,
        logs.clone(),
        &config.log_bucket,
    ));
    let function = Arc::new(LocalFunctionRunner::new(&config.workspace_dir));
    let chat = Arc::new(SlackNotifier::new());

    let reporter = || {
        RunReporter::new(stores.runs.clone(), comments.clone(), chat.clone())
            .with_dashboard_url(config.dashboard_url.clone())
    };

    let dispatcher = BuildDispatcher::new(managed.clone(), function, config.function_name.clone());
    let trigger = BuildTrigger::new(stores.runs.clone(), dispatcher, comments.clone(), reporter());
    let checker = BuildChecker::new(
        stores.runs.clone(),
        stores.settings.clone(),
        StatusPoller::new(managed, config.poll_limits()),
        LogRetriever::new(Arc::new(logs), config.log_window()),
        reporter(),
    )
    .with_lookup(config.lookup_retry())
    .with_log_bucket(config.log_bucket.clone());

    AppState {
        ctx: RunContext::system(),
        runs: stores.runs,
        settings: stores.settings,
        trigger: Arc::new(trigger),
        checker: Arc::new(checker),
        config,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();
    let config = IacCiConfig::from_env();

    match cli.command {
        Command::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required for migrate"))?;
            PgStore::connect(url, 1)?.run_migration().await?;
            Ok(())
        }
        Command::CheckBuild { event } => {
            // Runs recorded by `serve` are only visible through the database.
            if config.database_url.is_none() {
                anyhow::bail!("check-build requires DATABASE_URL");
            }
            let raw = match event {
                Some(path) => tokio::fs::read_to_string(&path).await?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let event: serde_json::Value = serde_json::from_str(&raw)?;

            let comments = comment_service(&config, cli.no_comments)?;
            let stores = open_stores(&config).await?;
            let state = build_state(config, stores, comments);

            let outcome = routes::api::run_check(&state, event).await?;
            println!("{}", routes::api::outcome_json(&outcome)?);
            Ok(())
        }
        Command::Serve { port } => {
            tracing::info!("Starting iac-ci server...");

            let comments = comment_service(&config, cli.no_comments)?;
            let stores = open_stores(&config).await?;
            let state = build_state(config, stores, comments);

            // Poll passes may run for the full invocation ceiling.
            let request_timeout =
                Duration::from_secs(state.config.run_maxtime_secs.max(0) as u64 + 120);
            let app = routes::iac_ci_router(state).layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(TimeoutLayer::with_status_code(
                        StatusCode::REQUEST_TIMEOUT,
                        request_timeout,
                    )),
            );

            // Initialize metrics
            iac_ci::metrics::init_metrics();

            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            tracing::info!("iac-ci listening on {}", addr);

            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            tracing::info!("Shutdown complete");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
