mod analyzer;
mod llm;
mod models;
mod notify;
mod prompts;
mod routes;
mod scanner;
mod settings;
mod stats;
mod store;
mod timefmt;

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use axum::{
    http::{HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use clap::Parser;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::analyzer::TextAnalyzer;
use crate::llm::{OpenAiCompatibleClient, TextAnalysisCapability, DEFAULT_LLM_BASE_URL, DEFAULT_LLM_MODEL};
use crate::notify::{FcmClient, NotificationDispatcher};
use crate::routes::{AppState, CRON_SECRET_HEADER};
use crate::settings::PolicySettings;
use crate::store::SqliteStore;

const DEFAULT_PORT: u16 = 17700;

#[derive(Parser, Debug)]
#[command(name = "insight_core", version)]
struct Args {
    /// Listen address.
    ///
    /// Accepts:
    /// - ip:port (recommended), e.g. 127.0.0.1:17700
    /// - ip (implies port 17700), e.g. 127.0.0.1
    #[arg(long, default_value = "127.0.0.1:17700")]
    listen: String,

    /// SQLite database path.
    #[arg(long, default_value = "./data/insight-core.db")]
    db: PathBuf,

    /// Shared secret the scheduler presents on /notifications/*.
    /// Without it those routes always answer 403.
    #[arg(long, env = "CRON_SECRET", hide_env_values = true)]
    cron_secret: Option<String>,

    /// Base URL of an OpenAI-compatible chat-completions API.
    #[arg(long, env = "LLM_BASE_URL", default_value = DEFAULT_LLM_BASE_URL)]
    llm_base_url: String,

    /// API key for the model. When absent every analysis returns its default.
    #[arg(long, env = "LLM_API_KEY", hide_env_values = true)]
    llm_api_key: Option<String>,

    #[arg(long, env = "LLM_MODEL", default_value = DEFAULT_LLM_MODEL)]
    llm_model: String,

    /// Firebase project that owns the push registrations.
    #[arg(long, env = "FCM_PROJECT_ID")]
    fcm_project_id: Option<String>,

    /// OAuth access token for the FCM HTTP v1 API.
    #[arg(long, env = "FCM_ACCESS_TOKEN", hide_env_values = true)]
    fcm_access_token: Option<String>,

    /// Days without an entry before a reminder is sent (first run only; then persisted).
    #[arg(long, default_value_t = 3.0)]
    inactivity_threshold_days: f64,

    /// Default stats window length in days (first run only; then persisted).
    #[arg(long, default_value_t = 7)]
    stats_window_days: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "insight_core=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let default_settings = PolicySettings {
        inactivity_threshold_days: args.inactivity_threshold_days,
        stats_window_days: args.stats_window_days,
        ..PolicySettings::default()
    };

    if let Some(parent) = args.db.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let store = Arc::new(SqliteStore::open(&args.db)?);
    let settings = store.load_or_init_settings(default_settings).await?;

    let llm = OpenAiCompatibleClient::new(&args.llm_base_url, &args.llm_model, args.llm_api_key)?;
    if !llm.is_configured() {
        warn!("LLM_API_KEY not set; entries will get default analysis");
    }
    let fcm = FcmClient::new(args.fcm_project_id, args.fcm_access_token)?;
    if !fcm.is_configured() {
        warn!("FCM project or access token not set; reminders will fail as not-configured");
    }
    if args.cron_secret.is_none() {
        warn!("CRON_SECRET not set; /notifications routes will reject every call");
    }

    let analyzer = TextAnalyzer::new(Arc::new(llm));
    let dispatcher = NotificationDispatcher::new(Arc::new(fcm), store.clone());
    let state = AppState::new(store, analyzer, dispatcher, settings, args.cron_secret);

    let app = build_router(state);

    let addr = parse_listen(&args.listen)?;
    info!("Core listening on http://{addr}");
    info!("DB: {}", args.db.display());
    info!(
        threshold_days = settings.inactivity_threshold_days,
        window_days = settings.stats_window_days,
        trend_mode = settings.trend_mode.as_str(),
        "policy loaded"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            HeaderName::from_static(CRON_SECRET_HEADER),
        ]);

    Router::new()
        .route("/health", get(routes::health))
        .route("/users", post(routes::post_users).options(routes::options_ok))
        .route(
            "/entries",
            get(routes::get_entry)
                .post(routes::post_entries)
                .options(routes::options_ok),
        )
        .route(
            "/entries/reanalyze",
            post(routes::post_entries_reanalyze).options(routes::options_ok),
        )
        .route("/stats/weekly", get(routes::get_stats_weekly))
        .route("/stats/summary", get(routes::get_stats_summary))
        .route("/insights", post(routes::post_insights).options(routes::options_ok))
        .route("/keywords", post(routes::post_keywords).options(routes::options_ok))
        .route("/notifications/scan", post(routes::post_notifications_scan))
        .route("/notifications/send", post(routes::post_notifications_send))
        .route(
            "/settings",
            get(routes::get_settings)
                .post(routes::post_settings)
                .options(routes::options_ok),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

fn parse_listen(input: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    if let Some((host, port_str)) = input.rsplit_once(':') {
        if host == "localhost" || host.parse::<IpAddr>().is_ok() {
            let port: u16 = port_str.parse().map_err(|_| {
                anyhow::anyhow!(
                    "invalid --listen '{}': bad port. Example: 127.0.0.1:{}",
                    input,
                    DEFAULT_PORT
                )
            })?;
            let ip = host.parse::<IpAddr>().unwrap_or(IpAddr::from([127, 0, 0, 1]));
            return Ok(SocketAddr::new(ip, port));
        }
    }

    if input == "localhost" {
        return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), DEFAULT_PORT));
    }

    Err(anyhow::anyhow!(
        "invalid --listen '{}'. Use ip:port (e.g. 127.0.0.1:{}) or ip (e.g. 127.0.0.1).",
        input,
        DEFAULT_PORT
    ))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}
