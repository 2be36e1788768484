use std::time::Duration;

use chrono::{DateTime, NaiveTime, SecondsFormat, Utc};
use clap::Parser;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{error, info, warn};

const CRON_SECRET_HEADER: &str = "x-cron-secret";

#[derive(Parser, Debug)]
#[command(name = "scan_trigger", version)]
struct Args {
    /// Core base URL, e.g. http://127.0.0.1:17700
    #[arg(long, default_value = "http://127.0.0.1:17700")]
    core_url: String,

    /// Shared secret expected by the core on /notifications/*.
    #[arg(long, env = "CRON_SECRET", hide_env_values = true)]
    cron_secret: String,

    /// Seconds between scans when --daily-at is not given.
    #[arg(long, default_value_t = 24 * 60 * 60)]
    interval_seconds: u64,

    /// Run once per day at this UTC time (HH:MM) instead of a fixed interval.
    #[arg(long, value_parser = parse_hhmm)]
    daily_at: Option<NaiveTime>,

    /// Trigger a single scan and exit. Non-zero exit on failure.
    #[arg(long, default_value_t = false)]
    once: bool,

    /// HTTP timeout for one scan call (seconds).
    #[arg(long, default_value_t = 300)]
    timeout_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct ScanSummary {
    scanned_users: usize,
    #[serde(default)]
    reachable_users: usize,
    candidates: Vec<serde_json::Value>,
    dispatched: usize,
    succeeded: usize,
    #[serde(default)]
    invalid_tokens: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scan_trigger=info".into()),
        )
        .init();

    let args = Args::parse();
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.timeout_seconds))
        .build()?;
    let endpoint = format!("{}/notifications/scan", args.core_url.trim_end_matches('/'));

    if args.once {
        let summary = trigger_scan(&client, &endpoint, &args.cron_secret).await?;
        log_summary(&summary);
        return Ok(());
    }

    loop {
        let wait = match args.daily_at {
            Some(at) => delay_until_next(Utc::now(), at),
            None => Duration::from_secs(args.interval_seconds.max(1)),
        };
        let next = Utc::now() + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero());
        info!("next scan at {}", next.to_rfc3339_opts(SecondsFormat::Secs, true));
        tokio::time::sleep(wait).await;

        match trigger_scan(&client, &endpoint, &args.cron_secret).await {
            Ok(summary) => log_summary(&summary),
            Err(e) => error!("scan failed: {e}"),
        }
    }
}

async fn trigger_scan(client: &reqwest::Client, url: &str, secret: &str) -> anyhow::Result<ScanSummary> {
    post_ok(client, url, secret).await
}

async fn post_ok<T: DeserializeOwned>(client: &reqwest::Client, url: &str, secret: &str) -> anyhow::Result<T> {
    #[derive(Deserialize)]
    struct OkResponse<T> {
        ok: bool,
        data: Option<T>,
        #[serde(default)]
        error: Option<String>,
    }

    let res = client.post(url).header(CRON_SECRET_HEADER, secret).send().await?;
    let status = res.status();
    let body: Option<OkResponse<T>> = res.json().await.ok();
    if !status.is_success() {
        let reason = body.and_then(|b| b.error).unwrap_or_default();
        anyhow::bail!("http_{} {}", status.as_u16(), reason);
    }
    let Some(body) = body else {
        anyhow::bail!("invalid_json");
    };
    if !body.ok {
        anyhow::bail!("not_ok: {}", body.error.unwrap_or_default());
    }
    body.data.ok_or_else(|| anyhow::anyhow!("missing_data"))
}

fn log_summary(s: &ScanSummary) {
    info!(
        scanned_users = s.scanned_users,
        reachable_users = s.reachable_users,
        candidates = s.candidates.len(),
        dispatched = s.dispatched,
        succeeded = s.succeeded,
        "scan completed"
    );
    if s.invalid_tokens > 0 {
        warn!(invalid_tokens = s.invalid_tokens, "some push tokens were rejected");
    }
}

fn parse_hhmm(raw: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(|e| format!("expected HH:MM ({e})"))
}

/// Time from `now` until the next occurrence of `at` (UTC). Today if still ahead, else tomorrow.
fn delay_until_next(now: DateTime<Utc>, at: NaiveTime) -> Duration {
    let today = now.date_naive().and_time(at).and_utc();
    let target = if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    };
    (target - now).to_std().unwrap_or(Duration::ZERO)
}
