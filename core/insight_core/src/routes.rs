use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::analyzer::TextAnalyzer;
use crate::models::{JournalEntry, NewEntry, UserProfile, MAX_CONTENT_CHARS};
use crate::notify::{DispatchError, NotificationDispatcher, PushPayload, PushTarget};
use crate::prompts::PromptEntry;
use crate::scanner::{InactivityScanner, ScanPolicy};
use crate::settings::{
    PolicySettings, SettingsUpdate, MAX_DISPATCH_CONCURRENCY, MAX_WINDOW_DAYS, MIN_THRESHOLD_DAYS,
};
use crate::stats::{aggregate_weekly, emotion_tally, summarize_period, trend_labels, Tally, TrendMode, Window};
use crate::store::{EntryStore, SqliteStore, StoreError};
use crate::timefmt::{local_date, normalize_tz_offset_minutes, parse_date, parse_ts, tz_offset_from_minutes};

pub const CRON_SECRET_HEADER: &str = "x-cron-secret";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteStore>,
    pub analyzer: TextAnalyzer,
    pub dispatcher: NotificationDispatcher,
    pub scanner: InactivityScanner,
    pub settings: Arc<Mutex<PolicySettings>>,
    pub cron_secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(
        store: Arc<SqliteStore>,
        analyzer: TextAnalyzer,
        dispatcher: NotificationDispatcher,
        settings: PolicySettings,
        cron_secret: Option<String>,
    ) -> Self {
        let entries: Arc<dyn EntryStore> = store.clone();
        Self {
            scanner: InactivityScanner::new(entries, dispatcher.clone()),
            store,
            analyzer,
            dispatcher,
            settings: Arc::new(Mutex::new(settings)),
            cron_secret: cron_secret
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .map(Arc::from),
        }
    }
}

#[derive(Serialize)]
struct OkResponse<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Serialize)]
struct ErrResponse {
    ok: bool,
    error: &'static str,
}

fn ok_response<T: Serialize>(data: T) -> Response {
    Json(OkResponse {
        ok: true,
        data: Some(data),
    })
    .into_response()
}

fn err_response(status: StatusCode, error: &'static str) -> Response {
    (status, Json(ErrResponse { ok: false, error })).into_response()
}

fn db_error(context: &str, err: StoreError) -> Response {
    error!("{context} failed: {err}");
    err_response(StatusCode::INTERNAL_SERVER_ERROR, "db_error")
}

pub async fn options_ok() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
struct HealthInfo {
    service: &'static str,
    version: &'static str,
}

pub async fn health() -> impl IntoResponse {
    Json(OkResponse {
        ok: true,
        data: Some(HealthInfo {
            service: "insight_core",
            version: env!("CARGO_PKG_VERSION"),
        }),
    })
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Shared-secret check for scheduler-facing routes.
///
/// Missing credential is 401. A wrong one, or a server without a secret, is 403.
fn check_cron_secret(headers: &HeaderMap, expected: Option<&str>) -> Result<(), Response> {
    let presented = headers
        .get(CRON_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let Some(presented) = presented else {
        return Err(err_response(StatusCode::UNAUTHORIZED, "missing_secret"));
    };
    match expected {
        Some(expected) if constant_time_eq(presented.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => Err(err_response(StatusCode::FORBIDDEN, "invalid_secret")),
    }
}

#[derive(Serialize)]
struct UserInfo {
    id: String,
    active: bool,
    notifications_enabled: bool,
    has_push_token: bool,
}

pub async fn post_users(State(state): State<AppState>, Json(req): Json<UserProfile>) -> Response {
    let id = req.id.trim().to_string();
    if id.is_empty() {
        return err_response(StatusCode::BAD_REQUEST, "missing_user_id");
    }
    let profile = UserProfile { id, ..req };
    if let Err(err) = state.store.upsert_user(&profile).await {
        return db_error("upsert_user", err);
    }
    ok_response(UserInfo {
        has_push_token: profile
            .push_token
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty()),
        id: profile.id,
        active: profile.active,
        notifications_enabled: profile.notifications_enabled,
    })
}

#[derive(Deserialize)]
pub struct CreateEntry {
    user_id: String,
    content: String,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

pub async fn post_entries(State(state): State<AppState>, Json(req): Json<CreateEntry>) -> Response {
    let user_id = req.user_id.trim();
    if user_id.is_empty() {
        return err_response(StatusCode::BAD_REQUEST, "missing_user_id");
    }
    if req.content.trim().is_empty() {
        return err_response(StatusCode::BAD_REQUEST, "empty_content");
    }
    if req.content.chars().count() > MAX_CONTENT_CHARS {
        return err_response(StatusCode::BAD_REQUEST, "content_too_long");
    }
    let created_at = match req.created_at.as_deref() {
        None => OffsetDateTime::now_utc(),
        Some(raw) => match parse_ts(raw) {
            Some(t) => t,
            None => return err_response(StatusCode::BAD_REQUEST, "invalid_ts"),
        },
    };

    let analysis = state.analyzer.analyze(&req.content).await;
    let new_entry = NewEntry {
        user_id: user_id.to_string(),
        content: req.content,
        created_at,
        tags: req.tags,
    };
    match state.store.insert_entry(new_entry, Some(&analysis)).await {
        Ok(entry) => ok_response(entry),
        Err(err) => db_error("insert_entry", err),
    }
}

#[derive(Deserialize)]
pub struct EntryQuery {
    id: i64,
}

pub async fn get_entry(State(state): State<AppState>, Query(q): Query<EntryQuery>) -> Response {
    match state.store.get_entry(q.id).await {
        Ok(Some(entry)) => ok_response(entry),
        Ok(None) => err_response(StatusCode::NOT_FOUND, "entry_not_found"),
        Err(err) => db_error("get_entry", err),
    }
}

#[derive(Deserialize)]
pub struct ReanalyzeRequest {
    user_id: String,
}

#[derive(Serialize)]
struct ReanalyzeResult {
    total: usize,
    updated: usize,
    failed: usize,
}

pub async fn post_entries_reanalyze(State(state): State<AppState>, Json(req): Json<ReanalyzeRequest>) -> Response {
    let user_id = req.user_id.trim();
    if user_id.is_empty() {
        return err_response(StatusCode::BAD_REQUEST, "missing_user_id");
    }
    let entries = match state.store.entries_for_user(user_id).await {
        Ok(v) => v,
        Err(err) => return db_error("entries_for_user", err),
    };

    let texts: Vec<&str> = entries.iter().map(|e| e.content.as_str()).collect();
    let results = state.analyzer.analyze_many(&texts).await;

    let mut updated = 0;
    let mut failed = 0;
    for (entry, analysis) in entries.iter().zip(results.iter()) {
        match state.store.update_analysis(entry.id, analysis).await {
            Ok(()) => updated += 1,
            Err(err) => {
                warn!(entry_id = entry.id, "update_analysis failed: {err}");
                failed += 1;
            }
        }
    }
    info!(user_id = %user_id, updated, failed, "re-analysis finished");
    ok_response(ReanalyzeResult {
        total: entries.len(),
        updated,
        failed,
    })
}

/// Window selection shared by the stats and synthesis routes.
#[derive(Deserialize)]
pub struct WindowQuery {
    #[serde(default)]
    user_id: String,
    /// First day of an explicit range (YYYY-MM-DD, local). Overrides `days`.
    #[serde(default)]
    start: Option<String>,
    /// Last day of the window (YYYY-MM-DD, local). Defaults to today.
    #[serde(default)]
    end: Option<String>,
    #[serde(default)]
    days: Option<i64>,
    #[serde(default)]
    tz_offset_minutes: Option<i32>,
}

fn resolve_window(q: &WindowQuery, default_days: i64, now: OffsetDateTime) -> Result<Window, &'static str> {
    let tz = tz_offset_from_minutes(normalize_tz_offset_minutes(q.tz_offset_minutes));
    let end = match q.end.as_deref() {
        Some(raw) => parse_date(raw).ok_or("invalid_date")?,
        None => local_date(now, tz),
    };
    if let Some(raw) = q.start.as_deref() {
        let start = parse_date(raw).ok_or("invalid_date")?;
        let window = Window::new(start, end, tz).ok_or("invalid_range")?;
        if window.day_count() > MAX_WINDOW_DAYS {
            return Err("invalid_range");
        }
        return representable(window);
    }
    let days = q.days.unwrap_or(default_days);
    if !(1..=MAX_WINDOW_DAYS).contains(&days) {
        return Err("invalid_days");
    }
    let days = u32::try_from(days).map_err(|_| "invalid_days")?;
    representable(Window::ending_on(end, days, tz))
}

fn representable(window: Window) -> Result<Window, &'static str> {
    match window.utc_range() {
        Some(_) => Ok(window),
        None => Err("invalid_date"),
    }
}

async fn window_request(state: &AppState, q: &WindowQuery) -> Result<(String, Window, Vec<JournalEntry>), Response> {
    let user_id = q.user_id.trim();
    if user_id.is_empty() {
        return Err(err_response(StatusCode::BAD_REQUEST, "missing_user_id"));
    }
    let default_days = { state.settings.lock().await.stats_window_days };
    let window = resolve_window(q, default_days, OffsetDateTime::now_utc())
        .map_err(|code| err_response(StatusCode::BAD_REQUEST, code))?;
    let Some((start, end)) = window.utc_range() else {
        return Err(err_response(StatusCode::BAD_REQUEST, "invalid_date"));
    };
    let entries = state
        .store
        .entries_between(user_id, start, end)
        .await
        .map_err(|err| db_error("entries_between", err))?;
    Ok((user_id.to_string(), window, entries))
}

async fn baseline_tally(
    store: &SqliteStore,
    user_id: &str,
    window: &Window,
    mode: TrendMode,
) -> Result<Tally, StoreError> {
    match mode {
        TrendMode::PreviousPeriod => {
            let prev = window.previous();
            let Some((start, end)) = prev.utc_range() else {
                return Ok(Tally::default());
            };
            let entries = store.entries_between(user_id, start, end).await?;
            Ok(emotion_tally(&entries, &prev))
        }
        TrendMode::PrecedingEntry => {
            let Some((start, _)) = window.utc_range() else {
                return Ok(Tally::default());
            };
            Ok(match store.last_entry_before(user_id, start).await? {
                Some(e) => Tally::from_keys(e.emotions.iter().map(String::as_str)),
                None => Tally::default(),
            })
        }
    }
}

pub async fn get_stats_weekly(State(state): State<AppState>, Query(q): Query<WindowQuery>) -> Response {
    let (user_id, window, entries) = match window_request(&state, &q).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let mode = { state.settings.lock().await.trend_mode };
    let baseline = match baseline_tally(&state.store, &user_id, &window, mode).await {
        Ok(t) => t,
        Err(err) => return db_error("trend baseline", err),
    };
    let stats = aggregate_weekly(&entries, &window);
    let trends = trend_labels(&stats.emotion_counts, &baseline);
    ok_response(stats.with_trends(trends))
}

pub async fn get_stats_summary(State(state): State<AppState>, Query(q): Query<WindowQuery>) -> Response {
    match window_request(&state, &q).await {
        Ok((_, window, entries)) => ok_response(summarize_period(&entries, &window)),
        Err(resp) => resp,
    }
}

#[derive(Serialize)]
struct WindowedResult<T: Serialize> {
    start_date: String,
    end_date: String,
    entry_count: usize,
    #[serde(flatten)]
    result: T,
}

fn prompt_entries(entries: &[JournalEntry]) -> Vec<PromptEntry<'_>> {
    entries
        .iter()
        .map(|e| PromptEntry {
            content: &e.content,
            created_at: e.created_at,
        })
        .collect()
}

pub async fn post_insights(State(state): State<AppState>, Json(q): Json<WindowQuery>) -> Response {
    let (_, window, entries) = match window_request(&state, &q).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let insights = state.analyzer.synthesize_entries(&prompt_entries(&entries)).await;
    ok_response(WindowedResult {
        start_date: window.start.to_string(),
        end_date: window.end.to_string(),
        entry_count: entries.len(),
        result: insights,
    })
}

pub async fn post_keywords(State(state): State<AppState>, Json(q): Json<WindowQuery>) -> Response {
    let (_, window, entries) = match window_request(&state, &q).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let report = state.analyzer.keywords(&prompt_entries(&entries)).await;
    ok_response(WindowedResult {
        start_date: window.start.to_string(),
        end_date: window.end.to_string(),
        entry_count: entries.len(),
        result: report,
    })
}

pub async fn post_notifications_scan(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_cron_secret(&headers, state.cron_secret.as_deref()) {
        return resp;
    }
    let policy = {
        let settings = state.settings.lock().await;
        ScanPolicy::from(&*settings)
    };
    match state.scanner.scan(OffsetDateTime::now_utc(), policy).await {
        Ok(report) => ok_response(report),
        Err(err) => {
            error!("inactivity scan aborted: {err}");
            err_response(StatusCode::INTERNAL_SERVER_ERROR, "scan_failed")
        }
    }
}

#[derive(Deserialize)]
pub struct SendRequest {
    #[serde(flatten)]
    target: PushTarget,
    title: String,
    body: String,
    #[serde(default)]
    data: BTreeMap<String, String>,
}

pub async fn post_notifications_send(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SendRequest>,
) -> Response {
    if let Err(resp) = check_cron_secret(&headers, state.cron_secret.as_deref()) {
        return resp;
    }
    if req.title.trim().is_empty() {
        return err_response(StatusCode::BAD_REQUEST, "missing_title");
    }
    let payload = PushPayload {
        title: req.title,
        body: req.body,
        data: req.data,
    };
    match state.dispatcher.send(&req.target, &payload).await {
        Ok(outcome) => ok_response(outcome),
        Err(DispatchError::MissingTarget) => err_response(StatusCode::BAD_REQUEST, "missing_target"),
        Err(DispatchError::Store(err)) => db_error("push_token_for", err),
    }
}

pub async fn get_settings(State(state): State<AppState>) -> Response {
    let settings = { *state.settings.lock().await };
    ok_response(settings)
}

pub async fn post_settings(State(state): State<AppState>, Json(req): Json<SettingsUpdate>) -> Response {
    if let Some(v) = req.inactivity_threshold_days {
        if !v.is_finite() || v < MIN_THRESHOLD_DAYS {
            return err_response(StatusCode::BAD_REQUEST, "invalid_inactivity_threshold_days");
        }
    }
    if let Some(v) = req.stats_window_days {
        if !(1..=MAX_WINDOW_DAYS).contains(&v) {
            return err_response(StatusCode::BAD_REQUEST, "invalid_stats_window_days");
        }
    }
    if let Some(v) = req.dispatch_concurrency {
        if !(1..=MAX_DISPATCH_CONCURRENCY).contains(&v) {
            return err_response(StatusCode::BAD_REQUEST, "invalid_dispatch_concurrency");
        }
    }

    let current = { *state.settings.lock().await };
    if req.is_empty() {
        return ok_response(current);
    }
    let settings = req.apply(current);
    if let Err(err) = state.store.save_settings(settings).await {
        return db_error("save_settings", err);
    }
    {
        let mut guard = state.settings.lock().await;
        *guard = settings;
    }
    ok_response(settings)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::analyzer::tests::FakeLlm;
    use crate::models::AnalysisResult;
    use crate::notify::tests::FakePush;
    use axum::http::HeaderValue;
    use serde_json::{json, Value};
    use time::macros::datetime;

    const LLM_REPLY: &str = r#"{"mood":"happy","sentiment":"positive","sentimentScore":0.8,"emotions":["joy"],"insight":"Nice."}"#;

    pub(crate) fn test_state(secret: Option<&str>) -> AppState {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let analyzer = TextAnalyzer::new(Arc::new(FakeLlm::text(LLM_REPLY)));
        let dispatcher = NotificationDispatcher::new(Arc::new(FakePush::default()), store.clone());
        AppState::new(
            store,
            analyzer,
            dispatcher,
            PolicySettings::default(),
            secret.map(String::from),
        )
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn secret_headers(value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(CRON_SECRET_HEADER, HeaderValue::from_str(value).unwrap());
        h
    }

    fn window_query(user_id: &str, end: &str, days: i64) -> WindowQuery {
        WindowQuery {
            user_id: user_id.into(),
            start: None,
            end: Some(end.into()),
            days: Some(days),
            tz_offset_minutes: None,
        }
    }

    #[test]
    fn secret_guard_statuses() {
        let status = |h: &HeaderMap, expected: Option<&str>| match check_cron_secret(h, expected) {
            Ok(()) => StatusCode::OK,
            Err(resp) => resp.status(),
        };
        assert_eq!(status(&HeaderMap::new(), Some("s3cret")), StatusCode::UNAUTHORIZED);
        assert_eq!(status(&secret_headers("nope"), Some("s3cret")), StatusCode::FORBIDDEN);
        assert_eq!(status(&secret_headers("s3cret"), None), StatusCode::FORBIDDEN);
        assert_eq!(status(&secret_headers("s3cret"), Some("s3cret")), StatusCode::OK);

        let mut bearer = HeaderMap::new();
        bearer.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer s3cret"),
        );
        assert_eq!(status(&bearer, Some("s3cret")), StatusCode::OK);
    }

    #[test]
    fn constant_time_eq_compares_bytes() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn window_resolution() {
        let now = datetime!(2026-03-10 23:30 UTC);
        let q = WindowQuery {
            user_id: "u".into(),
            start: None,
            end: None,
            days: None,
            tz_offset_minutes: Some(60),
        };
        let w = resolve_window(&q, 7, now).unwrap();
        assert_eq!(w.end.to_string(), "2026-03-11");
        assert_eq!(w.day_count(), 7);

        assert_eq!(resolve_window(&window_query("u", "2026-03-10", 0), 7, now), Err("invalid_days"));
        assert_eq!(resolve_window(&window_query("u", "2026-03-10", 91), 7, now), Err("invalid_days"));
        assert_eq!(resolve_window(&window_query("u", "03/10/2026", 7), 7, now), Err("invalid_date"));

        let mut ranged = window_query("u", "2026-03-10", 7);
        ranged.start = Some("2026-03-01".into());
        assert_eq!(resolve_window(&ranged, 7, now).unwrap().day_count(), 10);
        ranged.start = Some("2026-03-11".into());
        assert_eq!(resolve_window(&ranged, 7, now), Err("invalid_range"));

        assert_eq!(resolve_window(&window_query("u", "9999-12-31", 7), 7, now), Err("invalid_date"));
        let mut west = window_query("u", "9999-12-31", 7);
        west.tz_offset_minutes = Some(-60);
        assert_eq!(resolve_window(&west, 7, now), Err("invalid_date"));
    }

    #[tokio::test]
    async fn stats_at_calendar_edge_are_rejected() {
        let state = test_state(None);
        let resp = get_stats_weekly(State(state), Query(window_query("u1", "9999-12-31", 7))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "invalid_date");
    }

    #[tokio::test]
    async fn entry_validation() {
        let state = test_state(None);
        let empty = CreateEntry {
            user_id: "u1".into(),
            content: "   ".into(),
            created_at: None,
            tags: Vec::new(),
        };
        let resp = post_entries(State(state.clone()), Json(empty)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "empty_content");

        let long = CreateEntry {
            user_id: "u1".into(),
            content: "a".repeat(MAX_CONTENT_CHARS + 1),
            created_at: None,
            tags: Vec::new(),
        };
        let resp = post_entries(State(state.clone()), Json(long)).await;
        assert_eq!(body_json(resp).await["error"], "content_too_long");

        let unrepresentable = CreateEntry {
            user_id: "u1".into(),
            content: "late".into(),
            created_at: Some("9999-12-31T23:00:00-05:00".into()),
            tags: Vec::new(),
        };
        let resp = post_entries(State(state), Json(unrepresentable)).await;
        assert_eq!(body_json(resp).await["error"], "invalid_ts");
    }

    #[tokio::test]
    async fn entry_lookup_by_id() {
        let state = test_state(None);
        let req = CreateEntry {
            user_id: "u1".into(),
            content: "A calm morning.".into(),
            created_at: Some("2026-03-01T09:00:00Z".into()),
            tags: Vec::new(),
        };
        let created = body_json(post_entries(State(state.clone()), Json(req)).await).await;
        let id = created["data"]["id"].as_i64().unwrap();

        let resp = get_entry(State(state.clone()), Query(EntryQuery { id })).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["content"], "A calm morning.");
        assert_eq!(body["data"]["mood"], "happy");

        let resp = get_entry(State(state), Query(EntryQuery { id: id + 100 })).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["error"], "entry_not_found");
    }

    #[tokio::test]
    async fn created_entry_is_analyzed_and_aggregated() {
        let state = test_state(None);
        for ts in ["2026-03-01T09:00:00Z", "2026-03-03T09:00:00Z"] {
            let req = CreateEntry {
                user_id: "u1".into(),
                content: "Had a great walk.".into(),
                created_at: Some(ts.into()),
                tags: vec!["outdoors".into()],
            };
            let resp = post_entries(State(state.clone()), Json(req)).await;
            assert_eq!(resp.status(), StatusCode::OK);
            let body = body_json(resp).await;
            assert_eq!(body["data"]["mood"], "happy");
            assert_eq!(body["data"]["emotions"], json!(["joy"]));
        }

        let resp = get_stats_weekly(State(state.clone()), Query(window_query("u1", "2026-03-03", 3))).await;
        let body = body_json(resp).await;
        assert_eq!(body["data"]["total_entries"], 2);
        assert_eq!(body["data"]["emotion_counts"]["joy"], 2);
        assert_eq!(body["data"]["daily_emotions"].as_array().unwrap().len(), 3);
        assert_eq!(body["data"]["dominant_mood"], "happy");
        assert_eq!(body["data"]["trends"], json!(["More joy"]));

        let resp = get_stats_summary(State(state), Query(window_query("u1", "2026-03-03", 3))).await;
        let body = body_json(resp).await;
        assert_eq!(body["data"]["active_days"], 2);
        assert_eq!(body["data"]["current_streak_days"], 1);
    }

    #[tokio::test]
    async fn weekly_trends_follow_selected_baseline() {
        let state = test_state(None);
        let seed = [
            (datetime!(2026-02-27 09:00 UTC), vec!["stress"]),
            (datetime!(2026-02-28 21:00 UTC), vec!["calm", "joy"]),
            (datetime!(2026-03-01 09:00 UTC), vec!["joy"]),
            (datetime!(2026-03-02 09:00 UTC), vec!["joy"]),
        ];
        for (created_at, emotions) in seed {
            let analysis = AnalysisResult {
                emotions: emotions.into_iter().map(String::from).collect(),
                ..AnalysisResult::default()
            };
            state
                .store
                .insert_entry(
                    NewEntry {
                        user_id: "u1".into(),
                        content: "day".into(),
                        created_at,
                        tags: Vec::new(),
                    },
                    Some(&analysis),
                )
                .await
                .unwrap();
        }

        let resp = get_stats_weekly(State(state.clone()), Query(window_query("u1", "2026-03-03", 3))).await;
        let body = body_json(resp).await;
        assert_eq!(body["data"]["trends"], json!(["More joy", "Less stress", "Less calm"]));

        let update: SettingsUpdate = serde_json::from_value(json!({"trend_mode": "preceding_entry"})).unwrap();
        assert_eq!(post_settings(State(state.clone()), Json(update)).await.status(), StatusCode::OK);

        let resp = get_stats_weekly(State(state), Query(window_query("u1", "2026-03-03", 3))).await;
        let body = body_json(resp).await;
        assert_eq!(body["data"]["total_entries"], 2);
        assert_eq!(body["data"]["trends"], json!(["More joy", "Less calm"]));
    }

    #[tokio::test]
    async fn insights_without_entries_use_default() {
        let state = test_state(None);
        let resp = post_insights(State(state), Json(window_query("u1", "2026-03-03", 7))).await;
        let body = body_json(resp).await;
        assert_eq!(body["data"]["entry_count"], 0);
        assert_eq!(body["data"]["summary"], "No insights available yet.");
    }

    #[tokio::test]
    async fn reanalyze_updates_every_entry() {
        let state = test_state(None);
        for i in 0..3 {
            state
                .store
                .insert_entry(
                    NewEntry {
                        user_id: "u1".into(),
                        content: format!("entry {i}"),
                        created_at: datetime!(2026-03-01 09:00 UTC),
                        tags: Vec::new(),
                    },
                    None,
                )
                .await
                .unwrap();
        }
        let resp = post_entries_reanalyze(
            State(state.clone()),
            Json(ReanalyzeRequest { user_id: "u1".into() }),
        )
        .await;
        let body = body_json(resp).await;
        assert_eq!(body["data"]["updated"], 3);
        let entries = state.store.entries_for_user("u1").await.unwrap();
        assert!(entries.iter().all(|e| e.insight.as_deref() == Some("Nice.")));
    }

    #[tokio::test]
    async fn scan_requires_secret() {
        let state = test_state(Some("s3cret"));
        let resp = post_notifications_scan(State(state.clone()), HeaderMap::new()).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let resp = post_notifications_scan(State(state.clone()), secret_headers("wrong")).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        state
            .store
            .upsert_user(&UserProfile {
                id: "quiet".into(),
                active: true,
                notifications_enabled: true,
                push_token: Some("tok-quiet".into()),
            })
            .await
            .unwrap();
        let resp = post_notifications_scan(State(state), secret_headers("s3cret")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["dispatched"], 1);
        assert_eq!(body["data"]["succeeded"], 1);
    }

    #[tokio::test]
    async fn send_without_target_is_rejected() {
        let state = test_state(Some("s3cret"));
        let req = SendRequest {
            target: PushTarget::default(),
            title: "Hi".into(),
            body: "there".into(),
            data: BTreeMap::new(),
        };
        let resp = post_notifications_send(State(state.clone()), secret_headers("s3cret"), Json(req)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "missing_target");

        let req: SendRequest =
            serde_json::from_value(json!({"push_token":"bad-tok","title":"Hi","body":"there"})).unwrap();
        let resp = post_notifications_send(State(state), secret_headers("s3cret"), Json(req)).await;
        let body = body_json(resp).await;
        assert_eq!(body["data"]["outcome"], "invalid_token");
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let state = test_state(None);
        let bad: SettingsUpdate = serde_json::from_value(json!({"stats_window_days": 0})).unwrap();
        let resp = post_settings(State(state.clone()), Json(bad)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let good: SettingsUpdate =
            serde_json::from_value(json!({"trend_mode": "preceding_entry", "clear_invalid_tokens": true})).unwrap();
        let resp = post_settings(State(state.clone()), Json(good)).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(get_settings(State(state.clone())).await).await;
        assert_eq!(body["data"]["trend_mode"], "preceding_entry");
        assert_eq!(body["data"]["clear_invalid_tokens"], true);
        let persisted = state
            .store
            .load_or_init_settings(PolicySettings::default())
            .await
            .unwrap();
        assert_eq!(persisted.trend_mode, TrendMode::PrecedingEntry);
    }
}
