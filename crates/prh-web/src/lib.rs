//! Axum JSON routes over the harvester operations.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use prh_core::{IdentityRecord, SnapshotPeriod};
use prh_storage::{ContactUpdate, StoreError, WindowQuery};
use prh_sync::Harvester;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "prh-web";

const DEFAULT_LIMIT: u32 = 10;
const MAX_LIMIT: u32 = 100;

#[derive(Clone)]
pub struct AppState {
    pub harvester: Harvester,
}

impl AppState {
    pub fn new(harvester: Harvester) -> Self {
        Self { harvester }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ListQuery {
    page: Option<u32>,
    limit: Option<u32>,
    date: Option<String>,
}

impl ListQuery {
    fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct GenerateQuery {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct NewUser {
    name: String,
    email: String,
    #[serde(default)]
    phone: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/github/prs/sync", post(sync_handler))
        .route("/api/github/prs/sync/{date}", post(sync_date_handler))
        .route("/api/github/prs", get(list_prs_handler))
        .route(
            "/api/github/repos/{owner}/{repo}/pulls/{number}",
            get(pull_request_handler),
        )
        .route("/api/users/reconcile", post(reconcile_handler))
        .route("/api/users", get(list_users_handler).post(create_user_handler))
        .route(
            "/api/users/{id}",
            get(get_user_handler)
                .put(update_user_handler)
                .delete(delete_user_handler),
        )
        .route("/api/generate/{date}", post(generate_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> Response {
    let date = state.harvester.yesterday();
    run_sync(&state, date).await
}

async fn sync_date_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(date): AxumPath<String>,
) -> Response {
    match parse_date(&date) {
        Ok(date) => run_sync(&state, date).await,
        Err(resp) => resp,
    }
}

async fn run_sync(state: &AppState, date: NaiveDate) -> Response {
    match state.harvester.ingest(date).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err),
    }
}

async fn list_prs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let window = match query.date.as_deref().filter(|d| !d.is_empty()) {
        Some(raw) => match parse_date(raw) {
            Ok(date) => Some(SnapshotPeriod::Day(date).window(state.harvester.utc_offset())),
            Err(resp) => return resp,
        },
        None => None,
    };
    let window_query = WindowQuery {
        window,
        page: query.page(),
        limit: query.limit(),
    };
    match state.harvester.store().query_pull_requests(&window_query).await {
        Ok(page) => Json(serde_json::json!({
            "prs": page.items,
            "total": page.total,
            "page": page.page,
            "totalPages": page.total_pages,
        }))
        .into_response(),
        Err(err) => store_error(err),
    }
}

async fn pull_request_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((owner, repo, number)): AxumPath<(String, String, u64)>,
) -> Response {
    let repository = format!("{owner}/{repo}");
    match state
        .harvester
        .store()
        .get_pull_request(&repository, number)
        .await
    {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => not_found(format!("pull request {repository}#{number} not found")),
        Err(err) => store_error(err),
    }
}

async fn reconcile_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.harvester.reconcile().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err),
    }
}

async fn list_users_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    match state
        .harvester
        .store()
        .list_identities(query.page(), query.limit())
        .await
    {
        Ok(page) => Json(serde_json::json!({
            "users": page.items,
            "total": page.total,
            "page": page.page,
            "totalPages": page.total_pages,
        }))
        .into_response(),
        Err(err) => store_error(err),
    }
}

async fn create_user_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewUser>,
) -> Response {
    let name = body.name.trim();
    let email = body.email.trim();
    if name.is_empty() || email.is_empty() {
        return bad_request("name and email are required".to_string());
    }
    let identity = IdentityRecord::local(name.to_string(), email.to_string(), body.phone);
    match state.harvester.store().insert_identity(&identity).await {
        Ok(stored) => (StatusCode::CREATED, Json(stored)).into_response(),
        Err(err) => store_error(err),
    }
}

async fn get_user_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    match state.harvester.store().get_identity(id).await {
        Ok(Some(identity)) => Json(identity).into_response(),
        Ok(None) => not_found(format!("user {id} not found")),
        Err(err) => store_error(err),
    }
}

async fn update_user_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    Json(update): Json<ContactUpdate>,
) -> Response {
    match state.harvester.store().update_contact(id, &update).await {
        Ok(identity) => Json(identity).into_response(),
        Err(err) => store_error(err),
    }
}

async fn delete_user_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    match state.harvester.store().delete_identity(id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => not_found(format!("user {id} not found")),
        Err(err) => store_error(err),
    }
}

async fn generate_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(date): AxumPath<String>,
    Query(query): Query<GenerateQuery>,
) -> Response {
    let date = match parse_date(&date) {
        Ok(date) => date,
        Err(resp) => return resp,
    };
    match state.harvester.generate(date, query.force).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err),
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, Response> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| bad_request(format!("invalid date {raw:?}; expected YYYY-MM-DD")))
}

fn json_error(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn bad_request(message: String) -> Response {
    json_error(StatusCode::BAD_REQUEST, message)
}

fn not_found(message: String) -> Response {
    json_error(StatusCode::NOT_FOUND, message)
}

fn store_error(err: StoreError) -> Response {
    match err {
        StoreError::EmailTaken(_) | StoreError::DuplicateKey { .. } | StoreError::DuplicateIdentity(_) => {
            json_error(StatusCode::CONFLICT, err.to_string())
        }
        StoreError::IdentityNotFound(_) => not_found(err.to_string()),
        other => server_error(other.into()),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use prh_adapters::FixtureSourceHost;
    use prh_storage::MemoryStore;
    use prh_sync::{SourceMode, SyncConfig};
    use serde_json::Value;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    fn sample_bundle_path() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/github/sample/bundle.json")
    }

    fn test_app() -> (Router, TempDir) {
        let dir = tempdir().unwrap();
        let config = SyncConfig {
            exports_dir: dir.path().to_path_buf(),
            source_mode: SourceMode::Fixed("acme/widgets".into()),
            ..SyncConfig::default()
        };
        let host = FixtureSourceHost::from_path(sample_bundle_path()).unwrap();
        let harvester = Harvester::new(config, Arc::new(MemoryStore::new()), Arc::new(host));
        (app(AppState::new(harvester)), dir)
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn sync_then_list_and_lookup() {
        let (app, _dir) = test_app();

        let resp = app
            .clone()
            .oneshot(request("POST", "/api/github/prs/sync/2024-06-10"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["inserted"], 3);

        let resp = app
            .clone()
            .oneshot(request("GET", "/api/github/prs?date=2024-06-10&limit=1&page=2"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let page = body_json(resp).await;
        assert_eq!(page["total"], 2);
        assert_eq!(page["totalPages"], 2);
        assert_eq!(page["page"], 2);
        assert_eq!(page["prs"].as_array().unwrap().len(), 1);

        let resp = app
            .clone()
            .oneshot(request("GET", "/api/github/repos/acme/widgets/pulls/1"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["title"], "Tighten widget validation");

        let resp = app
            .oneshot(request("GET", "/api/github/repos/acme/widgets/pulls/99"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_dates_are_rejected() {
        let (app, _dir) = test_app();
        let resp = app
            .clone()
            .oneshot(request("POST", "/api/github/prs/sync/10-06-2024"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .oneshot(request("GET", "/api/github/prs?date=yesterday"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn local_user_lifecycle() {
        let (app, _dir) = test_app();

        let resp = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/users",
                serde_json::json!({"name": "Ada", "email": "ada@example.com"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let id = body_json(resp).await["id"].as_i64().unwrap();

        let resp = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/users",
                serde_json::json!({"name": "Other", "email": "ada@example.com"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = app
            .clone()
            .oneshot(json_request(
                "PUT",
                &format!("/api/users/{id}"),
                serde_json::json!({"phone": "555-0100"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let updated = body_json(resp).await;
        assert_eq!(updated["phone"], "555-0100");
        assert_eq!(updated["email"], "ada@example.com");

        let resp = app.clone().oneshot(request("GET", "/api/users")).await.unwrap();
        assert_eq!(body_json(resp).await["total"], 1);

        let resp = app
            .clone()
            .oneshot(request("DELETE", &format!("/api/users/{id}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = app
            .oneshot(request("GET", &format!("/api/users/{id}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn generate_writes_snapshot_and_report() {
        let (app, dir) = test_app();
        app.clone()
            .oneshot(request("POST", "/api/github/prs/sync/2024-06-10"))
            .await
            .unwrap();

        let resp = app
            .clone()
            .oneshot(request("POST", "/api/generate/2024-06-10"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let summary = body_json(resp).await;
        assert_eq!(summary["export"]["records"], 2);
        assert!(dir.path().join("rapport_2024-06-10.md").exists());

        let resp = app
            .oneshot(request("POST", "/api/generate/2024-06-10?force=true"))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["export"]["written"], true);
    }

    #[tokio::test]
    async fn reconcile_reports_counts() {
        let (app, _dir) = test_app();
        app.clone()
            .oneshot(request("POST", "/api/github/prs/sync/2024-06-10"))
            .await
            .unwrap();
        let resp = app
            .oneshot(request("POST", "/api/users/reconcile"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["skipped"], 1);
    }
}
