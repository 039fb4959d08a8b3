//! JSON HTTP surface for the review monitor: registry CRUD, read models,
//! scrape/schedule triggers and CSV exports.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rdk_core::{iso_millis, Review};
use rdk_pipeline::{AdhocScrapeConfig, NewApp, Pipeline, PipelineError};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "rdk-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScrapeRequest {
    #[serde(default)]
    app_config: Option<AdhocScrapeConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct RecentQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ExportQuery {
    reviews: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/apps", get(list_apps_handler).post(create_app_handler))
        .route(
            "/apps/{id}",
            get(get_app_handler)
                .put(update_app_handler)
                .delete(delete_app_handler),
        )
        .route("/apps/{id}/reviews", get(app_reviews_handler))
        .route("/apps/{id}/rating-history", get(rating_history_handler))
        .route("/apps/{id}/regions", get(region_distribution_handler))
        .route("/reviews/recent", get(recent_reviews_handler))
        .route("/stats", get(stats_handler))
        .route("/scrape", post(scrape_handler))
        .route("/schedule", post(schedule_handler))
        .route("/export/{id}", get(export_app_handler))
        .route("/export-reviews", get(export_filtered_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("RDK_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn list_apps_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.repo().get_all_apps().await {
        Ok(apps) => Json(apps).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn create_app_handler(
    State(state): State<Arc<AppState>>,
    Json(new_app): Json<NewApp>,
) -> Response {
    match state.pipeline.repo().create_app(new_app).await {
        Ok(app) => Json(app).into_response(),
        Err(err) => pipeline_error(err),
    }
}

async fn get_app_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.pipeline.repo().get_app(&id).await {
        Ok(Some(app)) => Json(app).into_response(),
        Ok(None) => app_not_found(),
        Err(err) => server_error(err.into()),
    }
}

/// Replace an app's configuration. Derived fields stay server-owned: the
/// stored rating and review count carry over regardless of the payload.
async fn update_app_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(update): Json<NewApp>,
) -> Response {
    let existing = match state.pipeline.repo().get_app(&id).await {
        Ok(Some(app)) => app,
        Ok(None) => return app_not_found(),
        Err(err) => return server_error(err.into()),
    };
    let updated = rdk_core::App {
        id: existing.id,
        name: update.name,
        icon: update.icon,
        app_store_id: update.app_store_id,
        play_store_id: update.play_store_id,
        app_store_regions: update.app_store_regions,
        play_store_regions: update.play_store_regions,
        app_store_frequency: update.app_store_frequency,
        play_store_frequency: update.play_store_frequency,
        rating: existing.rating,
        review_count: existing.review_count,
        last_updated: existing.last_updated,
    };
    match state.pipeline.repo().update_app(updated).await {
        Ok(app) => Json(app).into_response(),
        Err(err) => pipeline_error(err),
    }
}

async fn delete_app_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.pipeline.repo().get_app(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return app_not_found(),
        Err(err) => return server_error(err.into()),
    }
    match state.pipeline.repo().delete_app(&id).await {
        Ok(()) => Json(serde_json::json!({ "success": true })).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn app_reviews_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.pipeline.repo().get_app(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return app_not_found(),
        Err(err) => return server_error(err.into()),
    }
    match state.pipeline.repo().read_reviews(&id).await {
        Ok(reviews) => Json(reviews).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn rating_history_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.pipeline.repo().rating_history(&id).await {
        Ok(history) => Json(history).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn region_distribution_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.pipeline.repo().region_distribution(&id).await {
        Ok(distribution) => Json(distribution).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn recent_reviews_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(10);
    match state.pipeline.repo().recent_reviews(limit).await {
        Ok(reviews) => Json(reviews).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.repo().stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => server_error(err.into()),
    }
}

/// Full-volume scrape of an arbitrary (possibly unsaved) configuration.
/// Counts only; nothing is persisted.
async fn scrape_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ScrapeRequest>,
) -> Response {
    let Some(config) = request.app_config else {
        return json_error(StatusCode::BAD_REQUEST, "App configuration is required");
    };
    let count = state.pipeline.scrape_adhoc(&config).await;
    Json(serde_json::json!({
        "success": true,
        "reviewsCount": count,
        "message": format!("Successfully scraped {count} reviews"),
    }))
    .into_response()
}

async fn schedule_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.run_due_tasks().await {
        Ok(summary) => Json(serde_json::json!({
            "success": true,
            "message": "Scheduled tasks completed successfully",
            "summary": summary,
        }))
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn export_app_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let app = match state.pipeline.repo().get_app(&id).await {
        Ok(Some(app)) => app,
        Ok(None) => return app_not_found(),
        Err(err) => return server_error(err.into()),
    };
    let reviews = match state.pipeline.repo().read_reviews(&id).await {
        Ok(reviews) => reviews,
        Err(err) => return server_error(err.into()),
    };
    let filename = format!("{}_reviews.csv", whitespace_to_underscores(&app.name));
    csv_response(&reviews, &filename)
}

/// Export a caller-filtered review set passed as a JSON-encoded query
/// parameter.
async fn export_filtered_handler(Query(query): Query<ExportQuery>) -> Response {
    let Some(raw) = query.reviews else {
        return json_error(StatusCode::BAD_REQUEST, "Reviews data is required");
    };
    let reviews: Vec<Review> = match serde_json::from_str(&raw) {
        Ok(reviews) => reviews,
        Err(_) => return json_error(StatusCode::BAD_REQUEST, "Invalid reviews data"),
    };
    csv_response(&reviews, "filtered_reviews.csv")
}

/// Fixed-column CSV used by both export endpoints. User and review text are
/// quoted with doubled inner quotes; dates are millisecond-precision UTC.
pub fn reviews_to_csv(reviews: &[Review]) -> String {
    let mut out = String::from("ID,User,Rating,Date,Store,Region,Version,Review");
    for review in reviews {
        out.push('\n');
        out.push_str(&format!(
            "{},{},{},{},{},{},{},{}",
            review.id,
            csv_quote(&review.user_name),
            review.rating,
            iso_millis(&review.date),
            review.store.as_str(),
            review.region,
            review.version,
            csv_quote(&review.text),
        ));
    }
    out
}

fn csv_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

fn whitespace_to_underscores(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join("_")
}

fn csv_response(reviews: &[Review], filename: &str) -> Response {
    let disposition = format!("attachment; filename=\"{filename}\"");
    let Ok(disposition) = header::HeaderValue::from_str(&disposition) else {
        return json_error(StatusCode::BAD_REQUEST, "Invalid export filename");
    };
    (
        [
            (
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("text/csv; charset=utf-8"),
            ),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        reviews_to_csv(reviews),
    )
        .into_response()
}

fn app_not_found() -> Response {
    json_error(StatusCode::NOT_FOUND, "App not found")
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn pipeline_error(err: PipelineError) -> Response {
    match err {
        PipelineError::AppNotFound(_) => app_not_found(),
        PipelineError::InvalidConfig(message) => json_error(StatusCode::BAD_REQUEST, &message),
        PipelineError::Store(err) => server_error(err.into()),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, &format!("Server error: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use rdk_adapters::{AppStoreClient, HttpConfig, PlayStoreClient};
    use rdk_core::{Frequency, Source};
    use rdk_pipeline::Repository;
    use rdk_store::MemoryKvStore;
    use tower::ServiceExt;

    fn test_state() -> (AppState, Repository) {
        let repo = Repository::new(Arc::new(MemoryKvStore::new()));
        let config = HttpConfig::default();
        let pipeline = Pipeline::new(
            repo.clone(),
            Arc::new(AppStoreClient::new(&config).expect("app store client")),
            Arc::new(PlayStoreClient::new(&config).expect("play store client")),
        );
        (AppState::new(Arc::new(pipeline)), repo)
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.expect("body").to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    async fn body_text(resp: Response) -> String {
        let bytes = resp.into_body().collect().await.expect("body").to_bytes();
        String::from_utf8(bytes.to_vec()).expect("utf8 body")
    }

    fn new_app_body(name: &str) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "appStoreId": "123",
            "appStoreRegions": ["US"],
            "appStoreFrequency": "daily",
        })
    }

    fn sample_review(id: &str, user: &str, text: &str) -> Review {
        Review {
            id: id.to_string(),
            app_id: "a1".to_string(),
            app_name: "Demo".to_string(),
            user_name: user.to_string(),
            rating: 4,
            text: text.to_string(),
            date: Utc.with_ymd_and_hms(2024, 1, 5, 12, 30, 0).single().expect("date"),
            store: Source::AppStore,
            region: "US".to_string(),
            version: "2.1".to_string(),
        }
    }

    fn percent_encode(raw: &str) -> String {
        let mut out = String::new();
        for byte in raw.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    out.push(byte as char)
                }
                _ => out.push_str(&format!("%{byte:02X}")),
            }
        }
        out
    }

    #[tokio::test]
    async fn app_crud_round_trip() {
        let (state, _repo) = test_state();
        let router = app(state);

        let created = router
            .clone()
            .oneshot(json_request("POST", "/apps", new_app_body("My App")))
            .await
            .expect("create");
        assert_eq!(created.status(), StatusCode::OK);
        let created = body_json(created).await;
        let id = created["id"].as_str().expect("id").to_string();
        assert_eq!(created["name"], "My App");
        assert_eq!(created["reviewCount"], 0);

        let listed = router.clone().oneshot(get("/apps")).await.expect("list");
        assert_eq!(body_json(listed).await.as_array().expect("array").len(), 1);

        let mut update = new_app_body("Renamed App");
        update["appStoreFrequency"] = serde_json::json!("weekly");
        let updated = router
            .clone()
            .oneshot(json_request("PUT", &format!("/apps/{id}"), update))
            .await
            .expect("update");
        assert_eq!(updated.status(), StatusCode::OK);
        let updated = body_json(updated).await;
        assert_eq!(updated["name"], "Renamed App");
        assert_eq!(updated["appStoreFrequency"], "weekly");

        let deleted = router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri(format!("/apps/{id}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("delete");
        assert_eq!(body_json(deleted).await["success"], true);

        let gone = router.oneshot(get(&format!("/apps/{id}"))).await.expect("get");
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(gone).await["error"], "App not found");
    }

    #[tokio::test]
    async fn create_app_without_any_store_id_is_rejected() {
        let (state, _repo) = test_state();
        let resp = app(state)
            .oneshot(json_request("POST", "/apps", serde_json::json!({ "name": "Nowhere" })))
            .await
            .expect("create");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn update_clearing_both_store_ids_is_rejected() {
        let (state, repo) = test_state();
        let router = app(state);
        router
            .clone()
            .oneshot(json_request("POST", "/apps", new_app_body("Demo")))
            .await
            .expect("create");
        let id = repo.get_all_apps().await.expect("apps")[0].id.clone();
        let resp = router
            .oneshot(json_request(
                "PUT",
                &format!("/apps/{id}"),
                serde_json::json!({ "name": "Demo" }),
            ))
            .await
            .expect("update");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_app_is_not_found() {
        let (state, _repo) = test_state();
        let router = app(state);
        for uri in ["/apps/missing", "/apps/missing/reviews", "/export/missing"] {
            let resp = router.clone().oneshot(get(uri)).await.expect("get");
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn aggregates_default_to_empty_arrays() {
        let (state, _repo) = test_state();
        let router = app(state);
        let history = router
            .clone()
            .oneshot(get("/apps/any/rating-history"))
            .await
            .expect("history");
        assert_eq!(body_json(history).await, serde_json::json!([]));
        let regions = router.oneshot(get("/apps/any/regions")).await.expect("regions");
        assert_eq!(body_json(regions).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn stats_reflect_registry_contents() {
        let (state, repo) = test_state();
        let router = app(state);
        router
            .clone()
            .oneshot(json_request("POST", "/apps", new_app_body("A")))
            .await
            .expect("create");
        let apps = repo.get_all_apps().await.expect("apps");
        repo.append_reviews(&apps[0].id, &[sample_review("as-1", "alice", "solid")])
            .await
            .expect("append");

        let stats = body_json(router.oneshot(get("/stats")).await.expect("stats")).await;
        assert_eq!(stats["totalApps"], 1);
        assert_eq!(stats["totalReviews"], 1);
        assert_eq!(stats["averageRating"], 4.0);
    }

    #[tokio::test]
    async fn recent_reviews_respect_limit() {
        let (state, repo) = test_state();
        let router = app(state);
        router
            .clone()
            .oneshot(json_request("POST", "/apps", new_app_body("A")))
            .await
            .expect("create");
        let apps = repo.get_all_apps().await.expect("apps");
        repo.append_reviews(
            &apps[0].id,
            &[
                sample_review("as-1", "alice", "one"),
                sample_review("as-2", "bob", "two"),
            ],
        )
        .await
        .expect("append");

        let resp = router.oneshot(get("/reviews/recent?limit=1")).await.expect("recent");
        assert_eq!(body_json(resp).await.as_array().expect("array").len(), 1);
    }

    #[tokio::test]
    async fn scrape_without_config_is_a_bad_request() {
        let (state, _repo) = test_state();
        let resp = app(state)
            .oneshot(json_request("POST", "/scrape", serde_json::json!({})))
            .await
            .expect("scrape");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "App configuration is required");
    }

    #[tokio::test]
    async fn schedule_with_empty_registry_succeeds() {
        let (state, _repo) = test_state();
        let resp = app(state)
            .oneshot(json_request("POST", "/schedule", serde_json::json!({})))
            .await
            .expect("schedule");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "Scheduled tasks completed successfully");
        assert_eq!(body["summary"]["tasksRun"], 0);
    }

    #[tokio::test]
    async fn export_app_produces_attachment_csv() {
        let (state, repo) = test_state();
        let router = app(state);
        router
            .clone()
            .oneshot(json_request("POST", "/apps", new_app_body("My Cool App")))
            .await
            .expect("create");
        let apps = repo.get_all_apps().await.expect("apps");
        repo.append_reviews(
            &apps[0].id,
            &[sample_review("as-1", "alice", "said \"wow\" twice")],
        )
        .await
        .expect("append");

        let resp = router
            .oneshot(get(&format!("/export/{}", apps[0].id)))
            .await
            .expect("export");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_DISPOSITION].to_str().expect("header"),
            "attachment; filename=\"My_Cool_App_reviews.csv\""
        );
        let csv = body_text(resp).await;
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().expect("header row"),
            "ID,User,Rating,Date,Store,Region,Version,Review"
        );
        assert_eq!(
            lines.next().expect("data row"),
            "as-1,\"alice\",4,2024-01-05T12:30:00.000Z,app-store,US,2.1,\"said \"\"wow\"\" twice\""
        );
    }

    #[tokio::test]
    async fn export_filtered_round_trips_query_payload() {
        let (state, _repo) = test_state();
        let payload =
            serde_json::to_string(&vec![sample_review("ps-7", "bob", "fine")]).expect("encode");
        let uri = format!("/export-reviews?reviews={}", percent_encode(&payload));
        let resp = app(state).oneshot(get(&uri)).await.expect("export");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_DISPOSITION].to_str().expect("header"),
            "attachment; filename=\"filtered_reviews.csv\""
        );
        let csv = body_text(resp).await;
        assert!(csv.contains("ps-7,\"bob\""));
    }

    #[tokio::test]
    async fn export_filtered_requires_reviews_param() {
        let (state, _repo) = test_state();
        let resp = app(state).oneshot(get("/export-reviews")).await.expect("export");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "Reviews data is required");
    }

    #[test]
    fn csv_uses_fixed_columns_and_doubles_quotes() {
        let review = sample_review("as-1", "a \"quoted\" user", "line");
        let csv = reviews_to_csv(&[review]);
        assert!(csv.contains("\"a \"\"quoted\"\" user\""));
        assert!(csv.starts_with("ID,User,Rating,Date,Store,Region,Version,Review\n"));
    }

    #[test]
    fn frequency_survives_registry_payload_round_trip() {
        let parsed: NewApp =
            serde_json::from_value(new_app_body("X")).expect("decode registry payload");
        assert_eq!(parsed.app_store_frequency, Some(Frequency::Daily));
        assert!(parsed.play_store_id.is_none());
    }
}
