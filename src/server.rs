//! JSON API over HTTP.
//!
//! All item routes live under `/api`. Stored uploads are served from
//! `/uploads/{name}`. Errors are rendered as `{"error": "<message>"}`.

use std::{future::Future, net::SocketAddr, sync::Arc};

use axum::{
    Json,
    Router,
    body::Bytes,
    extract::{
        DefaultBodyLimit,
        Multipart,
        Path,
        Query,
        State,
        multipart::MultipartError,
    },
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, de::DeserializeOwned};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::{
    blob_store::{BlobStore, UPLOADS_PREFIX},
    error::{Error, Result},
    item::{Category, CategoryCounts, Item, ItemPatch, normalize_tags},
    item_db::ItemDb,
    pipeline::{IngestionPipeline, Upload},
    query::{Page, QueryEngine},
    tantivy_index::SearchIndex,
    triage::Triage,
    worker::WorkerPool,
};

pub const DEFAULT_BIND: &str = "127.0.0.1:4000";
pub const DEFAULT_MAX_UPLOAD_MB: usize = 25;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_upload_bytes: usize,
    /// Allowed CORS origin. `None` allows any origin.
    pub cors_origin: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_MB * 1024 * 1024,
            cors_origin: None,
        }
    }
}

/// Services shared by every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub pipeline: IngestionPipeline,
    pub triage: Triage,
    pub query: QueryEngine,
    pub blobs: Arc<BlobStore>,
}

impl AppState {
    pub fn new(
        db: Arc<ItemDb>,
        index: Arc<SearchIndex>,
        blobs: Arc<BlobStore>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            pipeline: IngestionPipeline::new(
                Arc::clone(&db),
                Arc::clone(&index),
                Arc::clone(&blobs),
                pool,
            ),
            triage: Triage::new(Arc::clone(&db), Arc::clone(&index)),
            query: QueryEngine::new(db, index),
            blobs,
        }
    }
}

pub fn router(state: AppState, config: &ServerConfig) -> Result<Router> {
    let cors = match &config.cors_origin {
        Some(origin) => {
            let origin = HeaderValue::from_str(origin).map_err(|_| {
                Error::Config(format!("invalid CORS origin '{origin}'"))
            })?;
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods(Any)
                .allow_headers(Any)
        }
        None => CorsLayer::permissive(),
    };

    let api = Router::new()
        .route("/items", get(list_items).post(create_item))
        .route("/items/search", get(search_items))
        .route("/items/counts", get(item_counts))
        .route("/items/{id}", get(get_item).patch(update_item))
        .route("/upload", axum::routing::post(upload));

    Ok(Router::new()
        .nest("/api", api)
        .route(&format!("{UPLOADS_PREFIX}/{{name}}"), get(serve_upload))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(cors)
        .with_state(state))
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub enum ApiError {
    App(Error),
    Multipart(MultipartError),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::App(err)
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        ApiError::Multipart(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::App(err) => {
                let status = match &err {
                    Error::Validation(_) => StatusCode::BAD_REQUEST,
                    Error::NotFound { .. } => StatusCode::NOT_FOUND,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    error!(error = %err, "request failed");
                }
                (status, err.to_string())
            }
            ApiError::Multipart(err) => (err.status(), err.body_text()),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    page: Option<String>,
    category: Option<String>,
    tags: Option<String>,
    q: Option<String>,
}

struct Filters {
    page: usize,
    category: Option<Category>,
    tags: Vec<String>,
}

impl ListParams {
    fn filters(&self) -> Result<Filters> {
        let page = match non_empty(&self.page) {
            Some(raw) => raw.parse().map_err(|_| {
                Error::validation(format!("invalid page '{raw}'"))
            })?,
            None => 0,
        };
        let category = non_empty(&self.category).map(str::parse::<Category>).transpose()?;
        let tags = non_empty(&self.tags)
            .map(|raw| normalize_tags(raw.split(',')))
            .unwrap_or_default();
        Ok(Filters {
            page,
            category,
            tags,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_id(raw: &str) -> Result<u64> {
    match raw.parse::<u64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(Error::validation(format!("invalid item id '{raw}'"))),
    }
}

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| Error::validation(format!("invalid request body: {e}")))
}

async fn list_items(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Page>> {
    let f = params.filters()?;
    Ok(Json(state.query.list(f.page, f.category, f.tags).await?))
}

async fn search_items(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Page>> {
    let q = non_empty(&params.q)
        .ok_or_else(|| Error::validation("query parameter 'q' is required"))?
        .to_string();
    let f = params.filters()?;
    Ok(Json(state.query.search(q, f.page, f.category, f.tags).await?))
}

async fn item_counts(
    State(state): State<AppState>,
) -> ApiResult<Json<CategoryCounts>> {
    Ok(Json(state.triage.counts().await?))
}

#[derive(Debug, Deserialize)]
struct CreateItem {
    #[serde(default)]
    title: String,
    description: Option<String>,
}

async fn create_item(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Item>)> {
    let req: CreateItem = parse_json(&body)?;
    let item = state.pipeline.create(&req.title, req.description).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

async fn get_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Item>> {
    let id = parse_id(&id)?;
    Ok(Json(state.pipeline.get(id).await?))
}

async fn update_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Item>> {
    let id = parse_id(&id)?;
    let patch: ItemPatch = parse_json(&body)?;
    Ok(Json(state.triage.update(id, patch).await?))
}

async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<Item>)> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut title: Option<String> = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                file = Some((file_name, field.bytes().await?.to_vec()));
            }
            Some("title") => title = Some(field.text().await?),
            _ => {}
        }
    }

    let (file_name, bytes) =
        file.ok_or_else(|| Error::validation("file is required"))?;
    let item = state
        .pipeline
        .ingest(Upload {
            file_name,
            bytes,
            title,
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(item)))
}

async fn serve_upload(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let blobs = Arc::clone(&state.blobs);
    let lookup = name.clone();
    let bytes = tokio::task::spawn_blocking(move || blobs.read(&lookup))
        .await
        .map_err(Error::from)??;

    let mime = mime_guess::from_path(&name).first_or_octet_stream();
    Ok(([(header::CONTENT_TYPE, mime.to_string())], bytes).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_must_be_positive_integers() {
        assert_eq!(parse_id("7").unwrap(), 7);
        for bad in ["0", "-1", "abc", "", "1.5"] {
            assert!(matches!(parse_id(bad), Err(Error::Validation(_))), "{bad}");
        }
    }

    #[test]
    fn filters_parse_page_category_and_tags() {
        let params = ListParams {
            page: Some("2".into()),
            category: Some("file".into()),
            tags: Some("tax, 2024,,tax".into()),
            q: None,
        };
        let f = params.filters().unwrap();
        assert_eq!(f.page, 2);
        assert_eq!(f.category, Some(Category::File));
        assert_eq!(f.tags, vec!["tax".to_string(), "2024".to_string()]);
    }

    #[test]
    fn blank_filters_are_ignored() {
        let params = ListParams {
            page: Some("".into()),
            category: Some(" ".into()),
            tags: Some("".into()),
            q: None,
        };
        let f = params.filters().unwrap();
        assert_eq!(f.page, 0);
        assert_eq!(f.category, None);
        assert!(f.tags.is_empty());
    }

    #[test]
    fn bad_filters_are_validation_errors() {
        let bad_category = ListParams {
            category: Some("reference".into()),
            ..Default::default()
        };
        assert!(matches!(bad_category.filters(), Err(Error::Validation(_))));

        let bad_page = ListParams {
            page: Some("first".into()),
            ..Default::default()
        };
        assert!(matches!(bad_page.filters(), Err(Error::Validation(_))));
    }

    #[test]
    fn error_statuses() {
        let status = |err: Error| ApiError::from(err).into_response().status();
        assert_eq!(status(Error::validation("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status(Error::item_not_found(1)), StatusCode::NOT_FOUND);
        assert_eq!(
            status(Error::Upstream("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
