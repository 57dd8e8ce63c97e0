//! HTTP handlers for the OpenTSDB-compatible API
//!
//! Validation failures return 400 with a message; unexpected failures return
//! 500 carrying an opaque correlation code that is also attached to the
//! logged error. Query responses stream series as they are produced; a client
//! disconnect drops the body, closes the channel, and cancels the pipeline.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use self::bytes_stream::once_bytes;
use chrono::Utc;
use futures::StreamExt;
use sqlx::postgres::PgPool;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

use tsgate::cache::TagsetCache;
use tsgate::config::Config;
use tsgate::error::{IngestError, QueryError};
use tsgate::filter::{QueryFilter, TagPredicate};
use tsgate::ingest::{Ingestor, WriteStats};
use tsgate::query::{LastPoint, QueryEngine, QueryRange, SubQuery};
use tsgate::types::{datetime_from_epoch, DataPoint, Tagset};

use super::types::*;

// =============================================================================
// Application state
// =============================================================================

/// Shared application state
pub struct AppState {
    /// Gateway configuration
    pub config: Config,
    /// Connection pool (health checks)
    pub pool: PgPool,
    /// Tagset cache (suggest, health)
    pub cache: Arc<TagsetCache>,
    /// Ingest pipeline
    pub ingestor: Arc<Ingestor>,
    /// Query pipeline
    pub engine: Arc<QueryEngine>,
}

// =============================================================================
// Errors
// =============================================================================

/// HTTP-mapped handler error
pub enum ApiError {
    /// Client-side validation failure
    BadRequest(String),
    /// Server failure, reported by correlation code only
    Internal(String),
}

impl ApiError {
    /// Log a server failure and mint its correlation code
    fn internal(method: &str, path: &str, err: &dyn std::fmt::Display) -> Self {
        let code = correlation_code();
        error!(code = %code, method, path, error = %err, "Request failed");
        Self::Internal(code)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": message })),
            )
                .into_response(),
            Self::Internal(code) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "internal server error", "code": code })),
            )
                .into_response(),
        }
    }
}

fn correlation_code() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

// =============================================================================
// Write handler
// =============================================================================

/// `POST /api/put`
pub async fn put(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PutBody>,
) -> Result<Json<WriteStats>, ApiError> {
    let mut points = Vec::new();
    for dto in body.into_points() {
        let time = datetime_from_epoch(dto.timestamp).ok_or_else(|| {
            ApiError::BadRequest(format!("bad timestamp {} for '{}'", dto.timestamp, dto.metric))
        })?;
        points.push(DataPoint {
            metric: dto.metric,
            time,
            value: dto.value,
            tags: Tagset::new(dto.tags),
        });
    }

    match state.ingestor.write(&points).await {
        Ok(stats) => Ok(Json(stats)),
        Err(IngestError::Validation(message)) => Err(ApiError::BadRequest(message)),
        Err(e) => Err(ApiError::internal("POST", "/api/put", &e)),
    }
}

// =============================================================================
// Query handlers
// =============================================================================

/// `POST /api/query`
pub async fn query(
    State(state): State<Arc<AppState>>,
    Json(dto): Json<QueryDto>,
) -> Result<Response, ApiError> {
    let now = Utc::now();
    let start = dto.start.resolve(now).map_err(client_error)?;
    let end = match &dto.end {
        Some(spec) => spec.resolve(now).map_err(client_error)?,
        None => now,
    };
    if start >= end {
        return Err(ApiError::BadRequest("start must precede end".to_string()));
    }
    let range = QueryRange { start, end };

    let subqueries: Vec<SubQuery> = dto
        .queries
        .into_iter()
        .map(build_subquery)
        .collect::<Result<_, _>>()
        .map_err(client_error)?;
    if subqueries.is_empty() {
        return Err(ApiError::BadRequest("no queries given".to_string()));
    }

    let (tx, rx) = mpsc::channel(16);
    let engine = state.engine.clone();
    tokio::spawn(async move {
        log_stream_outcome("/api/query", engine.run(range, subqueries, tx).await);
    });

    stream_json_array("/api/query", rx, QueryResultDto::from)
}

/// `POST /api/query/last`
pub async fn query_last(
    State(state): State<Arc<AppState>>,
    Json(dto): Json<LastQueryDto>,
) -> Result<Response, ApiError> {
    let mut queries = Vec::with_capacity(dto.queries.len());
    for part in dto.queries {
        let filters = inline_filters(&part.tags).map_err(client_error)?;
        queries.push((part.metric, filters));
    }

    let (tx, rx) = mpsc::channel(16);
    let engine = state.engine.clone();
    tokio::spawn(async move {
        log_stream_outcome("/api/query/last", engine.run_last(queries, tx).await);
    });

    stream_json_array("/api/query/last", rx, |point: LastPoint| LastQueryResultDto {
        metric: point.metric,
        tags: point.tags,
        timestamp: point.timestamp_ms,
        value: point.value,
    })
}

/// Stream a channel of results as one JSON array, element by element
///
/// Dropping the response body closes the channel, which cancels the
/// producing pipeline at its next row.
fn stream_json_array<T, D, F>(
    path: &'static str,
    rx: mpsc::Receiver<T>,
    mut to_dto: F,
) -> Result<Response, ApiError>
where
    T: Send + 'static,
    D: serde::Serialize,
    F: FnMut(T) -> D + Send + 'static,
{
    let items = ReceiverStream::new(rx).enumerate().map(move |(i, item)| {
        let json = serde_json::to_string(&to_dto(item)).unwrap_or_else(|_| "null".to_string());
        let chunk = if i == 0 { json } else { format!(",{}", json) };
        Ok::<_, std::convert::Infallible>(axum::body::Bytes::from(chunk))
    });
    let body = Body::from_stream(once_bytes("[").chain(items).chain(once_bytes("]")));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)
        .map_err(|e| ApiError::internal("POST", path, &e))
}

/// Log how a spawned result stream ended
fn log_stream_outcome(path: &'static str, result: Result<(), QueryError>) {
    match result {
        Ok(()) => {}
        Err(QueryError::Canceled) => debug!(path, "Query client went away"),
        Err(e) => {
            let code = correlation_code();
            error!(code = %code, method = "POST", path, error = %e, "Result stream aborted");
        }
    }
}

/// `POST /api/search/lookup`
pub async fn search_lookup(
    State(state): State<Arc<AppState>>,
    Json(dto): Json<LookupRequestDto>,
) -> Result<Json<LookupResponseDto>, ApiError> {
    let pairs: Vec<(String, String)> = dto
        .tags
        .into_iter()
        .map(|t| (t.key, t.value))
        .collect();
    let limit = dto.limit.unwrap_or_else(default_suggest_max);

    let (entries, total_results) = state
        .engine
        .lookup(&dto.metric, &pairs, limit)
        .map_err(client_error)?;

    Ok(Json(LookupResponseDto {
        kind: "LOOKUP",
        metric: dto.metric,
        results: entries
            .into_iter()
            .map(|e| LookupResultDto {
                metric: e.metric,
                tags: e.tags,
            })
            .collect(),
        total_results,
    }))
}

// =============================================================================
// Suggest handlers
// =============================================================================

/// `GET /api/suggest?type=metrics|tagk|tagv&q=&max=`
pub async fn suggest(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SuggestParams>,
) -> Result<Json<Vec<String>>, ApiError> {
    let store = state.cache.store();
    let suggestions = match params.kind.as_str() {
        "metrics" => store.metric_names(&params.q, params.max),
        "tagk" => store.tag_keys(&params.q, params.max),
        "tagv" => store.tag_values(&params.q, params.max),
        other => {
            return Err(ApiError::BadRequest(format!(
                "unknown suggest type '{}'",
                other
            )))
        }
    };
    Ok(Json(suggestions))
}

/// `GET /api/suggest/tagKeys/{metric}`
pub async fn suggest_tag_keys(
    State(state): State<Arc<AppState>>,
    Path(metric): Path<String>,
) -> Json<Vec<String>> {
    Json(state.cache.store().tag_keys_for_metric(&metric))
}

/// `GET /api/suggest/tagValues/{tagKey}`
pub async fn suggest_tag_values(
    State(state): State<Arc<AppState>>,
    Path(tag_key): Path<String>,
) -> Json<Vec<String>> {
    Json(state.cache.store().tag_values_for_key(&tag_key))
}

// =============================================================================
// Health handler
// =============================================================================

/// `GET /api/health`
///
/// 503 when the tagset cache has not refreshed for twice its interval.
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let max_age = state.config.tagset_cache_update_interval() * 2;
    if state.cache.is_fresh(max_age) {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "tagset cache stale").into_response()
    }
}

// =============================================================================
// Request normalization
// =============================================================================

fn client_error(e: QueryError) -> ApiError {
    if e.is_client_error() {
        ApiError::BadRequest(e.to_string())
    } else {
        ApiError::internal("-", "-", &e)
    }
}

/// Inline tags become group-by filters with syntax-inferred kinds
fn inline_filters(
    tags: &std::collections::BTreeMap<String, String>,
) -> Result<Vec<QueryFilter>, QueryError> {
    tags.iter()
        .map(|(key, value)| {
            Ok(QueryFilter::new(
                key.clone(),
                TagPredicate::from_tag_value(value)?,
                true,
            ))
        })
        .collect()
}

fn build_subquery(part: QueryPartDto) -> Result<SubQuery, QueryError> {
    let mut filters = inline_filters(&part.tags)?;
    for f in &part.filters {
        filters.push(QueryFilter::new(
            f.tagk.clone(),
            TagPredicate::parse(&f.kind, &f.filter)?,
            f.group_by,
        ));
    }

    let aggregator = match part.aggregator.as_deref() {
        None | Some("none") => None,
        Some(name) => Some(name.parse()?),
    };
    let downsample = part.downsample.as_deref().map(str::parse).transpose()?;

    Ok(SubQuery {
        metric: part.metric,
        aggregator,
        downsample,
        rate: part.rate,
        rate_options: part
            .rate_options
            .map(|o| o.into_options())
            .unwrap_or_default(),
        filters,
        explicit_tags: part.explicit_tags,
    })
}

/// Tiny helper: a one-chunk byte stream
mod bytes_stream {
    use axum::body::Bytes;
    use futures::stream::{once, Once};
    use std::convert::Infallible;
    use std::future::{ready, Ready};

    pub fn once_bytes(
        chunk: &'static str,
    ) -> Once<Ready<Result<Bytes, Infallible>>> {
        once(ready(Ok(Bytes::from_static(chunk.as_bytes()))))
    }
}
