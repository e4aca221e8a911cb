use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use super::{Platform, SourceMapStore};
use crate::api::{SourcemapCheck, SourcemapResponse};
use crate::point::{FieldValue, Measurement, Point};

pub const MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Clone)]
pub struct SourceMapState {
    pub store: Arc<SourceMapStore>,
    pub upload_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SourcemapQuery {
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub env: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub error_stack: String,
    pub error_type: Option<String>,
}

fn check_token(expected: Option<&str>, token: &str) -> Result<(), String> {
    match expected {
        None => Err("invalid token: upload token is not set".to_string()),
        Some(expected) if expected != token => {
            Err("invalid token: token is missing or not correct".to_string())
        }
        Some(_) => Ok(()),
    }
}

/// Validates the parts shared by upload and delete.
fn target(state: &SourceMapState, query: &SourcemapQuery) -> Result<Platform, String> {
    check_token(state.upload_token.as_deref(), &query.token)?;
    if query.app_id.is_empty() {
        return Err("app_id not found".to_string());
    }
    if query.platform.is_empty() {
        return Ok(Platform::Web);
    }
    query.platform.parse().map_err(|e: super::SourceMapError| e.to_string())
}

/// Resolves `error_stack` as if an SDK of `platform` had sent it.
#[instrument(skip_all, fields(platform, app_id))]
pub async fn check(
    State(state): State<SourceMapState>,
    Query(query): Query<SourcemapQuery>,
) -> Json<SourcemapResponse<SourcemapCheck>> {
    let platform = query.platform.parse::<Platform>().unwrap_or(Platform::Web);
    tracing::Span::current().record("platform", platform.as_str());
    tracing::Span::current().record("app_id", query.app_id.as_str());

    let mut tags = BTreeMap::new();
    tags.insert("app_id".to_string(), query.app_id.clone());
    tags.insert("env".to_string(), query.env.clone());
    tags.insert("version".to_string(), query.version.clone());
    if let Some(error_type) = &query.error_type {
        tags.insert("error_type".to_string(), error_type.clone());
    }
    let mut fields = BTreeMap::new();
    fields.insert(
        "error_stack".to_string(),
        FieldValue::from(query.error_stack.as_str()),
    );
    let point = match Point::new(Measurement::Error, tags, fields, 0) {
        Ok(point) => point,
        Err(e) => return Json(SourcemapResponse::err(e.to_string())),
    };

    let resolution = state.store.resolve(platform.sdk_name(), &point).await;
    let content = SourcemapCheck {
        error_stack: resolution.source.unwrap_or_default(),
        original_error_stack: query.error_stack,
    };
    Json(SourcemapResponse {
        content: Some(content),
        success: resolution.reason.is_none(),
        error_msg: resolution.reason.unwrap_or_default(),
    })
}

async fn read_archive_field(headers: &HeaderMap, body: Body) -> Result<Bytes, String> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let boundary = multer::parse_boundary(content_type).map_err(|e| e.to_string())?;
    let constraints = multer::Constraints::new()
        .size_limit(multer::SizeLimit::new().whole_stream(MAX_UPLOAD_BYTES));
    let mut multipart =
        multer::Multipart::with_constraints(body.into_data_stream(), boundary, constraints);

    while let Some(field) = multipart.next_field().await.map_err(|e| e.to_string())? {
        if field.name() == Some("file") {
            return field.bytes().await.map_err(|e| e.to_string());
        }
    }
    Err("request has no file field".to_string())
}

/// Stores an uploaded archive under the platform dir.
#[instrument(skip_all, fields(platform, app_id))]
pub async fn upload(
    State(state): State<SourceMapState>,
    Query(query): Query<SourcemapQuery>,
    headers: HeaderMap,
    body: Body,
) -> Json<SourcemapResponse<String>> {
    let platform = match target(&state, &query) {
        Ok(platform) => platform,
        Err(msg) => return Json(SourcemapResponse::err(msg)),
    };
    tracing::Span::current().record("platform", platform.as_str());
    tracing::Span::current().record("app_id", query.app_id.as_str());

    let archive = match read_archive_field(&headers, body).await {
        Ok(archive) => archive,
        Err(msg) => return Json(SourcemapResponse::err(msg)),
    };

    let store = Arc::clone(&state.store);
    let stored = tokio::task::spawn_blocking(move || {
        store.store_archive(platform, &query.app_id, &query.env, &query.version, &archive)
    })
    .await;

    match stored {
        Ok(Ok(path)) => {
            info!("source map archive uploaded to {}", path.display());
            Json(SourcemapResponse::ok(format!(
                "uploaded to [{}]!",
                path.display()
            )))
        }
        Ok(Err(e)) => {
            warn!("source map upload failed: {}", e);
            Json(SourcemapResponse::err(format!("write sourcemap file failed: {e}")))
        }
        Err(e) => Json(SourcemapResponse::err(e.to_string())),
    }
}

/// Removes an archive, its extraction and its cached maps.
#[instrument(skip_all, fields(platform, app_id))]
pub async fn delete(
    State(state): State<SourceMapState>,
    Query(query): Query<SourcemapQuery>,
) -> Json<SourcemapResponse<String>> {
    let platform = match target(&state, &query) {
        Ok(platform) => platform,
        Err(msg) => return Json(SourcemapResponse::err(msg)),
    };
    tracing::Span::current().record("platform", platform.as_str());
    tracing::Span::current().record("app_id", query.app_id.as_str());

    let store = Arc::clone(&state.store);
    let deleted = tokio::task::spawn_blocking(move || {
        store.delete_archive(platform, &query.app_id, &query.env, &query.version)
    })
    .await;

    match deleted {
        Ok(Ok(path)) => {
            info!("source map archive {} deleted", path.display());
            Json(SourcemapResponse::ok(format!("deleted [{}]!", path.display())))
        }
        Ok(Err(e)) => Json(SourcemapResponse::err(format!(
            "delete sourcemap file failed: {e}"
        ))),
        Err(e) => Json(SourcemapResponse::err(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens() {
        assert!(check_token(None, "x").unwrap_err().contains("not set"));
        assert!(check_token(Some("secret"), "").is_err());
        assert!(check_token(Some("secret"), "secret").is_ok());
    }
}
