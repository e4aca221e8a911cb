use std::collections::HashSet;
use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr};

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::{Buf, Bytes};
use flate2::read::GzDecoder;
use metrics::counter;
use serde::Deserialize;
use tracing::instrument;

use crate::api::RumError;
use crate::decode::{decode, Encoding, Precision};
use crate::feed::{Category, FeedOptions, INPUT_NAME};
use crate::geo::{client_ip, GeoTags};
use crate::point::Point;
use crate::prometheus::report_rejected_request;
use crate::router;

pub const DEFAULT_MAX_INFLATED_BYTES: usize = 32 * 1024 * 1024;

/// Request-independent settings of the write path.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Empty allows every app
    pub app_id_allow_list: HashSet<String>,
    pub origin_ip_header: String,
    /// Ceiling on a gzip body once decompressed
    pub max_inflated_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            app_id_allow_list: HashSet::new(),
            origin_ip_header: "X-Forwarded-For".to_string(),
            max_inflated_bytes: DEFAULT_MAX_INFLATED_BYTES,
        }
    }
}

impl IngestConfig {
    fn allows(&self, app_id: Option<&str>) -> bool {
        self.app_id_allow_list.is_empty()
            || app_id.is_some_and(|app_id| self.app_id_allow_list.contains(app_id))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RumQuery {
    pub precision: Option<String>,
    pub version: Option<String>,
    pub source: Option<String>,
    pub echo: Option<String>,
}

fn reject(err: RumError) -> RumError {
    report_rejected_request(err.cause());
    err
}

fn inflate(headers: &HeaderMap, body: Bytes, limit: usize) -> Result<Bytes, RumError> {
    let gzipped = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
    if !gzipped {
        return Ok(body);
    }

    let mut inflated = Vec::new();
    GzDecoder::new(body.reader())
        .take(limit as u64 + 1)
        .read_to_end(&mut inflated)
        .map_err(|e| {
            tracing::error!("failed to decode gzip: {}", e);
            RumError::RequestDecodingError(String::from("invalid gzip data"))
        })?;
    if inflated.len() > limit {
        return Err(RumError::InflatedTooLarge(limit));
    }
    Ok(inflated.into())
}

/// Decodes a batch of RUM points, enriches and feeds them downstream.
#[instrument(
    skip_all,
    fields(content_type, content_encoding, version, precision, batch_size)
)]
pub async fn write(
    State(state): State<router::State>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Query(query): Query<RumQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RumError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let content_encoding = headers
        .get(header::CONTENT_ENCODING)
        .map_or("unknown", |v| v.to_str().unwrap_or("unknown"));
    tracing::Span::current().record("content_type", content_type.unwrap_or("unknown"));
    tracing::Span::current().record("content_encoding", content_encoding);
    tracing::Span::current().record("version", query.version.as_deref().unwrap_or_default());

    let encoding = Encoding::from_content_type(content_type);
    let body = inflate(&headers, body, state.ingest.max_inflated_bytes).map_err(reject)?;
    if body.is_empty() {
        return Err(reject(RumError::EmptyBody));
    }

    let precision = match query.precision.as_deref() {
        None | Some("") => Precision::default(),
        Some(raw) => raw.parse().map_err(|e| reject(RumError::Decode(e)))?,
    };
    tracing::Span::current().record("precision", query.precision.as_deref().unwrap_or("n"));

    let now = state.timesource.current_time_nanos();
    let mut points = decode(&body, encoding, precision, now).map_err(|e| reject(e.into()))?;
    tracing::Span::current().record("batch_size", points.len());
    if points.is_empty() {
        return Err(reject(RumError::NoPoints));
    }

    if let Some(denied) = points
        .iter()
        .find(|point| !state.ingest.allows(point.tag("app_id")))
    {
        let app_id = denied.tag("app_id").unwrap_or_default().to_string();
        return Err(reject(RumError::AppIdNotAllowed(app_id)));
    }

    let remote = connect_info
        .map(|ConnectInfo(addr)| addr)
        .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
    let client = client_ip(&headers, &state.ingest.origin_ip_header, remote);
    let geo = GeoTags::resolve(state.enricher.geo(), &client);

    for point in points.iter_mut() {
        counter!(
            "rum_points_received_total",
            "measurement" => point.measurement().as_str()
        )
        .increment(1);
        geo.apply(point);
        state.enricher.enrich(point).await;
    }

    let echoed = query.echo.is_some().then(|| echo(&points));
    let opts = FeedOptions {
        version: query.version,
        pipeline_source: query.source,
    };
    state
        .feeder
        .feed(INPUT_NAME, Category::Rum, points, opts)
        .await
        .map_err(|e| reject(RumError::FeedFailed(e.to_string())))?;

    Ok(match echoed {
        Some(points) => (StatusCode::OK, Json(points)).into_response(),
        None => StatusCode::OK.into_response(),
    })
}

fn echo(points: &[Point]) -> serde_json::Value {
    serde_json::to_value(points).unwrap_or_default()
}
