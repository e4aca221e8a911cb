use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use bytes::Bytes;
use metrics::counter;
use tracing::{instrument, warn};

use super::envelope::{Envelope, FormValues, ReplayLabels};
use super::filter::ReplayFilter;
use super::queue::ReplayQueue;
use crate::api::RumError;
use crate::prometheus::report_rejected_request;

/// Accepts replay uploads and parks them in the queue.
pub struct ReplayIngest {
    pub queue: Arc<dyn ReplayQueue + Send + Sync>,
    pub filter: ReplayFilter,
    pub max_body_bytes: usize,
}

fn reject(err: RumError) -> RumError {
    report_rejected_request(err.cause());
    err
}

/// Reads the text fields of a multipart body, file parts are skipped.
async fn form_values(
    content_type: &str,
    body: Bytes,
) -> Result<HashMap<String, FormValues>, RumError> {
    let boundary = multer::parse_boundary(content_type)
        .map_err(|e| RumError::InvalidMultipart(e.to_string()))?;
    let stream = futures::stream::once(async move { Ok::<_, Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut values: HashMap<String, FormValues> = HashMap::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RumError::InvalidMultipart(e.to_string()))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        if field.file_name().is_some() {
            continue;
        }
        let text = field
            .text()
            .await
            .map_err(|e| RumError::InvalidMultipart(e.to_string()))?;
        values.entry(name).or_default().values.push(text);
    }
    Ok(values)
}

/// Keys the filter sees: form fields, then lower-cased headers.
fn filter_view(envelope: &Envelope) -> HashMap<String, String> {
    let mut view: HashMap<String, String> = envelope
        .form_values
        .iter()
        .filter_map(|(key, values)| Some((key.clone(), values.values.first()?.clone())))
        .collect();
    for (name, value) in &envelope.headers {
        view.entry(name.clone()).or_insert_with(|| value.clone());
    }
    view
}

#[instrument(skip_all, fields(app_id, env, version, service, body_size))]
pub async fn upload(
    State(ingest): State<Arc<ReplayIngest>>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, RumError> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > ingest.max_body_bytes) {
        return Err(reject(RumError::BodyTooLarge(ingest.max_body_bytes)));
    }
    let body = axum::body::to_bytes(body, ingest.max_body_bytes)
        .await
        .map_err(|_| reject(RumError::BodyTooLarge(ingest.max_body_bytes)))?;
    tracing::Span::current().record("body_size", body.len());

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let form_values = form_values(content_type, body.clone())
        .await
        .map_err(reject)?;

    let envelope = Envelope {
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                Some((name.as_str().to_ascii_lowercase(), value.to_str().ok()?.to_string()))
            })
            .collect(),
        body: body.to_vec(),
        form_values,
    };

    let labels = ReplayLabels::of(&envelope);
    tracing::Span::current().record("app_id", labels.app_id.as_str());
    tracing::Span::current().record("env", labels.env.as_str());
    tracing::Span::current().record("version", labels.version.as_str());
    tracing::Span::current().record("service", labels.service.as_str());

    if ingest.filter.matches(&filter_view(&envelope)) {
        let labels = labels.labels();
        counter!("rum_replay_dropped_total", &labels).increment(1);
        counter!("rum_replay_dropped_bytes_total", &labels).increment(body.len() as u64);
        return Ok(StatusCode::ACCEPTED);
    }

    // text fields are carried twice, once in the body and once parsed
    let record = envelope.encode_record();
    if record.len() > ingest.max_body_bytes {
        return Err(reject(RumError::BodyTooLarge(ingest.max_body_bytes)));
    }

    if let Err(e) = ingest.queue.put(record).await {
        warn!("failed to enqueue replay upload: {}", e);
        counter!("rum_replay_enqueue_failed_total").increment(1);
        return Err(reject(RumError::EnqueueFailed(e.to_string())));
    }
    counter!("rum_replay_enqueued_total").increment(1);

    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &str = "X-BOUNDARY";

    fn multipart(fields: &[(&str, &str)], file: &[u8]) -> Bytes {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"segment\"; filename=\"blob\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(file);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body.into()
    }

    #[tokio::test]
    async fn reads_text_fields_only() {
        let body = multipart(&[("app_id", "app_a"), ("tag", "a"), ("tag", "b")], b"\x00\x01");
        let values = form_values(&format!("multipart/form-data; boundary={BOUNDARY}"), body)
            .await
            .unwrap();

        assert_eq!(values["app_id"].values, vec!["app_a"]);
        assert_eq!(values["tag"].values, vec!["a", "b"]);
        assert!(!values.contains_key("segment"));
    }

    #[tokio::test]
    async fn refuses_non_multipart() {
        let err = form_values("application/json", Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "replay.invalid_multipart");
    }

    #[test]
    fn form_values_shadow_headers() {
        let envelope = Envelope {
            headers: HashMap::from([
                ("env".to_string(), "header".to_string()),
                ("user-agent".to_string(), "curl".to_string()),
            ]),
            body: Vec::new(),
            form_values: HashMap::from([(
                "env".to_string(),
                FormValues {
                    values: vec!["form".to_string()],
                },
            )]),
        };
        let view = filter_view(&envelope);
        assert_eq!(view["env"], "form");
        assert_eq!(view["user-agent"], "curl");
    }
}
