use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use health::HealthRegistry;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use tokio::net::TcpListener;
use url::Url;

use rum_capture::replay::{Envelope, MemoryReplayQueue, UploadConfig, UploadWorker};
use rum_capture::retry::RetryPolicy;

mod common;

/// Answers 503 twice, then 200.
async fn flaky_upstream() -> (Url, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counted = hits.clone();
    let app = Router::new().route(
        "/upload",
        post(move || {
            let counted = counted.clone();
            async move {
                if counted.fetch_add(1, Ordering::SeqCst) < 2 {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::OK
                }
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    let url = Url::parse(&format!("http://{addr}/upload")).unwrap();
    (url, hits)
}

fn counters(recorder: &DebuggingRecorder) -> HashMap<String, u64> {
    let mut totals = HashMap::new();
    for (key, _, _, value) in recorder.snapshotter().snapshot().into_vec() {
        if let DebugValue::Counter(n) = value {
            *totals.entry(key.key().name().to_string()).or_default() += n;
        }
    }
    totals
}

#[test]
fn retried_uploads_are_counted_once_delivered() {
    common::setup_tracing();
    let recorder = DebuggingRecorder::new();

    metrics::with_local_recorder(&recorder, || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let (upload_url, hits) = flaky_upstream().await;
            let liveness = HealthRegistry::new("liveness")
                .register("replay_workers", Duration::from_secs(30))
                .await;
            let worker = UploadWorker::new(
                Arc::new(MemoryReplayQueue::default()),
                UploadConfig {
                    upload_url,
                    global_tags: "cluster=test".to_string(),
                    attempts: 3,
                    timeout: Duration::from_secs(5),
                    empty_queue_sleep: Duration::from_millis(10),
                    retry_policy: RetryPolicy::new(
                        2,
                        Duration::from_millis(1),
                        Some(Duration::from_millis(5)),
                    ),
                },
                liveness,
            )
            .unwrap();

            let envelope = Envelope {
                headers: HashMap::from([(
                    "content-type".to_string(),
                    "multipart/form-data; boundary=x".to_string(),
                )]),
                body: b"--x--\r\n".to_vec(),
                form_values: HashMap::new(),
            };
            worker.process(&envelope.encode_record()).await;
            assert_eq!(hits.load(Ordering::SeqCst), 3);
        });
    });

    let totals = counters(&recorder);
    assert_eq!(totals.get("rum_replay_upload_total"), Some(&1));
    assert_eq!(totals.get("rum_replay_upload_failed_total"), Some(&2));
}
