use axum::http::StatusCode;
use axum_test_helper::TestClient;
use url::form_urlencoded;

use rum_capture::api::{SourcemapCheck, SourcemapResponse};
use rum_capture::sourcemap::archive_name;

mod common;
use common::*;

const BOUNDARY: &str = "sourcemap-boundary";
const STACK: &str = "Error: boom\n  at onClick @ http://localhost/static/bundle.js:1:821";

fn query(pairs: &[(&str, &str)]) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

#[tokio::test]
async fn upload_check_then_delete() {
    setup_tracing();
    let dir = tempfile::tempdir().unwrap();
    let client = TestClient::new(TestApp::open().build(dir.path(), MemoryFeeder::default())).await;
    let target = [
        ("platform", "web"),
        ("app_id", "app"),
        ("env", "prod"),
        ("version", "1.0.0"),
        ("token", UPLOAD_TOKEN),
    ];

    let archive = zip_bytes(&[("static/bundle.js.map", BUNDLE_MAP.as_bytes())]);
    let res = client
        .put(&format!("/v1/sourcemap?{}", query(&target)))
        .header("Content-Type", &format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(multipart(BOUNDARY, &[], Some(("file", archive.as_slice()))))
        .send()
        .await;
    assert_eq!(StatusCode::OK, res.status());
    let uploaded: SourcemapResponse<String> = res.json().await;
    assert!(uploaded.success, "{}", uploaded.error_msg);
    let stored = dir
        .path()
        .join("web")
        .join(archive_name("app", "prod", "1.0.0"));
    assert!(stored.exists());

    let res = client
        .get(&format!(
            "/v1/sourcemap/check?{}",
            query(&[
                ("app_id", "app"),
                ("env", "prod"),
                ("version", "1.0.0"),
                ("error_stack", STACK),
            ])
        ))
        .send()
        .await;
    assert_eq!(StatusCode::OK, res.status());
    let checked: SourcemapResponse<SourcemapCheck> = res.json().await;
    assert!(checked.success, "{}", checked.error_msg);
    let content = checked.content.unwrap();
    assert_eq!(content.original_error_stack, STACK);
    assert_eq!(
        content.error_stack,
        "Error: boom\n  at onClick @ webpack:///./src/index.js:17:4"
    );

    let res = client
        .delete(&format!("/v1/sourcemap?{}", query(&target)))
        .send()
        .await;
    assert_eq!(StatusCode::OK, res.status());
    let deleted: SourcemapResponse<String> = res.json().await;
    assert!(deleted.success, "{}", deleted.error_msg);
    assert!(!stored.exists());
}

#[tokio::test]
async fn uploads_need_the_token() {
    setup_tracing();
    let dir = tempfile::tempdir().unwrap();
    let client = TestClient::new(TestApp::open().build(dir.path(), MemoryFeeder::default())).await;

    let archive = zip_bytes(&[("bundle.js.map", BUNDLE_MAP.as_bytes())]);
    let res = client
        .put(&format!(
            "/v1/sourcemap?{}",
            query(&[("app_id", "app"), ("token", "wrong")])
        ))
        .header("Content-Type", &format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(multipart(BOUNDARY, &[], Some(("file", archive.as_slice()))))
        .send()
        .await;
    assert_eq!(StatusCode::OK, res.status());
    let refused: SourcemapResponse<String> = res.json().await;
    assert!(!refused.success);
    assert!(refused.error_msg.contains("token"));
    assert!(!dir.path().join("web").join(archive_name("app", "", "")).exists());
}

#[tokio::test]
async fn check_reports_missing_archives() {
    setup_tracing();
    let dir = tempfile::tempdir().unwrap();
    let client = TestClient::new(TestApp::open().build(dir.path(), MemoryFeeder::default())).await;

    let res = client
        .get(&format!(
            "/v1/sourcemap/check?{}",
            query(&[("app_id", "nope"), ("error_stack", STACK)])
        ))
        .send()
        .await;
    let checked: SourcemapResponse<SourcemapCheck> = res.json().await;
    assert!(!checked.success);
    assert!(checked.error_msg.contains("not exists"));
}
