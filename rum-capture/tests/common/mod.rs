#![allow(dead_code)]

use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use health::HealthRegistry;
use zip::write::SimpleFileOptions;

use rum_capture::cdn::{CdnError, CdnResolver, CnameLookup, ProviderTable};
use rum_capture::enrich::Enricher;
use rum_capture::feed::{Category, FeedError, FeedOptions, Feeder};
use rum_capture::ingest::{IngestConfig, DEFAULT_MAX_INFLATED_BYTES};
use rum_capture::point::Point;
use rum_capture::replay::ReplayIngest;
use rum_capture::router::{router, RouterParts};
use rum_capture::sourcemap::handlers::SourceMapState;
use rum_capture::sourcemap::tools::ToolPaths;
use rum_capture::sourcemap::{SourceMapConfig, SourceMapStore};
use rum_capture::time::FixedTime;

pub const RUM_ENDPOINT: &str = "/v1/write/rum";
pub const REPLAY_ENDPOINT: &str = "/v1/write/rum/replay";
pub const UPLOAD_TOKEN: &str = "s3cr3t";

/// Maps `bundle.js:1:821` to `webpack:///./src/index.js:17:4`.
pub const BUNDLE_MAP: &str = r#"{"version":3,"file":"bundle.js","sources":["webpack:///./src/index.js"],"names":[],"mappings":"qzBAgBI"}"#;

static TRACING_INIT: Once = Once::new();
pub fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .init()
    });
}

#[derive(Clone, Default)]
pub struct MemoryFeeder {
    points: Arc<Mutex<Vec<Point>>>,
}

impl MemoryFeeder {
    pub fn len(&self) -> usize {
        self.points.lock().unwrap().len()
    }

    pub fn points(&self) -> Vec<Point> {
        self.points.lock().unwrap().clone()
    }
}

#[async_trait]
impl Feeder for MemoryFeeder {
    async fn feed(
        &self,
        _input: &str,
        _category: Category,
        points: Vec<Point>,
        _opts: FeedOptions,
    ) -> Result<(), FeedError> {
        self.points.lock().unwrap().extend(points);
        Ok(())
    }
}

/// Every domain is served by itself, nothing goes to the network.
struct NoCname;

#[async_trait]
impl CnameLookup for NoCname {
    async fn lookup_cname(&self, domain: &str) -> Result<String, CdnError> {
        Ok(domain.to_string())
    }
}

pub fn store(data_dir: &Path) -> Arc<SourceMapStore> {
    Arc::new(SourceMapStore::new(SourceMapConfig {
        data_dir: data_dir.to_path_buf(),
        web_stale_after: Duration::from_secs(300),
        tool_concurrency: 4,
        tool_timeout: Duration::from_secs(30),
        tools: ToolPaths::default(),
    }))
}

pub struct TestApp {
    pub allow_list: Vec<&'static str>,
    pub replay: Option<Arc<ReplayIngest>>,
    pub max_inflated_bytes: usize,
}

impl TestApp {
    pub fn open() -> Self {
        Self {
            allow_list: Vec::new(),
            replay: None,
            max_inflated_bytes: DEFAULT_MAX_INFLATED_BYTES,
        }
    }

    pub fn build(self, data_dir: &Path, feeder: MemoryFeeder) -> Router {
        let store = store(data_dir);
        let cdn = CdnResolver::new(
            Box::new(NoCname),
            ProviderTable::builtin().unwrap(),
            16,
            Duration::from_secs(60),
        );
        let parts = RouterParts {
            rum_endpoints: vec![RUM_ENDPOINT.to_string()],
            ingest: IngestConfig {
                app_id_allow_list: self
                    .allow_list
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<HashSet<String>>(),
                origin_ip_header: "X-Forwarded-For".to_string(),
                max_inflated_bytes: self.max_inflated_bytes,
            },
            enricher: Arc::new(Enricher::new(None, Arc::new(cdn), store.clone())),
            sourcemaps: SourceMapState {
                store,
                upload_token: Some(UPLOAD_TOKEN.to_string()),
            },
            replay: self
                .replay
                .map(|ingest| (vec![REPLAY_ENDPOINT.to_string()], ingest)),
            liveness: HealthRegistry::new("liveness"),
        };
        router(FixedTime { nanos: 1_700_000_000_000_000_000 }, feeder, parts, false)
    }
}

/// Writes a zip holding the given `(name, body)` entries.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, body) in entries {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(body).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut file = File::create(path).unwrap();
    file.write_all(&zip_bytes(entries)).unwrap();
}

/// A multipart body with text fields and one file part.
pub fn multipart(
    boundary: &str,
    fields: &[(&str, &str)],
    file: Option<(&str, &[u8])>,
) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some((name, content)) = file {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{name}.bin\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}
