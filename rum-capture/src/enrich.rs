use std::sync::Arc;

use base64::Engine;
use geoip::GeoLookup;
use tracing::debug;

use crate::cdn::{is_domain_name, CdnResolver};
use crate::point::{Enrichment, Point};
use crate::sourcemap::{Platform, ResolveStatus, SourceMapStore, SOURCE_FIELD};

const UNKNOWN: &str = "unknown";

/// Per-point enrichment. Every step is best effort: failures are logged and
/// counted by the component that failed, the point goes on unchanged.
pub struct Enricher {
    geo: Option<Arc<dyn GeoLookup + Send + Sync>>,
    cdn: Arc<CdnResolver>,
    sourcemaps: Arc<SourceMapStore>,
}

impl Enricher {
    pub fn new(
        geo: Option<Arc<dyn GeoLookup + Send + Sync>>,
        cdn: Arc<CdnResolver>,
        sourcemaps: Arc<SourceMapStore>,
    ) -> Self {
        Self {
            geo,
            cdn,
            sourcemaps,
        }
    }

    pub fn geo(&self) -> Option<&(dyn GeoLookup + Send + Sync)> {
        self.geo.as_deref()
    }

    pub async fn enrich(&self, point: &mut Point) {
        for step in point.measurement().enrichments() {
            match step {
                Enrichment::SourceMap => self.resolve_source_map(point).await,
                Enrichment::Provider => self.resolve_provider(point).await,
            }
        }
    }

    async fn resolve_source_map(&self, point: &mut Point) {
        let sdk_name = point
            .tag("sdk_name")
            .unwrap_or(Platform::Web.sdk_name())
            .to_string();
        let resolution = self.sourcemaps.resolve(&sdk_name, point).await;

        match (resolution.status, resolution.source) {
            (ResolveStatus::Ok, Some(source)) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(source);
                point.add_field(SOURCE_FIELD, encoded);
            }
            (status, _) => debug!(
                "source map not applied ({}): {}",
                status.as_str(),
                resolution.reason.unwrap_or_default()
            ),
        }
    }

    async fn resolve_provider(&self, point: &mut Point) {
        let mut provider_type = UNKNOWN;
        let mut provider_name = UNKNOWN.to_string();

        if let Some(domain) = point
            .tag("resource_url_host")
            .filter(|host| is_domain_name(host))
            .map(str::to_string)
        {
            if let Ok(resolved) = self.cdn.resolve(&domain).await {
                if !resolved.cname.is_empty() {
                    provider_type = if resolved.cname == domain {
                        "first-party"
                    } else {
                        "CDN"
                    };
                }
                if let Some(name) = resolved.cdn_name {
                    provider_name = name;
                }
            }
        }

        point.add_field("provider_type", provider_type);
        point.add_field("provider_name", provider_name);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::cdn::{CdnError, CnameLookup, ProviderTable};
    use crate::point::{FieldValue, Measurement};
    use crate::sourcemap::tools::ToolPaths;
    use crate::sourcemap::SourceMapConfig;

    struct StaticCname;

    #[async_trait]
    impl CnameLookup for StaticCname {
        async fn lookup_cname(&self, domain: &str) -> Result<String, CdnError> {
            match domain {
                "static.example.com" => Ok("static.example.com.w.kunlunsl.com".to_string()),
                "www.example.com" => Ok("www.example.com".to_string()),
                _ => Err(CdnError::Dns {
                    domain: domain.to_string(),
                    reason: "NXDOMAIN".to_string(),
                }),
            }
        }
    }

    fn enricher(dir: &std::path::Path) -> Enricher {
        let cdn = CdnResolver::new(
            Box::new(StaticCname),
            ProviderTable::builtin().unwrap(),
            16,
            Duration::from_secs(60),
        );
        let sourcemaps = SourceMapStore::new(SourceMapConfig {
            data_dir: dir.to_path_buf(),
            web_stale_after: Duration::from_secs(300),
            tool_concurrency: 16,
            tool_timeout: Duration::from_secs(30),
            tools: ToolPaths::default(),
        });
        Enricher::new(None, Arc::new(cdn), Arc::new(sourcemaps))
    }

    fn resource(host: &str) -> Point {
        let mut tags = BTreeMap::new();
        tags.insert("resource_url_host".to_string(), host.to_string());
        let mut fields = BTreeMap::new();
        fields.insert("duration".to_string(), FieldValue::Int(12));
        Point::new(Measurement::Resource, tags, fields, 1).unwrap()
    }

    fn provider(point: &Point) -> (String, String) {
        (
            point.field("provider_type").unwrap().to_string(),
            point.field("provider_name").unwrap().to_string(),
        )
    }

    #[tokio::test]
    async fn resources_get_providers() {
        let dir = tempfile::tempdir().unwrap();
        let enricher = enricher(dir.path());

        let mut point = resource("static.example.com");
        enricher.enrich(&mut point).await;
        let (kind, name) = provider(&point);
        assert_eq!(kind, "CDN");
        assert_ne!(name, "unknown");

        let mut point = resource("www.example.com");
        enricher.enrich(&mut point).await;
        assert_eq!(provider(&point), ("first-party".to_string(), "unknown".to_string()));

        for host in ["missing.example.com", "not a domain"] {
            let mut point = resource(host);
            enricher.enrich(&mut point).await;
            assert_eq!(provider(&point), ("unknown".to_string(), "unknown".to_string()));
        }
    }

    #[tokio::test]
    async fn other_measurements_are_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let enricher = enricher(dir.path());

        let mut fields = BTreeMap::new();
        fields.insert("view_load".to_string(), FieldValue::Int(3));
        let mut point = Point::new(Measurement::View, BTreeMap::new(), fields, 1).unwrap();
        let before = point.clone();
        enricher.enrich(&mut point).await;
        assert_eq!(point, before);

        // no archive for this app: the stack stays as sent
        let mut fields = BTreeMap::new();
        fields.insert("error_stack".to_string(), FieldValue::from("@ a.js:1:1"));
        let mut tags = BTreeMap::new();
        tags.insert("app_id".to_string(), "app".to_string());
        let mut point = Point::new(Measurement::Error, tags, fields, 1).unwrap();
        let before = point.clone();
        enricher.enrich(&mut point).await;
        assert_eq!(point, before);
    }
}
