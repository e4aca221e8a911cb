use async_trait::async_trait;
use metrics::{counter, histogram};
use thiserror::Error;

use crate::point::Point;

pub const INPUT_NAME: &str = "rum";

/// Kind of data handed downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Rum,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Rum => "rum",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedOptions {
    /// SDK protocol version from the `version` query parameter
    pub version: Option<String>,
    /// Pipeline script named by the `source` query parameter
    pub pipeline_source: Option<String>,
}

#[derive(Error, Debug)]
#[error("feed rejected: {0}")]
pub struct FeedError(pub String);

/// The only way points leave the collector.
#[async_trait]
pub trait Feeder {
    async fn feed(
        &self,
        input: &str,
        category: Category,
        points: Vec<Point>,
        opts: FeedOptions,
    ) -> Result<(), FeedError>;
}

/// Logs every point, the binary's default downstream.
pub struct PrintFeeder {}

#[async_trait]
impl Feeder for PrintFeeder {
    async fn feed(
        &self,
        input: &str,
        category: Category,
        points: Vec<Point>,
        opts: FeedOptions,
    ) -> Result<(), FeedError> {
        let span = tracing::span!(
            tracing::Level::INFO,
            "batch of points",
            input,
            category = category.as_str()
        );
        let _enter = span.enter();

        histogram!("rum_feed_batch_size").record(points.len() as f64);
        counter!("rum_points_fed_total").increment(points.len() as u64);
        for point in points {
            let line = serde_json::to_string(&point).map_err(|e| FeedError(e.to_string()))?;
            tracing::info!(
                version = ?opts.version,
                source = ?opts.pipeline_source,
                "point: {}",
                line
            );
        }

        Ok(())
    }
}
