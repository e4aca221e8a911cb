pub mod api;
pub mod cdn;
pub mod config;
pub mod decode;
pub mod enrich;
pub mod feed;
pub mod geo;
pub mod ingest;
pub mod point;
pub mod prometheus;
pub mod replay;
pub mod retry;
pub mod router;
pub mod server;
pub mod sourcemap;
pub mod time;
