use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use health::HealthStrategy;

use crate::retry::RetryPolicy;
use crate::sourcemap::tools::ToolPaths;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:9529")]
    pub address: SocketAddr,

    #[envconfig(default = "info")]
    pub log_level: String,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(default = "ALL")]
    pub healthcheck_strategy: HealthStrategy,

    #[envconfig(default = "/v1/write/rum")]
    pub rum_endpoints: CommaList,

    #[envconfig(default = "")]
    pub rum_app_id_allow_list: CommaList,

    #[envconfig(default = "X-Forwarded-For")]
    pub rum_origin_ip_header: String,

    #[envconfig(default = "33554432")]
    pub rum_max_inflated_bytes: usize,

    pub maxmind_db_path: Option<PathBuf>,

    pub maxmind_isp_db_path: Option<PathBuf>,

    #[envconfig(nested = true)]
    pub sourcemap: SourceMapSettings,

    #[envconfig(nested = true)]
    pub cdn: CdnSettings,

    #[envconfig(nested = true)]
    pub replay: ReplaySettings,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    pub fn app_id_allow_list(&self) -> HashSet<String> {
        self.rum_app_id_allow_list.0.iter().cloned().collect()
    }
}

#[derive(Envconfig, Clone)]
pub struct SourceMapSettings {
    #[envconfig(from = "RUM_DATA_DIR", default = "data/rum")]
    pub data_dir: PathBuf,

    #[envconfig(from = "SOURCEMAP_SCAN_INTERVAL", default = "180000")]
    pub scan_interval: EnvMsDuration,

    #[envconfig(from = "SOURCEMAP_WEB_STALE_AFTER", default = "300000")]
    pub web_stale_after: EnvMsDuration,

    #[envconfig(from = "SOURCEMAP_TOOL_CONCURRENCY", default = "200")]
    pub tool_concurrency: usize,

    /// Longest a single retrace, ndk-stack or atos run may take
    #[envconfig(from = "SOURCEMAP_TOOL_TIMEOUT", default = "60000")]
    pub tool_timeout: EnvMsDuration,

    #[envconfig(from = "SOURCEMAP_UPLOAD_TOKEN")]
    pub upload_token: Option<String>,

    #[envconfig(from = "PROGUARD_HOME")]
    pub proguard_home: Option<PathBuf>,

    #[envconfig(from = "ANDROID_CMDLINE_HOME")]
    pub android_cmdline_home: Option<PathBuf>,

    #[envconfig(from = "NDK_HOME")]
    pub ndk_home: Option<PathBuf>,

    #[envconfig(from = "ATOS_BIN_PATH")]
    pub atos_bin_path: Option<PathBuf>,
}

impl SourceMapSettings {
    pub fn tools(&self) -> ToolPaths {
        ToolPaths {
            proguard_home: self.proguard_home.clone(),
            android_cmdline_home: self.android_cmdline_home.clone(),
            ndk_home: self.ndk_home.clone(),
            atos_bin_path: self.atos_bin_path.clone(),
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct CdnSettings {
    #[envconfig(from = "CDN_CACHE_CAPACITY", default = "8192")]
    pub cache_capacity: usize,

    #[envconfig(from = "CDN_CACHE_TTL", default = "604800000")]
    pub cache_ttl: EnvMsDuration,

    /// JSON provider table replacing the built-in one
    #[envconfig(from = "CDN_MAP")]
    pub cdn_map: Option<String>,
}

#[derive(Envconfig, Clone)]
pub struct ReplaySettings {
    #[envconfig(from = "REPLAY_ENDPOINTS", default = "/v1/write/rum/replay")]
    pub endpoints: CommaList,

    /// Unset disables replay routes and workers
    #[envconfig(from = "REPLAY_UPLOAD_URL")]
    pub upload_url: Option<String>,

    #[envconfig(from = "REPLAY_GLOBAL_TAGS", default = "")]
    pub global_tags: String,

    #[envconfig(from = "REPLAY_MAX_BODY_BYTES", default = "33554432")]
    pub max_body_bytes: usize,

    #[envconfig(from = "REPLAY_FILTER_RULES")]
    pub filter_rules: Option<String>,

    #[envconfig(from = "REPLAY_CACHE_PATH", default = "data/rum/replay-cache")]
    pub cache_path: PathBuf,

    #[envconfig(from = "REPLAY_CACHE_CAPACITY_MIB", default = "20480")]
    pub cache_capacity_mib: u64,

    #[envconfig(from = "REPLAY_CACHE_SEGMENT_MIB", default = "64")]
    pub cache_segment_mib: u64,

    #[envconfig(from = "REPLAY_CACHE_CLEAR_ON_START", default = "false")]
    pub cache_clear_on_start: bool,

    #[envconfig(from = "REPLAY_WORKERS", default = "16")]
    pub workers: usize,

    #[envconfig(from = "REPLAY_EMPTY_QUEUE_SLEEP", default = "1500")]
    pub empty_queue_sleep: EnvMsDuration,

    #[envconfig(from = "REPLAY_UPLOAD_TIMEOUT", default = "75000")]
    pub upload_timeout: EnvMsDuration,

    #[envconfig(from = "REPLAY_UPLOAD_ATTEMPTS", default = "3")]
    pub upload_attempts: u32,

    #[envconfig(from = "REPLAY_MAX_WORKER_PANICS", default = "3")]
    pub max_worker_panics: u32,
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub maximum_interval: EnvMsDuration,
}

impl RetryPolicyConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.backoff_coefficient,
            self.initial_interval.0,
            Some(self.maximum_interval.0),
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// Comma separated values, blanks dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommaList(pub Vec<String>);

impl FromStr for CommaList {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CommaList(
            s.split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.address, "127.0.0.1:9529".parse().unwrap());
        assert_eq!(config.rum_endpoints.0, vec!["/v1/write/rum"]);
        assert!(config.app_id_allow_list().is_empty());
        assert_eq!(config.sourcemap.scan_interval.0, time::Duration::from_secs(180));
        assert_eq!(config.cdn.cache_ttl.0, time::Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.replay.max_body_bytes, 32 * 1024 * 1024);
        assert_eq!(config.rum_max_inflated_bytes, 32 * 1024 * 1024);
        assert_eq!(config.sourcemap.tool_timeout.0, time::Duration::from_secs(60));
        assert_eq!(config.replay.workers, 16);
        assert_eq!(config.replay.upload_attempts, 3);
        assert!(config.replay.upload_url.is_none());
        assert_eq!(config.healthcheck_strategy, HealthStrategy::All);
    }

    #[test]
    fn overrides() {
        let env = HashMap::from([
            ("RUM_APP_ID_ALLOW_LIST".to_string(), "app_a, app_b,".to_string()),
            ("REPLAY_WORKERS".to_string(), "4".to_string()),
            ("SOURCEMAP_UPLOAD_TOKEN".to_string(), "secret".to_string()),
            ("INITIAL_INTERVAL".to_string(), "250".to_string()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();

        assert_eq!(
            config.app_id_allow_list(),
            HashSet::from(["app_a".to_string(), "app_b".to_string()])
        );
        assert_eq!(config.replay.workers, 4);
        assert_eq!(config.sourcemap.upload_token.as_deref(), Some("secret"));
        assert_eq!(
            config.retry_policy.policy().time_until_next_retry(0, None),
            time::Duration::from_millis(250)
        );
    }

    #[test]
    fn bad_durations_are_refused() {
        let env = HashMap::from([("SOURCEMAP_SCAN_INTERVAL".to_string(), "3m".to_string())]);
        assert!(Config::init_from_hashmap(&env).is_err());
    }
}
