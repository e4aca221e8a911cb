//! Source map archives and stack trace resolution.
//!
//! Archives live under `{data_dir}/{platform}/{app}-{env}-{version}.zip`.
//! Web archives are parsed into memory on demand and re-checked against the
//! file once they are older than the staleness window. Android and iOS
//! archives are extracted next to the zip by a periodic scan, and resolved
//! by shelling out to the platform's symbolication tools.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock, TryLockError};
use std::time::{Duration, Instant, SystemTime};

use metrics::{counter, gauge, histogram};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::point::Point;

pub mod android;
pub mod archive;
pub mod handlers;
pub mod ios;
pub mod tools;
pub mod web;

pub use archive::archive_name;
use tools::{ToolPaths, ToolRunner};
use web::WebArchive;

pub const SOURCE_FIELD: &str = "error_stack_source_base64";

#[derive(Error, Debug)]
pub enum SourceMapError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("invalid archive dict: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0} not set")]
    ToolNotConfigured(&'static str),
    #[error("tool not found: {0}")]
    ToolNotFound(String),
    #[error("tool failed: {0}")]
    ToolFailed(String),
    #[error("{0}")]
    ArchiveNotFound(String),
    #[error("invalid archive path: {0}")]
    InvalidArchivePath(String),
    #[error("no valid NDK ABI found")]
    NoAbi,
    #[error("platform [{0}] not supported, please use web, miniapp, android or ios")]
    UnsupportedPlatform(String),
    #[error("resolution task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl SourceMapError {
    pub fn status(&self) -> ResolveStatus {
        match self {
            SourceMapError::ToolNotFound(_) => ResolveStatus::ToolNotFound,
            SourceMapError::ArchiveNotFound(_) => ResolveStatus::ZipNotFound,
            _ => ResolveStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Web,
    MiniApp,
    Android,
    Ios,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Web,
        Platform::MiniApp,
        Platform::Android,
        Platform::Ios,
    ];

    /// Directory name under the data dir, and the value of the `platform`
    /// query parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Web => "web",
            Platform::MiniApp => "miniapp",
            Platform::Android => "android",
            Platform::Ios => "ios",
        }
    }

    pub fn from_sdk_name(sdk_name: &str) -> Option<Self> {
        match sdk_name {
            "df_web_rum_sdk" => Some(Platform::Web),
            "df_miniapp_rum_sdk" | "df_uniapp_rum_sdk" => Some(Platform::MiniApp),
            "df_android_rum_sdk" => Some(Platform::Android),
            "df_ios_rum_sdk" => Some(Platform::Ios),
            _ => None,
        }
    }

    pub fn sdk_name(&self) -> &'static str {
        match self {
            Platform::Web => "df_web_rum_sdk",
            Platform::MiniApp => "df_miniapp_rum_sdk",
            Platform::Android => "df_android_rum_sdk",
            Platform::Ios => "df_ios_rum_sdk",
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, Platform::Android | Platform::Ios)
    }
}

impl FromStr for Platform {
    type Err = SourceMapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| SourceMapError::UnsupportedPlatform(s.to_string()))
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStatus {
    Unknown,
    Ok,
    Error,
    ToolNotFound,
    ZipNotFound,
    LackField,
}

impl ResolveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolveStatus::Unknown => "unknown",
            ResolveStatus::Ok => "ok",
            ResolveStatus::Error => "error",
            ResolveStatus::ToolNotFound => "no-tool",
            ResolveStatus::ZipNotFound => "no-zip",
            ResolveStatus::LackField => "lack-field",
        }
    }
}

/// Outcome of resolving one error point. `source` holds the rewritten stack
/// and is set whenever the status is `Ok`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub status: ResolveStatus,
    pub reason: Option<String>,
    pub source: Option<String>,
}

impl Resolution {
    fn with_status(status: ResolveStatus) -> Self {
        Self {
            status,
            reason: None,
            source: None,
        }
    }

    fn failed(err: SourceMapError) -> Self {
        Self {
            status: err.status(),
            reason: Some(err.to_string()),
            source: None,
        }
    }

    fn resolved(source: String, reason: Option<String>) -> Self {
        Self {
            status: ResolveStatus::Ok,
            reason,
            source: Some(source),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceMapConfig {
    pub data_dir: PathBuf,
    pub web_stale_after: Duration,
    pub tool_concurrency: usize,
    pub tool_timeout: Duration,
    pub tools: ToolPaths,
}

struct CachedArchive {
    archive: Arc<WebArchive>,
    checked_at: SystemTime,
}

pub struct SourceMapStore {
    data_dir: PathBuf,
    web_stale_after: Duration,
    tools: ToolPaths,
    runner: ToolRunner,
    web: RwLock<HashMap<PathBuf, CachedArchive>>,
    extract_lock: Mutex<()>,
}

impl SourceMapStore {
    pub fn new(config: SourceMapConfig) -> Self {
        Self {
            data_dir: config.data_dir,
            web_stale_after: config.web_stale_after,
            tools: config.tools,
            runner: ToolRunner::new(config.tool_concurrency, config.tool_timeout),
            web: RwLock::new(HashMap::new()),
            extract_lock: Mutex::new(()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn platform_dir(&self, platform: Platform) -> PathBuf {
        self.data_dir.join(platform.as_str())
    }

    /// Where the archive of an app version lives. Names that would land
    /// outside the platform dir are refused.
    pub fn archive_path(
        &self,
        platform: Platform,
        app_id: &str,
        env: &str,
        version: &str,
    ) -> Result<PathBuf, SourceMapError> {
        let dir = self.platform_dir(platform);
        let name = archive_name(app_id, env, version);
        match archive::clean_entry_path(&name) {
            Some(cleaned) if cleaned.components().count() == 1 => Ok(dir.join(cleaned)),
            _ => Err(SourceMapError::InvalidArchivePath(format!(
                "invalid file name [{name}], should not contain illegal char, such as '../, /'"
            ))),
        }
    }

    /// Parses a web archive into the cache, replacing any previous copy.
    pub fn load(&self, path: &Path) -> Result<(), SourceMapError> {
        info!("loading source map archive {}", path.display());
        let archive = Arc::new(web::load_web_archive(path)?);
        let mut cache = self.web.write().unwrap_or_else(PoisonError::into_inner);
        cache.insert(
            path.to_path_buf(),
            CachedArchive {
                archive,
                checked_at: SystemTime::now(),
            },
        );
        gauge!("rum_source_map_loaded_archives", "platform" => "web").set(cache.len() as f64);
        Ok(())
    }

    /// Loads every archive already present in the web and miniapp dirs.
    pub fn load_web_dirs(&self) {
        for platform in [Platform::Web, Platform::MiniApp] {
            let dir = self.platform_dir(platform);
            let archives = match archive::scan_archives(&dir) {
                Ok(archives) => archives,
                Err(e) => {
                    warn!("unable to scan {}: {}", dir.display(), e);
                    continue;
                }
            };
            for (path, _) in archives {
                if let Err(e) = self.load(&path) {
                    warn!("unable to load {}: {}", path.display(), e);
                }
            }
        }
    }

    pub fn evict(&self, path: &Path) {
        let mut cache = self.web.write().unwrap_or_else(PoisonError::into_inner);
        if cache.remove(path).is_some() {
            info!("source map archive {} removed from cache", path.display());
        }
        gauge!("rum_source_map_loaded_archives", "platform" => "web").set(cache.len() as f64);
    }

    fn cached_web(&self, path: &Path) -> Result<Option<Arc<WebArchive>>, SourceMapError> {
        let now = SystemTime::now();
        let cached = self
            .web
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .map(|c| (Arc::clone(&c.archive), c.checked_at));

        if let Some((archive, checked_at)) = &cached {
            if checked_at.checked_add(self.web_stale_after).unwrap_or(now) > now {
                return Ok(Some(Arc::clone(archive)));
            }
        }

        let modified = match fs::metadata(path) {
            Ok(meta) => meta.modified()?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if cached.is_some() {
                    self.evict(path);
                }
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match cached {
            Some((archive, _)) if archive.modified >= modified => {
                let mut cache = self.web.write().unwrap_or_else(PoisonError::into_inner);
                if let Some(entry) = cache.get_mut(path) {
                    entry.checked_at = now;
                }
                Ok(Some(archive))
            }
            _ => {
                self.load(path)?;
                Ok(self
                    .web
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(path)
                    .map(|c| Arc::clone(&c.archive)))
            }
        }
    }

    /// The web archive for an app version. Miniapps fall back to the web
    /// dir when they have no archive of their own.
    fn web_archive(
        &self,
        platform: Platform,
        app_id: &str,
        env: &str,
        version: &str,
    ) -> Result<Option<Arc<WebArchive>>, SourceMapError> {
        let mut candidates = vec![platform];
        if platform == Platform::MiniApp {
            candidates.push(Platform::Web);
        }
        for candidate in candidates {
            let path = self.archive_path(candidate, app_id, env, version)?;
            if let Some(archive) = self.cached_web(&path)? {
                return Ok(Some(archive));
            }
        }
        Ok(None)
    }

    /// Maps one `path:line:col` location through the app's web archive. The
    /// location comes back unchanged when it can't be mapped.
    pub fn lookup(&self, app_id: &str, env: &str, version: &str, location: &str) -> String {
        match self.web_archive(Platform::Web, app_id, env, version) {
            Ok(Some(archive)) => archive.map_location(location).unwrap_or_else(|e| {
                debug!("{}", e);
                location.to_string()
            }),
            Ok(None) => location.to_string(),
            Err(e) => {
                warn!("source map lookup failed: {}", e);
                location.to_string()
            }
        }
    }

    fn resolve_web(&self, platform: Platform, target: &Target) -> Resolution {
        match self.web_archive(platform, &target.app_id, &target.env, &target.version) {
            Ok(Some(archive)) => {
                let (source, reason) = archive.rewrite_stack(&target.stack);
                Resolution::resolved(source, reason)
            }
            Ok(None) => {
                let name = archive_name(&target.app_id, &target.env, &target.version);
                let reason = format!(
                    "source map file [{}] not exists",
                    self.platform_dir(platform).join(name).display()
                );
                warn!("{}", reason);
                Resolution {
                    status: ResolveStatus::ZipNotFound,
                    reason: Some(reason),
                    source: None,
                }
            }
            Err(e) => Resolution::failed(e),
        }
    }

    async fn resolve_native(
        &self,
        platform: Platform,
        target: &Target,
        point: &Point,
    ) -> Resolution {
        let located = self.archive_path(platform, &target.app_id, &target.env, &target.version);
        let extract_dir = match located {
            Ok(path) => archive::extract_dir(&path),
            Err(e) => return Resolution::failed(e),
        };

        let result = match platform {
            Platform::Android => match point.tag("error_type") {
                Some(android::JAVA_CRASH) => {
                    android::retrace_java(&self.runner, &self.tools, &extract_dir, &target.stack)
                        .await
                        .map(Some)
                }
                Some(android::NATIVE_CRASH) => android::symbolize_native(
                    &self.runner,
                    &self.tools,
                    &extract_dir,
                    &target.stack,
                )
                .await
                .map(Some),
                _ => Ok(None),
            },
            Platform::Ios => {
                ios::symbolize(&self.runner, &self.tools, &extract_dir, &target.stack).await
            }
            Platform::Web | Platform::MiniApp => Ok(None),
        };

        match result {
            Ok(Some(source)) => Resolution::resolved(source, None),
            Ok(None) => Resolution::with_status(ResolveStatus::Unknown),
            Err(e) => {
                warn!("unable to resolve {} stack for {}: {}", platform, target.app_id, e);
                Resolution::failed(e)
            }
        }
    }

    /// Resolves the `error_stack` of an error point sent by `sdk_name`.
    /// Nothing is ever returned as an error, failures land in the status.
    pub async fn resolve(self: &Arc<Self>, sdk_name: &str, point: &Point) -> Resolution {
        let Some(platform) = Platform::from_sdk_name(sdk_name) else {
            return Resolution::with_status(ResolveStatus::Unknown);
        };

        let start = Instant::now();
        let resolution = match Target::from_point(point) {
            None => Resolution::with_status(ResolveStatus::LackField),
            Some(target) if platform.is_native() => {
                self.resolve_native(platform, &target, point).await
            }
            Some(target) => {
                let store = Arc::clone(self);
                tokio::task::spawn_blocking(move || store.resolve_web(platform, &target))
                    .await
                    .unwrap_or_else(|e| Resolution::failed(e.into()))
            }
        };

        histogram!("rum_source_map_duration_seconds", "sdk_name" => sdk_name.to_string())
            .record(start.elapsed().as_secs_f64());
        counter!(
            "rum_source_map_total",
            "sdk_name" => sdk_name.to_string(),
            "app_id" => point.tag("app_id").unwrap_or_default().to_string(),
            "env" => point.tag("env").unwrap_or_default().to_string(),
            "version" => point.tag("version").unwrap_or_default().to_string(),
            "status" => resolution.status.as_str(),
        )
        .increment(1);

        resolution
    }

    /// Extracts new and changed native archives. A scan already in progress
    /// makes this a no-op unless `wait` is set.
    pub fn scan(&self, loose: bool, wait: bool) -> Result<(), SourceMapError> {
        let _guard = match self.extract_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) if wait => self
                .extract_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            Err(TryLockError::WouldBlock) => {
                warn!("source map extraction already running, skipping this interval");
                return Ok(());
            }
        };

        let dirs: Vec<PathBuf> = [Platform::Android, Platform::Ios]
            .into_iter()
            .map(|p| self.platform_dir(p))
            .collect();
        let report = archive::sync_archives(&self.data_dir, &dirs, loose)?;

        for platform in [Platform::Android, Platform::Ios] {
            let dir = self.platform_dir(platform);
            let count = report.archives.iter().filter(|a| a.starts_with(&dir)).count();
            gauge!("rum_source_map_loaded_archives", "platform" => platform.as_str())
                .set(count as f64);
        }

        let gone: Vec<PathBuf> = self
            .web
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|path| !path.is_file())
            .cloned()
            .collect();
        for path in gone {
            self.evict(&path);
        }
        Ok(())
    }

    /// Writes an uploaded archive and makes it available right away.
    pub fn store_archive(
        &self,
        platform: Platform,
        app_id: &str,
        env: &str,
        version: &str,
        body: &[u8],
    ) -> Result<PathBuf, SourceMapError> {
        let path = self.archive_path(platform, app_id, env, version)?;
        fs::create_dir_all(self.platform_dir(platform))?;
        fs::write(&path, body)?;

        if platform.is_native() {
            self.scan(true, true)?;
        } else if let Err(e) = self.load(&path) {
            warn!("update source map cache failed: {}", e);
        }
        Ok(path)
    }

    /// Removes an archive with its extraction and cached copy.
    pub fn delete_archive(
        &self,
        platform: Platform,
        app_id: &str,
        env: &str,
        version: &str,
    ) -> Result<PathBuf, SourceMapError> {
        let path = self.archive_path(platform, app_id, env, version)?;
        fs::remove_file(&path)?;
        self.evict(&path);

        let extracted = archive::extract_dir(&path);
        if extracted.is_dir() {
            if let Err(e) = fs::remove_dir_all(&extracted) {
                warn!("unable to remove {}: {}", extracted.display(), e);
            }
        }
        Ok(path)
    }
}

struct Target {
    app_id: String,
    env: String,
    version: String,
    stack: String,
}

impl Target {
    fn from_point(point: &Point) -> Option<Self> {
        let stack = point.field("error_stack")?;
        let app_id = point.tag("app_id").filter(|id| !id.is_empty())?;
        Some(Self {
            app_id: app_id.to_string(),
            env: point.tag("env").unwrap_or_default().to_string(),
            version: point.tag("version").unwrap_or_default().to_string(),
            stack: stack.to_string(),
        })
    }
}
