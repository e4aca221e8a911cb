use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use super::SourceMapError;

pub const DICT_FILE: &str = ".--source-map-archive-dict.json";
pub const ZIP_EXT: &str = ".zip";
const EXPIRED_DIR_EXT: &str = ".expired-tmp";

/// What the store remembers about a native archive between scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMeta {
    #[serde(with = "time::serde::rfc3339")]
    pub mod_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339", default = "unix_epoch")]
    pub extract_time: OffsetDateTime,
}

fn unix_epoch() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH
}

/// Archive path to metadata, persisted as pretty JSON in the data dir.
pub type ArchiveDict = BTreeMap<String, ArchiveMeta>;

/// `{app}-{env}-{version}.zip`, with `none` standing in for empty parts.
pub fn archive_name(app_id: &str, env: &str, version: &str) -> String {
    let or_none = |s: &str| if s.is_empty() { "none".to_string() } else { s.to_string() };
    format!("{}-{}-{}{ZIP_EXT}", app_id, or_none(env), or_none(version)).replace('/', "__")
}

/// Archives extract next to themselves, minus the extension.
pub fn extract_dir(archive: &Path) -> PathBuf {
    let raw = archive.to_string_lossy();
    PathBuf::from(raw.strip_suffix(ZIP_EXT).unwrap_or(&raw))
}

pub fn read_dict(data_dir: &Path, loose: bool) -> Result<ArchiveDict, SourceMapError> {
    let path = data_dir.join(DICT_FILE);
    let body = match fs::read(&path) {
        Ok(body) => body,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ArchiveDict::new()),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_slice(&body) {
        Ok(dict) => Ok(dict),
        Err(e) if loose => {
            warn!("dropping unreadable archive dict {}: {}", path.display(), e);
            if let Err(e) = fs::remove_file(&path) {
                warn!("unable to remove archive dict: {}", e);
            }
            Ok(ArchiveDict::new())
        }
        Err(e) => Err(e.into()),
    }
}

pub fn write_dict(data_dir: &Path, dict: &ArchiveDict) -> Result<(), SourceMapError> {
    let body = serde_json::to_vec_pretty(dict)?;
    fs::create_dir_all(data_dir)?;
    let tmp = data_dir.join(format!("{DICT_FILE}.tmp"));
    fs::write(&tmp, body)?;
    fs::rename(tmp, data_dir.join(DICT_FILE))?;
    Ok(())
}

/// `.zip` files directly inside `dir`, with their modification times. A
/// missing dir holds no archive.
pub fn scan_archives(dir: &Path) -> Result<Vec<(PathBuf, SystemTime)>, SourceMapError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut archives = Vec::new();
    for entry in entries {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() || !entry.file_name().to_string_lossy().ends_with(ZIP_EXT) {
            continue;
        }
        archives.push((entry.path(), meta.modified()?));
    }
    archives.sort();
    Ok(archives)
}

/// Lexically cleans a zip entry name. Entries that climb out of the archive
/// root or are absolute come back as `None`, as does the root itself.
pub fn clean_entry_path(name: &str) -> Option<PathBuf> {
    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.iter().collect())
}

/// Extracts `archive` into a hidden sibling dir, then swaps it in place of
/// the previous extraction. Entries under a top-level dir named like the
/// archive are flattened into the extraction root.
pub fn extract_zip(archive: &Path) -> Result<PathBuf, SourceMapError> {
    let target = extract_dir(archive);
    let parent = target
        .parent()
        .ok_or_else(|| SourceMapError::InvalidArchivePath(archive.display().to_string()))?;
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| SourceMapError::InvalidArchivePath(archive.display().to_string()))?
        .to_string();
    let staging = parent.join(format!(".{name}"));

    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;

    let mut zip = zip::ZipArchive::new(File::open(archive)?)?;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(cleaned) = clean_entry_path(entry.name()) else {
            warn!("ignoring zip entry {:?} in {}", entry.name(), archive.display());
            continue;
        };
        let dest = match cleaned.strip_prefix(&name) {
            Ok(rest) => staging.join(rest),
            Err(_) => staging.join(&cleaned),
        };

        if entry.is_dir() {
            fs::create_dir_all(&dest)?;
            continue;
        }
        if let Some(dir) = dest.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut out = File::create(&dest)?;
        io::copy(&mut entry, &mut out)?;
    }

    let mut expired = None;
    if target.is_dir() {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let aside = parent.join(format!("{name}.{}{EXPIRED_DIR_EXT}", radix32(nanos)));
        fs::rename(&target, &aside)?;
        expired = Some(aside);
    }
    fs::rename(&staging, &target)?;

    if let Some(aside) = expired {
        remove_expired(aside);
    }
    Ok(target)
}

// Lookups may still hold files in the old tree, so it goes away in the
// background when a runtime is around.
fn remove_expired(dir: PathBuf) {
    let remove = move || {
        if let Err(e) = fs::remove_dir_all(&dir) {
            warn!("unable to remove expired dir {}: {}", dir.display(), e);
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(remove);
        }
        Err(_) => remove(),
    }
}

fn radix32(mut n: u128) -> String {
    const DIGITS: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 32) as usize]);
        n /= 32;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Result of one pass over the native archive dirs.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub archives: Vec<PathBuf>,
    pub extracted: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

/// Brings the extraction dirs under `dirs` in line with the archives on
/// disk: new or changed archives are extracted, vanished ones have their
/// extraction removed, and the dict is rewritten.
pub fn sync_archives(
    data_dir: &Path,
    dirs: &[PathBuf],
    loose: bool,
) -> Result<SyncReport, SourceMapError> {
    let mut found = Vec::new();
    for dir in dirs {
        match scan_archives(dir) {
            Ok(archives) => found.extend(archives),
            Err(e) => warn!("unable to scan {}: {}", dir.display(), e),
        }
    }

    let mut old = read_dict(data_dir, loose)?;
    let mut dict = ArchiveDict::new();
    let mut report = SyncReport::default();

    for (path, modified) in found {
        let key = path.to_string_lossy().into_owned();
        let mod_time = OffsetDateTime::from(modified);
        let previous = old.remove(&key);

        let mut extract_time = previous
            .as_ref()
            .map(|m| m.extract_time)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let stale = previous.is_some() && extract_time < mod_time;
        if stale || !extract_dir(&path).is_dir() {
            info!("extracting source map archive {}", path.display());
            match extract_zip(&path) {
                Ok(_) => {
                    extract_time = OffsetDateTime::now_utc();
                    report.extracted.push(path.clone());
                }
                Err(e) => warn!("unable to extract {}: {}", path.display(), e),
            }
        }

        dict.insert(
            key,
            ArchiveMeta {
                mod_time,
                extract_time,
            },
        );
        report.archives.push(path);
    }

    for gone in old.into_keys() {
        let path = PathBuf::from(gone);
        let dir = extract_dir(&path);
        if !path.is_file() && dir.is_dir() {
            info!("removing extraction of deleted archive {}", path.display());
            match fs::remove_dir_all(&dir) {
                Ok(()) => report.removed.push(path),
                Err(e) => warn!("unable to remove {}: {}", dir.display(), e),
            }
        }
    }

    write_dict(data_dir, &dict)?;
    Ok(report)
}
