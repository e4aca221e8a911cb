use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::SystemTime;

use once_cell::sync::Lazy;
use regex::Regex;
use sourcemap::DecodedMap;
use tracing::{debug, warn};
use url::Url;

use super::archive::clean_entry_path;
use super::SourceMapError;

const MAP_EXT: &str = ".map";
const MAX_MAP_SIZE: u64 = 4 << 30;

static LOCATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"@ .*:\d+:\d+").expect("hard-coded regular expression to be valid")
});

/// Parsed `.map` files of one web archive, keyed by their path in the zip.
pub struct WebArchive {
    maps: HashMap<String, DecodedMap>,
    /// Modification time of the zip when it was read
    pub modified: SystemTime,
}

impl WebArchive {
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Maps a single `path:line:col` location. Line numbers are 1-based,
    /// columns 0-based, in and out.
    pub fn map_location(&self, location: &str) -> Result<String, String> {
        let mut parts = location.rsplitn(3, ':');
        let (Some(col), Some(line), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("malformed location [{location}]"));
        };
        let line: u32 = line
            .parse()
            .map_err(|_| format!("invalid line number in [{location}]"))?;
        let col: u32 = col
            .parse()
            .map_err(|_| format!("invalid column number in [{location}]"))?;

        let url_path = match Url::parse(path) {
            Ok(url) => url.path().to_string(),
            Err(url::ParseError::RelativeUrlWithoutBase) => path.to_string(),
            Err(e) => return Err(format!("parse url failed, {path}, {e}")),
        };
        let map_name = format!("{}{MAP_EXT}", url_path.trim_start_matches('/'));

        let Some(map) = self.maps.get(&map_name) else {
            return Err(format!(
                "parse sourcemap for [{location}] failed: sourcemap file [{map_name}] is required"
            ));
        };

        let token = line
            .checked_sub(1)
            .and_then(|line| map.lookup_token(line, col))
            .ok_or_else(|| {
                format!(
                    "fetch original source information failed, make sure sourcemap file [{map_name}] is valid"
                )
            })?;
        let source = token.get_source().unwrap_or_default();
        Ok(format!(
            "{}:{}:{}",
            source,
            token.get_src_line() + 1,
            token.get_src_col()
        ))
    }

    /// Rewrites every `@ path:line:col` of a browser stack trace. Locations
    /// that don't map stay as they are, the last failure comes back as the
    /// reason.
    pub fn rewrite_stack(&self, stack: &str) -> (String, Option<String>) {
        let mut reason = None;
        let rewritten = LOCATION.replace_all(stack, |caps: &regex::Captures| {
            let matched = &caps[0];
            let location = &matched[2..];
            match self.map_location(location) {
                Ok(mapped) => format!("@ {mapped}"),
                Err(e) => {
                    warn!("{}", e);
                    reason = Some(e);
                    matched.to_string()
                }
            }
        });
        (rewritten.into_owned(), reason)
    }
}

/// Reads every `.map` entry of a web archive. Entries that fail to parse
/// are skipped.
pub fn load_web_archive(path: &Path) -> Result<WebArchive, SourceMapError> {
    let file = File::open(path)?;
    let modified = file.metadata()?.modified()?;
    let mut zip = zip::ZipArchive::new(file)?;
    let mut maps = HashMap::new();

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        if entry.is_dir() || !entry.name().ends_with(MAP_EXT) {
            continue;
        }
        if entry.size() > MAX_MAP_SIZE {
            warn!("ignoring {} in {}: {} bytes", entry.name(), path.display(), entry.size());
            continue;
        }
        let Some(name) = clean_entry_path(entry.name()) else {
            warn!("ignoring zip entry {:?} in {}", entry.name(), path.display());
            continue;
        };
        let name = name.to_string_lossy().replace('\\', "/");

        let mut body = Vec::new();
        if let Err(e) = entry.read_to_end(&mut body) {
            warn!("unable to read {} in {}: {}", name, path.display(), e);
            continue;
        }
        match sourcemap::decode_slice(&body) {
            Ok(map) => {
                debug!("loaded source map {}", name);
                maps.insert(name, map);
            }
            Err(e) => warn!("parse source map {} failed: {}", name, e),
        }
    }

    Ok(WebArchive { maps, modified })
}
