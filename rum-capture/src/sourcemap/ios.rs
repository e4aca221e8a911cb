use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use super::tools::{ToolPaths, ToolRunner};
use super::SourceMapError;

const DSYM_DWARF_DIR: &str = "Contents/Resources/DWARF";

static CRASH_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\S+)\s+(0x[0-9a-fA-F]+)\s+((0x[0-9a-fA-F]+)\s*\+\s*(\d+|0x[0-9a-fA-F]+))")
        .expect("hard-coded regular expression to be valid")
});

/// One frame of an iOS crash report that atos can resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashAddress {
    pub address: String,
    /// The `load + offset` text the symbol replaces
    pub origin: String,
}

/// Crash frames grouped by module, then by load address.
pub type CrashAddresses = BTreeMap<String, BTreeMap<String, Vec<CrashAddress>>>;

pub fn scan_crash_addresses(stack: &str) -> CrashAddresses {
    let mut grouped = CrashAddresses::new();
    for caps in CRASH_ADDRESS.captures_iter(stack) {
        grouped
            .entry(caps[1].to_string())
            .or_default()
            .entry(caps[4].to_string())
            .or_default()
            .push(CrashAddress {
                address: caps[2].to_string(),
                origin: caps[3].to_string(),
            });
    }
    grouped
}

/// Breadth-first search for the module's dSYM below `dir`.
pub fn find_symbol_file(dir: &Path, module: &str) -> Option<PathBuf> {
    let mut queue = VecDeque::from([dir.to_path_buf()]);
    while let Some(current) = queue.pop_front() {
        let Ok(entries) = fs::read_dir(&current) else {
            continue;
        };
        let mut entries: Vec<_> = entries.filter_map(Result::ok).collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if name.starts_with(module) && name.to_lowercase().ends_with(".dsym") {
                if file_type.is_dir() {
                    let dwarf = entry.path().join(DSYM_DWARF_DIR).join(module);
                    if dwarf.is_file() {
                        return Some(dwarf);
                    }
                    info!("{} not found, ignoring", dwarf.display());
                } else if file_type.is_file() {
                    return Some(entry.path());
                }
            }
            if file_type.is_dir() {
                queue.push_back(entry.path());
            }
        }
    }
    None
}

/// `atos` on a Mac, then the configured binary, then `atosl` on the PATH.
pub fn find_atos(tools: &ToolPaths) -> Result<PathBuf, SourceMapError> {
    if cfg!(target_os = "macos") {
        if let Ok(atos) = which::which("atos") {
            return Ok(atos);
        }
    }
    if let Some(configured) = tools.atos_bin_path.as_ref().filter(|p| p.is_file()) {
        return Ok(configured.clone());
    }
    which::which("atosl").map_err(|_| SourceMapError::ToolNotFound("atos/atosl".to_string()))
}

async fn run_atos(
    runner: &ToolRunner,
    atos: &Path,
    symbols: &Path,
    load: &str,
    addresses: &[&str],
) -> Result<Vec<String>, SourceMapError> {
    let mut args = vec!["-o".to_string(), symbols.display().to_string(), "-l".to_string()];
    args.push(load.to_string());
    args.extend(addresses.iter().map(|a| a.to_string()));
    info!("{} {}", atos.display(), args.join(" "));

    // atosl keeps its cache under HOME
    let out = runner.run(atos, &args, "", &[("HOME", "/var/tmp")]).await?;
    let out = String::from_utf8_lossy(&out)
        .replace("\r\n", "\n")
        .replace('\r', "\n");
    Ok(out.trim_matches('\n').split('\n').map(str::to_string).collect())
}

/// Replaces every `load + offset` of the report with the symbol atos finds
/// for its address. Modules without a dSYM are left alone, a report without
/// any frame gives `None`.
pub async fn symbolize(
    runner: &ToolRunner,
    tools: &ToolPaths,
    extract_dir: &Path,
    stack: &str,
) -> Result<Option<String>, SourceMapError> {
    let atos = find_atos(tools)?;
    let addresses = scan_crash_addresses(stack);
    if addresses.is_empty() {
        info!("no crash address in report");
        return Ok(None);
    }
    let mut symbolized = stack.to_string();

    for (module, by_load) in addresses {
        let Some(symbols) = find_symbol_file(extract_dir, &module) else {
            warn!("no dSYM for module {} under {}", module, extract_dir.display());
            continue;
        };
        for (load, frames) in by_load {
            let addresses: Vec<&str> = frames.iter().map(|f| f.address.as_str()).collect();
            let resolved = match run_atos(runner, &atos, &symbols, &load, &addresses).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!("atos failed for {}: {}", module, e);
                    continue;
                }
            };

            if resolved.len() == frames.len() {
                for (frame, symbol) in frames.iter().zip(&resolved) {
                    symbolized = symbolized.replace(&frame.origin, symbol);
                }
            } else if !resolved.is_empty() && frames.len() > 1 {
                warn!(
                    "atos resolved {} symbols for {} addresses, retrying one by one",
                    resolved.len(),
                    frames.len()
                );
                for frame in &frames {
                    match run_atos(runner, &atos, &symbols, &load, &[frame.address.as_str()]).await
                    {
                        Ok(single) if single.len() == 1 => {
                            symbolized = symbolized.replace(&frame.origin, &single[0]);
                        }
                        Ok(_) => {}
                        Err(e) => warn!("atos failed for {}: {}", frame.address, e),
                    }
                }
            }
        }
    }
    Ok(Some(symbolized))
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    const REPORT: &str = "Thread 0 Crashed:\n\
        0   App    0x0000000104a3c1f0 0x104a34000 + 33264\n\
        1   App    0x0000000104a3c2a0 0x104a34000 + 33440\n\
        2   UIKitCore    0x00000001a2b3c4d5 0x1a2b00000 + 0x3c4d5\n";

    #[test]
    fn groups_addresses_by_module_and_load() {
        let grouped = scan_crash_addresses(REPORT);
        assert_eq!(grouped.len(), 2);
        let app = &grouped["App"]["0x104a34000"];
        assert_eq!(
            app[0],
            CrashAddress {
                address: "0x0000000104a3c1f0".to_string(),
                origin: "0x104a34000 + 33264".to_string(),
            }
        );
        assert_eq!(app.len(), 2);
        assert_eq!(grouped["UIKitCore"]["0x1a2b00000"][0].origin, "0x1a2b00000 + 0x3c4d5");
    }

    #[test]
    fn finds_dsym_breadth_first() {
        let dir = tempfile::tempdir().unwrap();
        let dwarf = dir.path().join("nested/App.app.dSYM").join(DSYM_DWARF_DIR);
        fs::create_dir_all(&dwarf).unwrap();
        fs::write(dwarf.join("App"), b"dwarf").unwrap();
        assert_eq!(find_symbol_file(dir.path(), "App"), Some(dwarf.join("App")));

        fs::write(dir.path().join("App.DSYM"), b"flat").unwrap();
        assert_eq!(
            find_symbol_file(dir.path(), "App"),
            Some(dir.path().join("App.DSYM"))
        );
        assert_eq!(find_symbol_file(dir.path(), "Other"), None);
    }

    #[tokio::test]
    async fn replaces_resolved_frames() {
        let dir = tempfile::tempdir().unwrap();
        let dwarf = dir.path().join("App.app.dSYM").join(DSYM_DWARF_DIR);
        fs::create_dir_all(&dwarf).unwrap();
        fs::write(dwarf.join("App"), b"dwarf").unwrap();

        // prints one symbol per address argument after `-o sym -l load`
        let atos = dir.path().join("fake-atos");
        fs::write(
            &atos,
            "#!/bin/sh\nshift 4\nfor a in \"$@\"; do echo \"sym_$a (main.swift:1)\"; done\n",
        )
        .unwrap();
        fs::set_permissions(&atos, fs::Permissions::from_mode(0o755)).unwrap();

        let tools = ToolPaths {
            atos_bin_path: Some(atos),
            ..Default::default()
        };
        if cfg!(target_os = "macos") {
            return;
        }
        let runner = ToolRunner::new(16, super::super::tools::DEFAULT_TOOL_TIMEOUT);
        let out = symbolize(&runner, &tools, dir.path(), REPORT)
            .await
            .unwrap()
            .unwrap();
        assert!(out.contains("App    0x0000000104a3c1f0 sym_0x0000000104a3c1f0 (main.swift:1)"));
        assert!(out.contains("sym_0x0000000104a3c2a0 (main.swift:1)"));
        // no dSYM for UIKitCore
        assert!(out.contains("0x1a2b00000 + 0x3c4d5"));

        let none = symbolize(&runner, &tools, dir.path(), "no frames").await.unwrap();
        assert_eq!(none, None);
    }
}
