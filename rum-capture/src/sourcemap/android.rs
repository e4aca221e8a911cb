use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use super::tools::{ToolPaths, ToolRunner};
use super::SourceMapError;

pub const JAVA_CRASH: &str = "java_crash";
pub const NATIVE_CRASH: &str = "native_crash";

const NDK_ABIS: [&str; 4] = ["armeabi-v7a", "arm64-v8a", "x86", "x86_64"];
const RETRACE_BANNER: &str = "Waiting for stack-trace input...";

static FIRST_FRAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\s#00\s+").expect("hard-coded regular expression to be valid")
});
static BACKTRACE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"backtrace:[\s\S]+?logcat:").expect("hard-coded regular expression to be valid")
});

/// R8 writes a marker in the header comments of its mapping files.
pub fn is_r8_mapping(mapping: &Path) -> Result<bool, SourceMapError> {
    let reader = BufReader::new(File::open(mapping)?);
    for line in reader.lines().take(10) {
        let line = line?;
        if line.starts_with('#')
            && (line.contains("compiler: R8") || line.contains("com.android.tools.r8.mapping"))
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Finds the first supported ABI named in a tombstone.
pub fn scan_abi(report: &str) -> Option<&'static str> {
    for field in ["ABI list:", "ABI:"] {
        let Some(start) = report.find(field) else {
            continue;
        };
        let rest = &report[start + field.len()..];
        let Some(eol) = rest.find(['\r', '\n']) else {
            continue;
        };
        let value = rest[..eol].trim().trim_matches('\'');
        if let Some(abi) = value
            .split(',')
            .find_map(|candidate| NDK_ABIS.iter().find(|abi| **abi == candidate.trim()))
            .copied()
        {
            return Some(abi);
        }
    }
    None
}

/// Deobfuscates a Java stack with retrace, picking the R8 or ProGuard
/// flavour from the mapping file.
pub async fn retrace_java(
    runner: &ToolRunner,
    tools: &ToolPaths,
    extract_dir: &Path,
    stack: &str,
) -> Result<String, SourceMapError> {
    let mapping = extract_dir.join("mapping.txt");
    if !mapping.is_file() {
        return Err(SourceMapError::ArchiveNotFound(format!(
            "java source mapping file [{}] not exists",
            mapping.display()
        )));
    }

    let retrace = if is_r8_mapping(&mapping)? {
        let home = tools
            .android_cmdline_home
            .as_ref()
            .ok_or(SourceMapError::ToolNotConfigured("ANDROID_CMDLINE_HOME"))?;
        home.join("bin").join("retrace")
    } else {
        let home = tools
            .proguard_home
            .as_ref()
            .ok_or(SourceMapError::ToolNotConfigured("PROGUARD_HOME"))?;
        home.join("bin").join("retrace.sh")
    };
    if !retrace.is_file() {
        return Err(SourceMapError::ToolNotFound(retrace.display().to_string()));
    }

    let args = [retrace.as_os_str(), mapping.as_os_str()];
    let out = runner.run(Path::new("sh"), args, stack, &[]).await?;
    Ok(trim_retrace_output(&String::from_utf8_lossy(&out)))
}

fn trim_retrace_output(out: &str) -> String {
    out.strip_prefix(RETRACE_BANNER)
        .unwrap_or(out)
        .trim_start_matches(['\r', '\n'])
        .to_string()
}

/// Symbolizes a native tombstone with ndk-stack against the archive's
/// per-ABI objects.
pub async fn symbolize_native(
    runner: &ToolRunner,
    tools: &ToolPaths,
    extract_dir: &Path,
    stack: &str,
) -> Result<String, SourceMapError> {
    let home = tools
        .ndk_home
        .as_ref()
        .ok_or(SourceMapError::ToolNotConfigured("NDK_HOME"))?;
    let ndk_stack = home.join("ndk-stack");
    match ndk_stack.metadata() {
        Ok(meta) if meta.is_file() => {}
        _ => return Err(SourceMapError::ToolNotFound(ndk_stack.display().to_string())),
    }

    let abi = scan_abi(stack).ok_or(SourceMapError::NoAbi)?;
    let symbols = extract_dir.join(abi);
    if !symbols.is_dir() {
        return Err(SourceMapError::ArchiveNotFound(format!(
            "expected native objects dir [{}] not found",
            symbols.display()
        )));
    }

    let args = [std::ffi::OsStr::new("--sym"), symbols.as_os_str()];
    let out = runner.run(&ndk_stack, args, stack, &[]).await?;
    Ok(splice_native_stack(stack, &String::from_utf8_lossy(&out)))
}

fn splice_native_stack(original: &str, symbolized: &str) -> String {
    let frames = match FIRST_FRAME.find(symbolized) {
        Some(m) => &symbolized[m.start()..],
        None => symbolized,
    };
    let frames = frames.replace("Crash dump is completed", "");

    match BACKTRACE.find(original) {
        Some(m) => original.replace(m.as_str(), &format!("backtrace:\n{frames}logcat:")),
        None => frames,
    }
}
