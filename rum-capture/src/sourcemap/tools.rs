use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::debug;

use super::SourceMapError;

/// Smallest number of symbolication processes allowed to run at once.
pub const MIN_TOOL_CONCURRENCY: usize = 16;

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Install locations of the native symbolication tools, all optional.
#[derive(Debug, Clone, Default)]
pub struct ToolPaths {
    pub proguard_home: Option<PathBuf>,
    pub android_cmdline_home: Option<PathBuf>,
    pub ndk_home: Option<PathBuf>,
    pub atos_bin_path: Option<PathBuf>,
}

/// Runs external tools, at most `concurrency` at a time. A run that
/// outlives `timeout` is killed.
pub struct ToolRunner {
    tokens: Semaphore,
    timeout: Duration,
}

impl ToolRunner {
    pub fn new(concurrency: usize, timeout: Duration) -> Self {
        Self {
            tokens: Semaphore::new(concurrency.max(MIN_TOOL_CONCURRENCY)),
            timeout,
        }
    }

    pub fn available(&self) -> usize {
        self.tokens.available_permits()
    }

    /// Runs `program` with `input` on stdin and returns its stdout. A non-zero
    /// exit is an error carrying stderr.
    pub async fn run<I, S>(
        &self,
        program: &Path,
        args: I,
        input: &str,
        envs: &[(&str, &str)],
    ) -> Result<Vec<u8>, SourceMapError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let _token = self
            .tokens
            .acquire()
            .await
            .map_err(|e| SourceMapError::ToolFailed(e.to_string()))?;

        debug!("running {}", program.display());
        let mut child = Command::new(program)
            .args(args)
            .envs(envs.iter().copied())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SourceMapError::ToolFailed(format!("{}: {e}", program.display())))?;

        // stdin is fed while stdout drains, a tool may answer before it has
        // read all of its input
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    debug!("{} stopped reading its input: {}", program.display(), e);
                }
            }
        };
        let run = async { tokio::join!(feed, child.wait_with_output()).1 };
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| {
                SourceMapError::ToolFailed(format!(
                    "{} timed out after {:?}",
                    program.display(),
                    self.timeout
                ))
            })??;
        if !output.status.success() {
            return Err(SourceMapError::ToolFailed(format!(
                "{} exited with {}: {}",
                program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}
