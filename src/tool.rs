//! The external media fetcher, seen through a narrow capability interface.
//!
//! Handlers only talk to [`MediaTool`]; [`YtDlp`] is the production
//! implementation that spawns the binary. Every spawned child is tied to a
//! [`CancellationToken`] so that a disconnected client ends the process.

use std::{
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
    pin::Pin,
    process::{ExitStatus, Stdio},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, ChildStderr, Command},
    sync::oneshot,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::AppConfig;

/// yt-dlp output template: title capped at 200 characters, extension kept.
pub const OUTPUT_TEMPLATE: &str = "%(title).200s.%(ext)s";

const PREVIEW_FORMAT: &str = "best[ext=mp4]/best";
const MERGE_FORMAT: &str = "mp4";

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("could not start {bin}: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error while talking to the tool: {0}")]
    Io(#[from] std::io::Error),
    #[error("tool run was cancelled")]
    Cancelled,
}

/// How the process ended. `code` is `None` when it was killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolExit {
    pub code: Option<i32>,
}

impl ToolExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ToolExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

impl fmt::Display for ToolExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "code {code}"),
            None => f.write_str("signal"),
        }
    }
}

#[derive(Debug)]
pub struct CapturedOutput {
    pub exit: ToolExit,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Live standard output of a running tool plus its eventual exit.
pub struct MediaStream {
    pub output: Pin<Box<dyn AsyncRead + Send>>,
    pub exit: oneshot::Receiver<ToolExit>,
}

#[async_trait]
pub trait MediaTool: Send + Sync {
    /// Runs the metadata dump (`-J`) and captures both output streams.
    async fn dump_metadata(&self, url: &str) -> Result<CapturedOutput, ToolError>;

    /// Downloads and merges the media, writing it through `output_template`.
    /// Resolves once the process has exited, or with `ToolError::Cancelled`
    /// after killing it when `cancel` fires first.
    async fn download_to(
        &self,
        url: &str,
        output_template: &Path,
        cancel: CancellationToken,
    ) -> Result<ToolExit, ToolError>;

    /// Starts the tool writing media to its own stdout. The process is killed
    /// when `cancel` fires.
    async fn stream_to_stdout(
        &self,
        url: &str,
        cancel: CancellationToken,
    ) -> Result<MediaStream, ToolError>;
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    bin: PathBuf,
    ffmpeg_location: Option<PathBuf>,
}

impl YtDlp {
    pub fn new(bin: impl Into<PathBuf>, ffmpeg_location: Option<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            ffmpeg_location,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.ytdlp_bin.clone(), config.ffmpeg_location.clone())
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec!["--no-playlist".to_string()];
        if let Some(location) = &self.ffmpeg_location {
            args.push("--ffmpeg-location".to_string());
            args.push(location.to_string_lossy().into_owned());
        }
        args
    }

    pub fn metadata_args(&self, url: &str) -> Vec<String> {
        let mut args = self.base_args();
        args.push("-J".to_string());
        args.push(url.to_string());
        args
    }

    pub fn download_args(&self, url: &str, output_template: &Path) -> Vec<String> {
        let mut args = self.base_args();
        args.extend([
            "--merge-output-format".to_string(),
            MERGE_FORMAT.to_string(),
            "-o".to_string(),
            output_template.to_string_lossy().into_owned(),
            url.to_string(),
        ]);
        args
    }

    pub fn preview_args(&self, url: &str) -> Vec<String> {
        let mut args = self.base_args();
        args.extend([
            "--merge-output-format".to_string(),
            MERGE_FORMAT.to_string(),
            "-f".to_string(),
            PREVIEW_FORMAT.to_string(),
            "-o".to_string(),
            "-".to_string(),
            url.to_string(),
        ]);
        args
    }

    fn command(&self, args: Vec<String>) -> Command {
        let mut command = Command::new(&self.bin);
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);
        command
    }

    fn spawn_error(&self, source: std::io::Error) -> ToolError {
        if source.kind() == ErrorKind::NotFound {
            warn!(
                "{} is not installed or not on PATH. Install yt-dlp or set YTDLP_BIN.",
                self.bin.display()
            );
        }
        ToolError::Spawn {
            bin: self.bin.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl MediaTool for YtDlp {
    async fn dump_metadata(&self, url: &str) -> Result<CapturedOutput, ToolError> {
        let output = self
            .command(self.metadata_args(url))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|error| self.spawn_error(error))?;

        Ok(CapturedOutput {
            exit: output.status.into(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn download_to(
        &self,
        url: &str,
        output_template: &Path,
        cancel: CancellationToken,
    ) -> Result<ToolExit, ToolError> {
        let mut child = self
            .command(self.download_args(url, output_template))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| self.spawn_error(error))?;
        let stderr_task = child.stderr.take().map(forward_stderr);

        let finished = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let Some(status) = finished else {
            debug!("Download cancelled, killing yt-dlp");
            kill_and_reap(&mut child).await;
            return Err(ToolError::Cancelled);
        };

        let exit = ToolExit::from(status?);
        if !exit.success() {
            let last_line = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            warn!("yt-dlp download exited with {exit}: {last_line}");
        }
        Ok(exit)
    }

    async fn stream_to_stdout(
        &self,
        url: &str,
        cancel: CancellationToken,
    ) -> Result<MediaStream, ToolError> {
        let mut child = self
            .command(self.preview_args(url))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| self.spawn_error(error))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("yt-dlp stdout was not captured"))?;
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(stderr);
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let finished = tokio::select! {
                status = child.wait() => Some(status),
                _ = cancel.cancelled() => None,
            };
            let exit = match finished {
                Some(Ok(status)) => ToolExit::from(status),
                Some(Err(error)) => {
                    warn!("Could not wait for yt-dlp: {error}");
                    ToolExit { code: None }
                }
                None => {
                    debug!("Preview cancelled, killing yt-dlp");
                    kill_and_reap(&mut child).await
                }
            };
            if !exit.success() {
                debug!("yt-dlp preview exited with {exit}");
            }
            let _ = exit_tx.send(exit);
        });

        Ok(MediaStream {
            output: Box::pin(stdout),
            exit: exit_rx,
        })
    }
}

/// Sends SIGKILL and waits so the child does not linger as a zombie.
async fn kill_and_reap(child: &mut Child) -> ToolExit {
    if let Err(error) = child.start_kill() {
        debug!("yt-dlp already gone: {error}");
    }
    child
        .wait()
        .await
        .map(ToolExit::from)
        .unwrap_or(ToolExit { code: None })
}

/// Logs tool diagnostics line by line and yields the last non-empty line.
fn forward_stderr(stderr: ChildStderr) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut last = String::new();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        debug!(target: "vidrelay::yt_dlp", "{line}");
                        last = line.to_string();
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    debug!("Stopped reading yt-dlp stderr: {error}");
                    break;
                }
            }
        }
        last
    })
}

/// Last meaningful stderr line, used when reporting a failed run.
pub fn last_error_line(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp did not report an error")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_args_disable_playlists() {
        let tool = YtDlp::new("yt-dlp", None);
        assert_eq!(
            tool.metadata_args("https://youtu.be/abc"),
            vec!["--no-playlist", "-J", "https://youtu.be/abc"]
        );
    }

    #[test]
    fn ffmpeg_location_is_forwarded() {
        let tool = YtDlp::new("yt-dlp", Some(PathBuf::from("/opt/ffmpeg/bin")));
        let args = tool.download_args("https://youtu.be/abc", Path::new("/tmp/vd-1/out"));
        assert_eq!(
            args,
            vec![
                "--no-playlist",
                "--ffmpeg-location",
                "/opt/ffmpeg/bin",
                "--merge-output-format",
                "mp4",
                "-o",
                "/tmp/vd-1/out",
                "https://youtu.be/abc",
            ]
        );
    }

    #[test]
    fn preview_writes_to_stdout() {
        let tool = YtDlp::new("yt-dlp", None);
        let args = tool.preview_args("https://youtu.be/abc");
        assert_eq!(
            args,
            vec![
                "--no-playlist",
                "--merge-output-format",
                "mp4",
                "-f",
                "best[ext=mp4]/best",
                "-o",
                "-",
                "https://youtu.be/abc",
            ]
        );
    }

    #[test]
    fn exit_display_includes_code() {
        assert_eq!(ToolExit { code: Some(3) }.to_string(), "code 3");
        assert_eq!(ToolExit { code: None }.to_string(), "signal");
        assert!(ToolExit { code: Some(0) }.success());
        assert!(!ToolExit { code: None }.success());
    }

    #[test]
    fn last_error_line_skips_blank_lines() {
        let stderr = b"WARNING: something\nERROR: Unsupported URL\n\n";
        assert_eq!(last_error_line(stderr), "ERROR: Unsupported URL");
        assert_eq!(last_error_line(b""), "yt-dlp did not report an error");
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let tool = YtDlp::new("/nonexistent/vidrelay-yt-dlp", None);
        let error = tool.dump_metadata("https://youtu.be/abc").await.unwrap_err();
        assert!(matches!(error, ToolError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_code_is_captured() {
        // `false` ignores its arguments and exits with 1.
        let tool = YtDlp::new("false", None);
        let output = tool.dump_metadata("https://youtu.be/abc").await.unwrap();
        assert_eq!(output.exit.code, Some(1));
        assert!(output.stdout.is_empty());
    }

    /// A stand-in binary that ignores its arguments and never finishes.
    #[cfg(unix)]
    fn sleeping_tool(dir: &Path) -> YtDlp {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("slow-yt-dlp");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        YtDlp::new(script, None)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_download_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let tool = sleeping_tool(dir.path());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let template = dir.path().join(OUTPUT_TEMPLATE);
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            tool.download_to("https://youtu.be/abc", &template, cancel),
        )
        .await
        .expect("download_to did not return after cancel");
        assert!(matches!(result, Err(ToolError::Cancelled)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_preview_reports_signal_exit() {
        let dir = tempfile::tempdir().unwrap();
        let tool = sleeping_tool(dir.path());
        let cancel = CancellationToken::new();

        let MediaStream { exit, .. } = tool
            .stream_to_stdout("https://youtu.be/abc", cancel.clone())
            .await
            .unwrap();
        cancel.cancel();

        let exit = tokio::time::timeout(std::time::Duration::from_secs(10), exit)
            .await
            .expect("preview process was not reaped after cancel")
            .unwrap();
        assert_eq!(exit, ToolExit { code: None });
    }
}
