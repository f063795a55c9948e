#![forbid(unsafe_code)]

//! Everything that shells out to yt-dlp.
//!
//! `YtDlp::fetch` is the only long-running call: it downloads the video and
//! audio tracks, lets yt-dlp merge them into an mp4 and reports progress
//! through a channel while it reads the subprocess output line by line. The
//! remaining helpers are short metadata calls.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::Command,
    sync::mpsc,
};

use crate::{
    error::FetchError,
    progress::{ProgressParser, ProgressUpdate},
    quality,
};

/// Percent, total size, downloaded size and codec of the current track.
pub const PROGRESS_TEMPLATE: &str = "download:%(progress._percent_str)s %(progress._total_bytes_str)s %(progress._downloaded_bytes_str)s %(info.vcodec)s";

const MERGE_CONTAINER: &str = "mp4";

/// Extensions of intermediate files that must never be taken as the result.
const PARTIAL_SUFFIXES: [&str; 4] = [".part", ".ytdl", ".temp", ".tmp"];

pub fn video_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

/// Downloads one `(video, quality)` pair into a single file.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Downloads `video_url` at `quality` into exactly `output_path` and
    /// returns the final file size. Progress updates are sent in the order
    /// they were parsed; the sender is dropped when the call returns.
    async fn fetch(
        &self,
        video_url: &str,
        quality: &str,
        output_path: &Path,
        progress: mpsc::UnboundedSender<ProgressUpdate>,
    ) -> Result<u64, FetchError>;
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    bin: PathBuf,
    cookies: Option<PathBuf>,
}

impl YtDlp {
    pub fn new(bin: impl Into<PathBuf>, cookies: Option<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            cookies,
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.bin);
        command.stdin(Stdio::null());
        command
    }

    /// Cookies are only passed along when the file actually exists.
    fn append_cookies(&self, command: &mut Command) {
        if let Some(cookies) = &self.cookies
            && cookies.exists()
        {
            command.arg("--cookies").arg(cookies);
        }
    }

    /// Runs a short yt-dlp call and returns its stdout.
    async fn run_capture(&self, mut command: Command) -> Result<Vec<u8>, FetchError> {
        let output = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| FetchError::Spawn {
                bin: self.bin.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(FetchError::Subprocess {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// Direct URL of the best combined stream for `quality`.
    pub async fn stream_url(&self, video_url: &str, quality: &str) -> Result<String, FetchError> {
        let format = quality::resolve(quality, false);
        let mut command = self.command();
        command
            .arg("--force-ipv4")
            .arg("--get-url")
            .arg("--format")
            .arg(&format)
            .arg("--no-playlist");
        self.append_cookies(&mut command);
        command.arg(video_url);

        let stdout = self.run_capture(command).await?;
        let text = String::from_utf8_lossy(&stdout);
        text.lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| FetchError::Metadata("no stream url in output".to_string()))
    }

    /// Heights of every format that carries a video track.
    pub async fn available_heights(&self, video_url: &str) -> Result<Vec<u32>, FetchError> {
        let mut command = self.command();
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-playlist")
            .arg("--no-warnings");
        self.append_cookies(&mut command);
        command.arg(video_url);

        let stdout = self.run_capture(command).await?;
        let info: FormatListing = serde_json::from_slice(&stdout)
            .map_err(|err| FetchError::Metadata(format!("format listing: {err}")))?;
        let mut heights: Vec<u32> = info
            .formats
            .into_iter()
            .filter(|format| format.vcodec.as_deref() != Some("none"))
            .filter_map(|format| format.height)
            .collect();
        heights.sort_unstable();
        heights.dedup();
        Ok(heights)
    }
}

#[derive(Deserialize)]
struct FormatListing {
    #[serde(default)]
    formats: Vec<FormatEntry>,
}

#[derive(Deserialize)]
struct FormatEntry {
    height: Option<u32>,
    vcodec: Option<String>,
}

#[async_trait]
impl Fetcher for YtDlp {
    async fn fetch(
        &self,
        video_url: &str,
        quality: &str,
        output_path: &Path,
        progress: mpsc::UnboundedSender<ProgressUpdate>,
    ) -> Result<u64, FetchError> {
        let format = quality::resolve(quality, true);
        let stem = output_path.with_extension("");
        let template = format!("{}.%(ext)s", stem.to_string_lossy());

        let mut command = self.command();
        command
            .arg("--force-ipv4")
            .arg("--format")
            .arg(&format)
            .arg("--merge-output-format")
            .arg(MERGE_CONTAINER)
            .arg("--output")
            .arg(&template)
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--no-mtime")
            .arg("--newline")
            .arg("--progress-template")
            .arg(PROGRESS_TEMPLATE);
        self.append_cookies(&mut command);
        command
            .arg(video_url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::debug!(bin = %self.bin.display(), %format, %template, "spawning downloader");
        let mut child = command.spawn().map_err(|source| FetchError::Spawn {
            bin: self.bin.clone(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FetchError::Io(std::io::Error::other("stdout was not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FetchError::Io(std::io::Error::other("stderr was not captured")))?;

        // Drained on its own task so a chatty stderr never blocks stdout.
        let stderr_task = tokio::spawn(async move {
            let mut buffer = Vec::new();
            let _ = BufReader::new(stderr).read_to_end(&mut buffer).await;
            String::from_utf8_lossy(&buffer).into_owned()
        });

        let mut reader = BufReader::new(stdout);
        let mut parser = ProgressParser::new();
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                break;
            }
            if let Some(update) = parser.feed(&String::from_utf8_lossy(&line)) {
                // Nobody listening is fine; the download still completes.
                let _ = progress.send(update);
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(FetchError::Subprocess {
                status,
                stderr: stderr.trim().to_string(),
            });
        }

        let produced = find_produced_file(&stem)
            .await
            .ok_or_else(|| FetchError::MissingOutput(output_path.to_path_buf()))?;
        if produced != output_path {
            tokio::fs::rename(&produced, output_path)
                .await
                .map_err(|source| FetchError::Rename {
                    from: produced.clone(),
                    to: output_path.to_path_buf(),
                    source,
                })?;
        }

        let size = tokio::fs::metadata(output_path).await?.len();
        Ok(size)
    }
}

/// Locates the file yt-dlp wrote for `stem`, preferring the merge container.
async fn find_produced_file(stem: &Path) -> Option<PathBuf> {
    let preferred = stem.with_extension(MERGE_CONTAINER);
    if tokio::fs::metadata(&preferred)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
    {
        return Some(preferred);
    }

    let dir = stem.parent()?;
    let prefix = format!("{}.", stem.file_name()?.to_string_lossy());
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(ext) = name.strip_prefix(&prefix) else {
            continue;
        };
        // `stem.f137.mp4` style leftovers carry an extra dot.
        if ext.is_empty() || ext.contains('.') {
            continue;
        }
        if PARTIAL_SUFFIXES
            .iter()
            .any(|suffix| name.ends_with(suffix))
        {
            continue;
        }
        return Some(entry.path());
    }
    None
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use crate::progress::Phase;
    use std::{fs, os::unix::fs::PermissionsExt};
    use tempfile::tempdir;

    /// Writes an executable bash script that stands in for yt-dlp.
    pub(crate) fn install_stub(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("yt-dlp");
        let script = format!(
            r#"#!/usr/bin/env bash
set -eu
output=""
args=("$@")
for ((i = 0; i < ${{#args[@]}}; i++)); do
  if [[ "${{args[$i]}}" == "--output" ]]; then
    output="${{args[$((i + 1))]}}"
  fi
done
base="${{output%.*}}"
{body}
"#
        );
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn collect(mut rx: mpsc::UnboundedReceiver<ProgressUpdate>) -> Vec<ProgressUpdate> {
        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        updates
    }

    #[tokio::test]
    async fn fetch_reports_phases_and_returns_size() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            r#"
echo "[youtube] abc: Downloading webpage"
echo "  0.0%   10.00MiB    1.00KiB avc1.640028"
echo " 50.0%   10.00MiB    5.00MiB avc1.640028"
echo "100.0%   10.00MiB   10.00MiB avc1.640028"
echo "  0.0%    2.00MiB    1.00KiB none"
echo "100.0%    2.00MiB    2.00MiB none"
echo "[Merger] Merging formats into \"$base.mp4\""
printf 'merged-bytes' > "$base.mp4"
"#,
        );
        let ytdlp = YtDlp::new(stub, None);
        let target = dir.path().join("abc_1080.mp4");
        let (tx, rx) = mpsc::unbounded_channel();

        let size = ytdlp
            .fetch(&video_url("abc"), "1080", &target, tx)
            .await
            .unwrap();

        assert_eq!(size, "merged-bytes".len() as u64);
        assert!(target.exists());
        let updates = collect(rx);
        let phases: Vec<Phase> = updates.iter().map(|u| u.phase).collect();
        assert_eq!(
            phases,
            vec![
                Phase::Video,
                Phase::Video,
                Phase::Video,
                Phase::Audio,
                Phase::Audio,
                Phase::Merging
            ]
        );
        assert_eq!(updates.last().unwrap().percent, 95.0);
    }

    #[tokio::test]
    async fn fetch_renames_other_extensions_to_requested_path() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            r#"
printf 'webm-bytes' > "$base.webm"
"#,
        );
        let ytdlp = YtDlp::new(stub, None);
        let target = dir.path().join("abc_2160.mp4");
        let (tx, _rx) = mpsc::unbounded_channel();

        let size = ytdlp
            .fetch(&video_url("abc"), "2160", &target, tx)
            .await
            .unwrap();

        assert_eq!(size, "webm-bytes".len() as u64);
        assert_eq!(fs::read(&target).unwrap(), b"webm-bytes");
        assert!(!dir.path().join("abc_2160.webm").exists());
    }

    #[tokio::test]
    async fn fetch_strips_requested_extension_from_template() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("args.log");
        let stub = install_stub(
            dir.path(),
            &format!(
                r#"
printf '%s\n' "$@" > "{}"
printf 'x' > "$base.mp4"
"#,
                log.display()
            ),
        );
        let ytdlp = YtDlp::new(stub, None);
        let target = dir.path().join("abc_720.tmp");
        let (tx, _rx) = mpsc::unbounded_channel();

        ytdlp
            .fetch(&video_url("abc"), "720", &target, tx)
            .await
            .unwrap();

        let args = fs::read_to_string(&log).unwrap();
        let expected = format!("{}/abc_720.%(ext)s", dir.path().display());
        assert!(args.lines().any(|line| line == expected), "{args}");
        assert!(args.lines().any(|line| line == "--newline"));
        assert!(args.lines().any(|line| line == "--no-mtime"));
        assert!(args.lines().any(|line| line == "mp4"));
        assert!(target.exists());
        assert!(!dir.path().join("abc_720.mp4").exists());
    }

    #[tokio::test]
    async fn fetch_failure_carries_stderr() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            r#"
echo " 10.0% 10.00MiB 1.00MiB"
echo "ERROR: [youtube] abc: Video unavailable" >&2
exit 1
"#,
        );
        let ytdlp = YtDlp::new(stub, None);
        let (tx, rx) = mpsc::unbounded_channel();

        let err = ytdlp
            .fetch(&video_url("abc"), "1080", &dir.path().join("abc_1080.mp4"), tx)
            .await
            .unwrap_err();

        match err {
            FetchError::Subprocess { stderr, .. } => {
                assert!(stderr.contains("Video unavailable"), "{stderr}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(collect(rx).len(), 1);
    }

    #[tokio::test]
    async fn fetch_without_output_is_an_error() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "echo done");
        let ytdlp = YtDlp::new(stub, None);
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = ytdlp
            .fetch(&video_url("abc"), "1080", &dir.path().join("abc_1080.mp4"), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::MissingOutput(_)));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let dir = tempdir().unwrap();
        let ytdlp = YtDlp::new(dir.path().join("does-not-exist"), None);
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = ytdlp
            .fetch(&video_url("abc"), "1080", &dir.path().join("abc_1080.mp4"), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Spawn { .. }));
    }

    #[tokio::test]
    async fn stream_url_uses_progressive_format() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            r#"
format=""
for ((i = 0; i < ${#args[@]}; i++)); do
  if [[ "${args[$i]}" == "--format" ]]; then
    format="${args[$((i + 1))]}"
  fi
done
if [[ "$format" != "best[ext=mp4]/best" ]]; then
  echo "unexpected format $format" >&2
  exit 2
fi
echo ""
echo "https://upstream.example/videoplayback?id=abc"
"#,
        );
        let ytdlp = YtDlp::new(stub, None);
        let url = ytdlp.stream_url(&video_url("abc"), "auto").await.unwrap();
        assert_eq!(url, "https://upstream.example/videoplayback?id=abc");
    }

    #[tokio::test]
    async fn cookies_are_passed_only_when_present() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("args.log");
        let stub = install_stub(
            dir.path(),
            &format!(
                r#"
printf '%s\n' "$@" >> "{}"
echo "https://upstream.example/v"
"#,
                log.display()
            ),
        );
        let cookies = dir.path().join("cookies.txt");

        let ytdlp = YtDlp::new(stub.clone(), Some(cookies.clone()));
        ytdlp.stream_url(&video_url("abc"), "auto").await.unwrap();
        assert!(!fs::read_to_string(&log).unwrap().contains("--cookies"));

        fs::write(&cookies, "# Netscape HTTP Cookie File\n").unwrap();
        ytdlp.stream_url(&video_url("abc"), "auto").await.unwrap();
        assert!(fs::read_to_string(&log).unwrap().contains("--cookies"));
    }

    #[tokio::test]
    async fn available_heights_skips_audio_formats() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            r#"
cat <<'JSON'
{"id": "abc", "formats": [
  {"format_id": "140", "vcodec": "none", "height": null},
  {"format_id": "18", "vcodec": "avc1.42001E", "height": 360},
  {"format_id": "137", "vcodec": "avc1.640028", "height": 1080},
  {"format_id": "248", "vcodec": "vp9", "height": 1080},
  {"format_id": "sb0", "vcodec": "none", "height": 180}
]}
JSON
"#,
        );
        let ytdlp = YtDlp::new(stub, None);
        let heights = ytdlp.available_heights(&video_url("abc")).await.unwrap();
        assert_eq!(heights, vec![360, 1080]);
    }
}
