//! Probe and decode checks delegated to the external ffmpeg/ffprobe tools.
//!
//! Both the encode driver and the scanner consume the same capability set,
//! captured by [`MediaToolkit`] so tests can substitute a stub.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Substrings of encoder stderr lines counted as decoder errors during
/// corruption sampling (matched case-insensitively).
pub const ERROR_LINE_MARKERS: &[&str] = &[
    "invalid",
    "error",
    "corrupt",
    "missing picture",
    "non-existing pps",
    "no frame",
    "duplicate",
    "reserved bit",
];

/// Error type for media tool invocations
#[derive(Debug, Error)]
pub enum MediaError {
    /// The tool did not finish within its allotted time
    #[error("probe timeout after {0:?}")]
    Timeout(Duration),

    /// The stream check rejected the file
    #[error("file check failed: {0}")]
    StreamCheck(String),

    /// A decode pass rejected the file
    #[error("decode test failed: {0}")]
    Decode(String),

    /// The tool could not be started
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },

    /// The reported duration could not be parsed
    #[error("could not parse duration: {0}")]
    Duration(String),
}

/// Capability set shared by the encode driver and the scanner.
#[async_trait]
pub trait MediaToolkit: Send + Sync {
    /// Confirm a valid video stream; with `decode_seconds > 0` also decode
    /// the head of the file, tolerating warnings that name no corruption.
    async fn probe(
        &self,
        path: &Path,
        timeout: Duration,
        decode_seconds: u32,
    ) -> Result<(), MediaError>;

    /// Decode `decode_seconds` starting at `seek_seconds`, failing on any
    /// decoder warning.
    async fn decode_strict(
        &self,
        path: &Path,
        timeout: Duration,
        seek_seconds: u32,
        decode_seconds: u32,
    ) -> Result<(), MediaError>;

    /// Sample-decode the head of the file and count decoder-error lines.
    async fn count_decoder_errors(
        &self,
        path: &Path,
        timeout: Duration,
        sample_seconds: u32,
    ) -> Result<u32, MediaError>;

    /// The container-reported duration in seconds.
    async fn duration(&self, path: &Path, timeout: Duration) -> Result<f64, MediaError>;
}

/// Production toolkit shelling out to ffmpeg/ffprobe.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
        }
    }
}

impl Ffmpeg {
    async fn run(
        &self,
        bin: &Path,
        args: &[String],
        timeout: Duration,
    ) -> Result<Output, MediaError> {
        let mut cmd = Command::new(bin);
        cmd.args(args).kill_on_drop(true);

        let result = tokio::time::timeout(timeout, cmd.output()).await;
        match result {
            Err(_) => Err(MediaError::Timeout(timeout)),
            Ok(Err(source)) => Err(MediaError::Spawn {
                tool: bin.display().to_string(),
                source,
            }),
            Ok(Ok(output)) => Ok(output),
        }
    }
}

#[async_trait]
impl MediaToolkit for Ffmpeg {
    async fn probe(
        &self,
        path: &Path,
        timeout: Duration,
        decode_seconds: u32,
    ) -> Result<(), MediaError> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-select_streams".to_string(),
            "v:0".to_string(),
            "-show_entries".to_string(),
            "stream=codec_name,duration".to_string(),
            "-of".to_string(),
            "default=noprint_wrappers=1".to_string(),
            path.display().to_string(),
        ];
        let output = self.run(&self.ffprobe_bin, &args, timeout).await?;

        if !output.status.success() {
            return Err(MediaError::StreamCheck(format!(
                "{}: {}",
                output.status,
                tail_of(&String::from_utf8_lossy(&output.stderr), 500)
            )));
        }
        if output.stdout.is_empty() {
            return Err(MediaError::StreamCheck(
                "no video stream detected".to_string(),
            ));
        }

        if decode_seconds == 0 {
            return Ok(());
        }

        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-t".to_string(),
            decode_seconds.to_string(),
            "-i".to_string(),
            path.display().to_string(),
            "-f".to_string(),
            "null".to_string(),
            "-".to_string(),
        ];
        let output = self.run(&self.ffmpeg_bin, &args, timeout).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        // A tolerant pass: only decoder output that names corruption fails
        // the check, matching the behavior of a plain playability test.
        if !output.status.success() && (stderr.contains("Invalid") || stderr.contains("Error")) {
            return Err(MediaError::Decode(tail_of(&stderr, 500)));
        }

        Ok(())
    }

    async fn decode_strict(
        &self,
        path: &Path,
        timeout: Duration,
        seek_seconds: u32,
        decode_seconds: u32,
    ) -> Result<(), MediaError> {
        let mut args = vec!["-v".to_string(), "error".to_string()];
        if seek_seconds > 0 {
            args.push("-ss".to_string());
            args.push(seek_seconds.to_string());
        }
        args.extend([
            "-t".to_string(),
            decode_seconds.to_string(),
            "-i".to_string(),
            path.display().to_string(),
            "-f".to_string(),
            "null".to_string(),
            "-".to_string(),
        ]);

        let output = self.run(&self.ffmpeg_bin, &args, timeout).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        // Strict: any decoder warning is a failure
        if !output.status.success() || !stderr.trim().is_empty() {
            return Err(MediaError::Decode(tail_of(&stderr, 500)));
        }
        Ok(())
    }

    async fn count_decoder_errors(
        &self,
        path: &Path,
        timeout: Duration,
        sample_seconds: u32,
    ) -> Result<u32, MediaError> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-t".to_string(),
            sample_seconds.to_string(),
            "-i".to_string(),
            path.display().to_string(),
            "-f".to_string(),
            "null".to_string(),
            "-".to_string(),
        ];
        let output = self.run(&self.ffmpeg_bin, &args, timeout).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(count_error_lines(&stderr))
    }

    async fn duration(&self, path: &Path, timeout: Duration) -> Result<f64, MediaError> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-show_entries".to_string(),
            "format=duration".to_string(),
            "-of".to_string(),
            "default=noprint_wrappers=1:nokey=1".to_string(),
            path.display().to_string(),
        ];
        let output = self.run(&self.ffprobe_bin, &args, timeout).await?;

        if !output.status.success() {
            return Err(MediaError::Duration(tail_of(
                &String::from_utf8_lossy(&output.stderr),
                200,
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let text = text.trim();
        text.parse::<f64>()
            .map_err(|_| MediaError::Duration(text.to_string()))
    }
}

/// Count stderr lines carrying any decoder-error marker.
pub fn count_error_lines(stderr: &str) -> u32 {
    stderr
        .lines()
        .filter(|line| {
            let lower = line.to_lowercase();
            ERROR_LINE_MARKERS.iter().any(|m| lower.contains(m))
        })
        .count() as u32
}

/// Last `max_len` bytes of a diagnostic blob, prefixed with an ellipsis
/// when truncated. Cuts on a char boundary.
pub fn tail_of(text: &str, max_len: usize) -> String {
    let text = text.trim();
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut start = text.len() - max_len;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}
