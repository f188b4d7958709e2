//! Merge engine: ffmpeg/ffprobe invocation.
//!
//! The engine validates both inputs, probes them for the required streams and
//! then runs a single ffmpeg process that copies the first video stream of the
//! video input and re-encodes the first audio stream of the audio input into
//! one MP4 container. The output is written beside the destination under a
//! hidden temporary name and renamed into place, so the destination is either
//! absent or complete.
//!
//! Every process runs under a deadline and is killed when the deadline passes
//! or the caller's cancellation token fires.

use crate::config::MediaConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Audio codec used when the caller passes a blank one
pub const DEFAULT_AUDIO_CODEC: &str = "aac";

/// Ceiling for one tool invocation when the caller sets no deadline
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(10 * 60);

const PROBE_STDERR_TAIL: usize = 8 << 10;
const MERGE_STDERR_TAIL: usize = 16 << 10;

/// Result type for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors raised by the merge engine
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("{name} not found: {source}")]
    BinaryNotFound {
        name: String,
        #[source]
        source: which::Error,
    },

    #[error("{role} input {path}: {reason}")]
    InvalidInput {
        role: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error("input {role} has no {stream} stream")]
    MissingStream {
        role: &'static str,
        stream: &'static str,
    },

    #[error("probe: stat {path}: {source}")]
    ProbeTarget {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("ffprobe failed ({status}): {stderr}")]
    ProbeFailed { status: String, stderr: String },

    #[error("ffprobe json parse: {0}")]
    ProbeParse(#[from] serde_json::Error),

    #[error("ffmpeg merge failed ({status}): {stderr}")]
    MergeFailed { status: String, stderr: String },

    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{tool} timed out after {after:?}")]
    Timeout { tool: &'static str, after: Duration },

    #[error("{tool} cancelled")]
    Cancelled { tool: &'static str },

    #[error("rename output {from} -> {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl MediaError {
    /// True for failures caused by the inputs themselves, which no retry fixes
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            MediaError::InvalidInput { .. } | MediaError::MissingStream { .. }
        )
    }
}

/// Stream layout and duration reported by ffprobe
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamInfo {
    pub format: String,
    pub has_video: bool,
    pub has_audio: bool,
    pub duration_sec: f64,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    codec_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    #[serde(default)]
    format_name: Option<String>,
    #[serde(default)]
    duration: Option<serde_json::Value>,
}

impl StreamInfo {
    /// Parse `ffprobe -print_format json -show_streams -show_format` output.
    ///
    /// A missing or unparseable duration leaves `duration_sec` at zero.
    pub fn from_ffprobe_json(stdout: &[u8]) -> MediaResult<Self> {
        let probe: FfprobeOutput = serde_json::from_slice(stdout)?;

        let mut info = StreamInfo {
            format: probe.format.format_name.unwrap_or_default(),
            ..Default::default()
        };

        for stream in &probe.streams {
            match stream.codec_type.as_deref() {
                Some("video") => info.has_video = true,
                Some("audio") => info.has_audio = true,
                _ => {}
            }
        }

        info.duration_sec = probe
            .format
            .duration
            .as_ref()
            .and_then(parse_duration)
            .unwrap_or(0.0);

        Ok(info)
    }
}

fn parse_duration(value: &serde_json::Value) -> Option<f64> {
    let seconds = match value {
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        serde_json::Value::Number(n) => n.as_f64()?,
        _ => return None,
    };

    (seconds.is_finite() && seconds >= 0.0).then_some(seconds)
}

/// Cancellation and deadline for one engine call
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Media capability consumed by the job handler
#[async_trait]
pub trait MediaTool: Send + Sync {
    /// Inspect a local media file
    async fn probe(&self, path: &Path, ctx: &CallContext) -> MediaResult<StreamInfo>;

    /// Merge the video stream of `video` with the audio stream of `audio` into `out`
    async fn merge(
        &self,
        video: &Path,
        audio: &Path,
        out: &Path,
        audio_codec: &str,
        ctx: &CallContext,
    ) -> MediaResult<()>;
}

/// ffmpeg/ffprobe backed merge engine
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    ffmpeg_bin: String,
    ffprobe_bin: String,
    default_timeout: Duration,
}

impl Ffmpeg {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            ffmpeg_bin: config.ffmpeg_bin.clone(),
            ffprobe_bin: config.ffprobe_bin.clone(),
            default_timeout: config.timeout(),
        }
    }

    /// Use explicit executables (names on `PATH` or paths)
    pub fn with_binaries(ffmpeg_bin: impl Into<String>, ffprobe_bin: impl Into<String>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
            default_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Resolve both executables
    pub fn ensure_binaries(&self) -> MediaResult<(PathBuf, PathBuf)> {
        Ok((
            resolve_binary(&self.ffmpeg_bin)?,
            resolve_binary(&self.ffprobe_bin)?,
        ))
    }

    async fn run(
        &self,
        tool: &'static str,
        bin: &Path,
        args: &[OsString],
        ctx: &CallContext,
    ) -> MediaResult<Output> {
        let deadline = ctx
            .deadline
            .unwrap_or_else(|| Instant::now() + self.default_timeout);
        let budget = deadline.saturating_duration_since(Instant::now());

        debug!(tool, bin = %bin.display(), ?args, "Running media tool");

        let child = Command::new(bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| MediaError::Spawn { tool, source })?;

        // Dropping the wait future drops the child, which kills it.
        tokio::select! {
            output = child.wait_with_output() => Ok(output?),
            _ = tokio::time::sleep_until(deadline) => {
                warn!(tool, timeout = ?budget, "Media tool timed out, killing process");
                Err(MediaError::Timeout { tool, after: budget })
            }
            _ = ctx.cancel.cancelled() => {
                warn!(tool, "Media tool cancelled, killing process");
                Err(MediaError::Cancelled { tool })
            }
        }
    }

    async fn run_probe(&self, ffprobe: &Path, path: &Path, ctx: &CallContext) -> MediaResult<StreamInfo> {
        if let Err(source) = tokio::fs::metadata(path).await {
            return Err(MediaError::ProbeTarget {
                path: path.to_path_buf(),
                source,
            });
        }

        let output = self.run("ffprobe", ffprobe, &probe_args(path), ctx).await?;

        if !output.status.success() {
            return Err(MediaError::ProbeFailed {
                status: output.status.to_string(),
                stderr: tail(&output.stderr, PROBE_STDERR_TAIL),
            });
        }

        StreamInfo::from_ffprobe_json(&output.stdout)
    }
}

#[async_trait]
impl MediaTool for Ffmpeg {
    #[instrument(skip_all, fields(path = %path.display()))]
    async fn probe(&self, path: &Path, ctx: &CallContext) -> MediaResult<StreamInfo> {
        let ffprobe = resolve_binary(&self.ffprobe_bin)?;
        self.run_probe(&ffprobe, path, ctx).await
    }

    #[instrument(skip_all, fields(video = %video.display(), audio = %audio.display(), out = %out.display()))]
    async fn merge(
        &self,
        video: &Path,
        audio: &Path,
        out: &Path,
        audio_codec: &str,
        ctx: &CallContext,
    ) -> MediaResult<()> {
        let (ffmpeg, ffprobe) = self.ensure_binaries()?;

        ensure_readable("video", video).await?;
        ensure_readable("audio", audio).await?;

        let video_info = self.run_probe(&ffprobe, video, ctx).await?;
        let audio_info = self.run_probe(&ffprobe, audio, ctx).await?;

        if !video_info.has_video {
            return Err(MediaError::MissingStream {
                role: "video",
                stream: "video",
            });
        }
        if !audio_info.has_audio {
            return Err(MediaError::MissingStream {
                role: "audio",
                stream: "audio",
            });
        }

        let tmp = temp_output_path(out).ok_or_else(|| MediaError::InvalidInput {
            role: "output",
            path: out.to_path_buf(),
            reason: "path has no file name".to_string(),
        })?;

        // Leftover from a crashed attempt at the same destination
        remove_if_exists(&tmp).await?;

        let args = merge_args(video, audio, &tmp, audio_codec);
        let output = match self.run("ffmpeg", &ffmpeg, &args, ctx).await {
            Ok(output) => output,
            Err(e) => {
                discard(&tmp).await;
                return Err(e);
            }
        };

        if !output.status.success() {
            discard(&tmp).await;
            return Err(MediaError::MergeFailed {
                status: output.status.to_string(),
                stderr: tail(&output.stderr, MERGE_STDERR_TAIL),
            });
        }

        if let Err(source) = tokio::fs::rename(&tmp, out).await {
            discard(&tmp).await;
            return Err(MediaError::Rename {
                from: tmp,
                to: out.to_path_buf(),
                source,
            });
        }

        debug!(
            video_format = %video_info.format,
            audio_format = %audio_info.format,
            "Merge output renamed into place"
        );

        Ok(())
    }
}

fn resolve_binary(name: &str) -> MediaResult<PathBuf> {
    which::which(name).map_err(|source| MediaError::BinaryNotFound {
        name: name.to_string(),
        source,
    })
}

/// Blank codecs fall back to AAC
pub fn resolve_audio_codec(codec: &str) -> &str {
    let codec = codec.trim();
    if codec.is_empty() {
        DEFAULT_AUDIO_CODEC
    } else {
        codec
    }
}

/// ffprobe arguments for a structured stream/format report
pub fn probe_args(path: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-v", "error", "-print_format", "json", "-show_streams", "-show_format"]
        .into_iter()
        .map(OsString::from)
        .collect();
    args.push(path.as_os_str().to_owned());
    args
}

/// ffmpeg arguments for a shortest-stream merge into `out`
pub fn merge_args(video: &Path, audio: &Path, out: &Path, audio_codec: &str) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::with_capacity(24);
    let mut push = |arg: &str| args.push(OsString::from(arg));

    push("-v");
    push("error");
    push("-nostdin");
    push("-y");
    push("-i");
    args.push(video.as_os_str().to_owned());
    args.push(OsString::from("-i"));
    args.push(audio.as_os_str().to_owned());

    for arg in [
        "-map",
        "0:v:0",
        "-map",
        "1:a:0",
        "-c:v",
        "copy",
        "-f",
        "mp4",
        "-c:a",
        resolve_audio_codec(audio_codec),
        "-shortest",
    ] {
        args.push(OsString::from(arg));
    }

    args.push(out.as_os_str().to_owned());
    args
}

/// Hidden temporary path beside `out`: `dir/.name.tmp`
pub fn temp_output_path(out: &Path) -> Option<PathBuf> {
    let name = out.file_name()?;
    let mut tmp_name = OsString::from(".");
    tmp_name.push(name);
    tmp_name.push(".tmp");

    Some(match out.parent() {
        Some(parent) => parent.join(tmp_name),
        None => PathBuf::from(tmp_name),
    })
}

async fn ensure_readable(role: &'static str, path: &Path) -> MediaResult<()> {
    let invalid = |reason: String| MediaError::InvalidInput {
        role,
        path: path.to_path_buf(),
        reason,
    };

    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| invalid(e.to_string()))?;

    if !metadata.is_file() {
        return Err(invalid("not a regular file".to_string()));
    }

    tokio::fs::File::open(path)
        .await
        .map_err(|e| invalid(format!("not readable: {}", e)))?;

    Ok(())
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

async fn discard(path: &Path) {
    if let Err(e) = remove_if_exists(path).await {
        warn!(path = %path.display(), error = %e, "Failed to remove temporary output");
    }
}

fn tail(bytes: &[u8], max: usize) -> String {
    let start = bytes.len().saturating_sub(max);
    String::from_utf8_lossy(&bytes[start..]).trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const AV_PROBE: &str = r#"{"streams":[{"codec_type":"video"},{"codec_type":"audio"}],"format":{"format_name":"mov,mp4,m4a,3gp,3g2,mj2","duration":"12.480000"}}"#;
    const AUDIO_PROBE: &str = r#"{"streams":[{"codec_type":"audio"}],"format":{"format_name":"mov,mp4,m4a,3gp,3g2,mj2","duration":"9.75"}}"#;

    fn args_as_strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn test_merge_args_shape() {
        let args = merge_args(
            Path::new("/w/video_in.mp4"),
            Path::new("/w/audio_in.m4a"),
            Path::new("/w/.merged_out.mp4.tmp"),
            "libopus",
        );

        assert_eq!(
            args_as_strings(&args),
            vec![
                "-v", "error", "-nostdin", "-y",
                "-i", "/w/video_in.mp4",
                "-i", "/w/audio_in.m4a",
                "-map", "0:v:0", "-map", "1:a:0",
                "-c:v", "copy",
                "-f", "mp4",
                "-c:a", "libopus",
                "-shortest",
                "/w/.merged_out.mp4.tmp",
            ]
        );
    }

    #[test]
    fn test_blank_codec_defaults_to_aac() {
        assert_eq!(resolve_audio_codec(""), "aac");
        assert_eq!(resolve_audio_codec("   "), "aac");
        assert_eq!(resolve_audio_codec(" opus "), "opus");

        let args = args_as_strings(&merge_args(
            Path::new("v"),
            Path::new("a"),
            Path::new("o"),
            "",
        ));
        let codec_pos = args.iter().position(|a| a == "-c:a").unwrap();
        assert_eq!(args[codec_pos + 1], "aac");
    }

    #[test]
    fn test_probe_args() {
        assert_eq!(
            args_as_strings(&probe_args(Path::new("in.mp4"))),
            vec!["-v", "error", "-print_format", "json", "-show_streams", "-show_format", "in.mp4"]
        );
    }

    #[test]
    fn test_temp_output_path() {
        assert_eq!(
            temp_output_path(Path::new("/work/merged_out.mp4")),
            Some(PathBuf::from("/work/.merged_out.mp4.tmp"))
        );
        assert_eq!(
            temp_output_path(Path::new("merged.mp4")),
            Some(PathBuf::from(".merged.mp4.tmp"))
        );
        assert_eq!(temp_output_path(Path::new("/")), None);
    }

    #[test]
    fn test_stream_info_from_ffprobe_json() {
        let info = StreamInfo::from_ffprobe_json(AV_PROBE.as_bytes()).unwrap();
        assert!(info.has_video);
        assert!(info.has_audio);
        assert_eq!(info.format, "mov,mp4,m4a,3gp,3g2,mj2");
        assert!((info.duration_sec - 12.48).abs() < 1e-9);

        let audio = StreamInfo::from_ffprobe_json(AUDIO_PROBE.as_bytes()).unwrap();
        assert!(!audio.has_video);
        assert!(audio.has_audio);
    }

    #[test]
    fn test_unparseable_duration_is_zero() {
        let na = r#"{"streams":[{"codec_type":"video"}],"format":{"format_name":"matroska","duration":"N/A"}}"#;
        assert_eq!(StreamInfo::from_ffprobe_json(na.as_bytes()).unwrap().duration_sec, 0.0);

        let missing = r#"{"streams":[{"codec_type":"data"}],"format":{}}"#;
        let info = StreamInfo::from_ffprobe_json(missing.as_bytes()).unwrap();
        assert_eq!(info.duration_sec, 0.0);
        assert!(!info.has_video && !info.has_audio);

        let negative = r#"{"format":{"duration":"-3.0"}}"#;
        assert_eq!(StreamInfo::from_ffprobe_json(negative.as_bytes()).unwrap().duration_sec, 0.0);

        let numeric = r#"{"format":{"duration":4.5}}"#;
        assert_eq!(StreamInfo::from_ffprobe_json(numeric.as_bytes()).unwrap().duration_sec, 4.5);
    }

    #[test]
    fn test_garbage_probe_output_fails() {
        assert!(matches!(
            StreamInfo::from_ffprobe_json(b"not json"),
            Err(MediaError::ProbeParse(_))
        ));
    }

    #[test]
    fn test_tail_keeps_the_end() {
        assert_eq!(tail(b"short\n", 100), "short");
        assert_eq!(tail(b"0123456789", 4), "6789");
    }

    #[test]
    fn test_missing_stream_message() {
        let err = MediaError::MissingStream {
            role: "video",
            stream: "video",
        };
        assert_eq!(err.to_string(), "input video has no video stream");
        assert!(err.is_validation());
    }

    /// Shell-script stand-ins for ffmpeg and ffprobe.
    ///
    /// The fake ffprobe prints the contents of the file it is asked about, so
    /// each test input holds the probe JSON it should report.
    #[cfg(unix)]
    mod fake_tools {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        pub struct Toolbox {
            pub dir: TempDir,
        }

        impl Toolbox {
            pub fn new() -> Self {
                let toolbox = Self {
                    dir: tempfile::tempdir().unwrap(),
                };
                toolbox.script("ffprobe", "for last; do :; done\ncat \"$last\"\n");
                toolbox
            }

            pub fn path(&self, name: &str) -> PathBuf {
                self.dir.path().join(name)
            }

            pub fn script(&self, name: &str, body: &str) -> PathBuf {
                let path = self.path(name);
                std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
                path
            }

            pub fn input(&self, name: &str, probe_json: &str) -> PathBuf {
                let path = self.path(name);
                std::fs::write(&path, probe_json).unwrap();
                path
            }

            pub fn engine(&self) -> Ffmpeg {
                Ffmpeg::with_binaries(
                    self.path("ffmpeg").to_string_lossy(),
                    self.path("ffprobe").to_string_lossy(),
                )
            }
        }
    }

    #[cfg(unix)]
    mod process {
        use super::fake_tools::Toolbox;
        use super::*;

        #[tokio::test]
        async fn test_merge_renames_complete_output() {
            let tools = Toolbox::new();
            let log = tools.path("args.log");
            tools.script(
                "ffmpeg",
                &format!(
                    "printf '%s\\n' \"$@\" > '{}'\nfor last; do :; done\nprintf 'merged' >> \"$last\"\n",
                    log.display()
                ),
            );
            let video = tools.input("video.mp4", AV_PROBE);
            let audio = tools.input("audio.m4a", AUDIO_PROBE);
            let out = tools.path("merged_out.mp4");
            let stale = tools.path(".merged_out.mp4.tmp");
            std::fs::write(&stale, "stale").unwrap();

            tools
                .engine()
                .merge(&video, &audio, &out, "aac", &CallContext::default())
                .await
                .unwrap();

            assert_eq!(std::fs::read_to_string(&out).unwrap(), "merged");
            assert!(!stale.exists());

            let logged = std::fs::read_to_string(&log).unwrap();
            let logged: Vec<&str> = logged.lines().collect();
            assert_eq!(logged.last().copied(), Some(stale.to_str().unwrap()));
            assert!(logged.contains(&"-shortest"));
        }

        #[tokio::test]
        async fn test_video_without_video_stream_never_spawns_ffmpeg() {
            let tools = Toolbox::new();
            let marker = tools.path("ffmpeg.ran");
            tools.script("ffmpeg", &format!("touch '{}'\n", marker.display()));
            let video = tools.input("video.mp4", AUDIO_PROBE);
            let audio = tools.input("audio.m4a", AUDIO_PROBE);
            let out = tools.path("merged_out.mp4");

            let err = tools
                .engine()
                .merge(&video, &audio, &out, "aac", &CallContext::default())
                .await
                .unwrap_err();

            assert!(matches!(
                err,
                MediaError::MissingStream {
                    role: "video",
                    stream: "video"
                }
            ));
            assert!(err.to_string().contains("no video stream"));
            assert!(!marker.exists());
            assert!(!out.exists());
        }

        #[tokio::test]
        async fn test_audio_without_audio_stream_is_rejected() {
            let tools = Toolbox::new();
            tools.script("ffmpeg", "exit 0\n");
            let video = tools.input("video.mp4", AV_PROBE);
            let audio = tools.input(
                "audio.m4a",
                r#"{"streams":[{"codec_type":"video"}],"format":{"format_name":"mp4"}}"#,
            );

            let err = tools
                .engine()
                .merge(&video, &audio, &tools.path("out.mp4"), "aac", &CallContext::default())
                .await
                .unwrap_err();

            assert!(matches!(err, MediaError::MissingStream { role: "audio", .. }));
        }

        #[tokio::test]
        async fn test_interrupted_merge_leaves_no_destination() {
            let tools = Toolbox::new();
            tools.script(
                "ffmpeg",
                "for last; do :; done\nprintf 'partial' > \"$last\"\nexec sleep 30\n",
            );
            let video = tools.input("video.mp4", AV_PROBE);
            let audio = tools.input("audio.m4a", AUDIO_PROBE);
            let out = tools.path("merged_out.mp4");

            let ctx = CallContext::default().with_timeout(Duration::from_millis(500));
            let err = tools
                .engine()
                .merge(&video, &audio, &out, "aac", &ctx)
                .await
                .unwrap_err();

            assert!(matches!(err, MediaError::Timeout { tool: "ffmpeg", .. }));
            assert!(!out.exists());
            assert!(!tools.path(".merged_out.mp4.tmp").exists());
        }

        #[tokio::test]
        async fn test_default_timeout_applies_without_deadline() {
            let tools = Toolbox::new();
            tools.script("ffmpeg", "exec sleep 30\n");
            let video = tools.input("video.mp4", AV_PROBE);
            let audio = tools.input("audio.m4a", AUDIO_PROBE);

            let err = tools
                .engine()
                .with_default_timeout(Duration::from_millis(300))
                .merge(&video, &audio, &tools.path("out.mp4"), "aac", &CallContext::default())
                .await
                .unwrap_err();

            assert!(matches!(err, MediaError::Timeout { .. }));
        }

        #[tokio::test]
        async fn test_cancellation_kills_merge() {
            let tools = Toolbox::new();
            tools.script("ffmpeg", "exec sleep 30\n");
            let video = tools.input("video.mp4", AV_PROBE);
            let audio = tools.input("audio.m4a", AUDIO_PROBE);

            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                trigger.cancel();
            });

            let err = tools
                .engine()
                .merge(&video, &audio, &tools.path("out.mp4"), "aac", &CallContext::new(cancel))
                .await
                .unwrap_err();

            assert!(matches!(err, MediaError::Cancelled { tool: "ffmpeg" }));
        }

        #[tokio::test]
        async fn test_tool_failure_reports_stderr() {
            let tools = Toolbox::new();
            tools.script(
                "ffmpeg",
                "for last; do :; done\nprintf 'x' > \"$last\"\necho 'Invalid data found' >&2\nexit 1\n",
            );
            let video = tools.input("video.mp4", AV_PROBE);
            let audio = tools.input("audio.m4a", AUDIO_PROBE);
            let out = tools.path("out.mp4");

            let err = tools
                .engine()
                .merge(&video, &audio, &out, "aac", &CallContext::default())
                .await
                .unwrap_err();

            match err {
                MediaError::MergeFailed { stderr, .. } => assert_eq!(stderr, "Invalid data found"),
                other => panic!("unexpected error: {other}"),
            }
            assert!(!out.exists());
            assert!(!tools.path(".out.mp4.tmp").exists());
        }

        #[tokio::test]
        async fn test_rename_failure_removes_temp_output() {
            let tools = Toolbox::new();
            tools.script(
                "ffmpeg",
                "for last; do :; done\nprintf 'merged' > \"$last\"\n",
            );
            let video = tools.input("video.mp4", AV_PROBE);
            let audio = tools.input("audio.m4a", AUDIO_PROBE);
            let out = tools.path("out.mp4");
            std::fs::create_dir(&out).unwrap();
            std::fs::write(out.join("occupied"), "x").unwrap();

            let err = tools
                .engine()
                .merge(&video, &audio, &out, "aac", &CallContext::default())
                .await
                .unwrap_err();

            assert!(matches!(err, MediaError::Rename { .. }));
            assert!(err.to_string().contains(".out.mp4.tmp"));
            assert!(!tools.path(".out.mp4.tmp").exists());
            assert!(out.join("occupied").exists());
        }

        #[tokio::test]
        async fn test_directory_input_is_invalid() {
            let tools = Toolbox::new();
            tools.script("ffmpeg", "exit 0\n");
            let audio = tools.input("audio.m4a", AUDIO_PROBE);

            let err = tools
                .engine()
                .merge(tools.dir.path(), &audio, &tools.path("out.mp4"), "aac", &CallContext::default())
                .await
                .unwrap_err();

            assert!(matches!(err, MediaError::InvalidInput { role: "video", .. }));
        }

        #[tokio::test]
        async fn test_missing_binary() {
            let tools = Toolbox::new();
            let video = tools.input("video.mp4", AV_PROBE);
            let audio = tools.input("audio.m4a", AUDIO_PROBE);

            // No ffmpeg script written
            let err = tools
                .engine()
                .merge(&video, &audio, &tools.path("out.mp4"), "aac", &CallContext::default())
                .await
                .unwrap_err();

            assert!(matches!(err, MediaError::BinaryNotFound { .. }));
        }

        #[tokio::test]
        async fn test_probe_missing_path() {
            let tools = Toolbox::new();
            let err = tools
                .engine()
                .probe(&tools.path("nope.mp4"), &CallContext::default())
                .await
                .unwrap_err();

            assert!(matches!(err, MediaError::ProbeTarget { .. }));
        }

        #[tokio::test]
        async fn test_probe_reads_duration() {
            let tools = Toolbox::new();
            let video = tools.input("video.mp4", AV_PROBE);

            let info = tools
                .engine()
                .probe(&video, &CallContext::default())
                .await
                .unwrap();

            assert!(info.has_video && info.has_audio);
            assert!((info.duration_sec - 12.48).abs() < 1e-9);
        }
    }
}
