//! Transcoder command-line construction and spawning.
//!
//! One call to a `spawn_*` method creates exactly one OS process. The caller
//! owns the returned [`Child`] and is responsible for reaping it; every child
//! is also marked `kill_on_drop` so a dropped handle never leaks a process.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use cr_core::config::ToolsConfig;
use cr_core::stream::{FrameParams, SegmentParams};
use cr_core::{Error, Result};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::source::SourceUri;
use crate::tools::resolve_transcoder;

/// A running frame-mode transcoder with its output pipes split out.
#[derive(Debug)]
pub struct FrameProcess {
    pub child: Child,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Where a segmented-mode transcoder writes its playlist and segments.
#[derive(Debug, Clone)]
pub struct SegmentOutput {
    /// Per-session output directory.
    pub dir: PathBuf,
    /// Playlist file name, e.g. `stream.m3u8`.
    pub playlist_name: String,
    /// Segment extension without the dot, e.g. `ts`.
    pub segment_extension: String,
}

impl SegmentOutput {
    pub fn playlist_path(&self) -> PathBuf {
        self.dir.join(&self.playlist_name)
    }

    /// `<dir>/<playlist stem>%d.<ext>`, the transcoder's segment naming pattern.
    pub fn segment_pattern(&self) -> PathBuf {
        let stem = Path::new(&self.playlist_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "stream".to_string());
        self.dir.join(format!("{stem}%d.{}", self.segment_extension))
    }
}

/// Builds and spawns transcoder invocations.
#[derive(Debug, Clone)]
pub struct TranscoderLauncher {
    program: PathBuf,
    leading_args: Vec<String>,
}

impl TranscoderLauncher {
    pub fn new(program: impl Into<PathBuf>, leading_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            leading_args,
        }
    }

    /// Resolve the program from config (explicit path, `PATH`, bare name).
    pub fn from_config(tools: &ToolsConfig) -> Self {
        Self::new(resolve_transcoder(tools), tools.ffmpeg_leading_args.clone())
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments for frame mode: MJPEG on stdout.
    pub fn frame_args(source: &SourceUri, params: &FrameParams) -> Vec<String> {
        let mut args = base_args();
        if source.is_rtsp() {
            args.extend(["-rtsp_transport".into(), "tcp".into()]);
        }
        args.extend([
            "-i".into(),
            source.as_str().to_string(),
            "-f".into(),
            "mjpeg".into(),
            "-q:v".into(),
            params.quality.to_string(),
            "-update".into(),
            "1".into(),
            "-r".into(),
            params.frame_rate.to_string(),
            "-".into(),
        ]);
        args
    }

    /// Arguments for segmented mode: H.264/AAC HLS into `output.dir`.
    pub fn segment_args(
        source: &SourceUri,
        params: &SegmentParams,
        output: &SegmentOutput,
    ) -> Vec<String> {
        let mut args = base_args();
        args.extend(["-fflags".into(), "nobuffer".into()]);
        if source.is_rtsp() {
            args.extend([
                "-rtsp_transport".into(),
                "tcp".into(),
                "-rtsp_flags".into(),
                "prefer_tcp".into(),
            ]);
        }
        args.extend([
            "-i".into(),
            source.as_str().to_string(),
            // Video
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "ultrafast".into(),
            "-tune".into(),
            "zerolatency".into(),
            "-profile:v".into(),
            "baseline".into(),
            "-b:v".into(),
            format!("{}k", params.video_bitrate_kbps),
            "-maxrate".into(),
            format!("{}k", params.max_rate_kbps),
            "-bufsize".into(),
            format!("{}k", params.buffer_size_kbps),
            "-g".into(),
            params.keyframe_interval.to_string(),
            // Audio
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            format!("{}k", params.audio_bitrate_kbps),
            // HLS
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            params.segment_duration_secs.to_string(),
            "-hls_list_size".into(),
            params.segment_count.to_string(),
            "-hls_flags".into(),
            "delete_segments+append_list+independent_segments".into(),
            "-hls_segment_type".into(),
            "mpegts".into(),
            "-hls_segment_filename".into(),
            output.segment_pattern().to_string_lossy().into_owned(),
            output.playlist_path().to_string_lossy().into_owned(),
        ]);
        args
    }

    /// Spawn a frame-mode transcoder with stdout and stderr piped.
    pub fn spawn_frames(&self, source: &SourceUri, params: &FrameParams) -> Result<FrameProcess> {
        let args = Self::frame_args(source, params);
        tracing::info!(
            program = %self.program.display(),
            source = %source,
            fps = params.frame_rate,
            "Spawning frame transcoder"
        );

        let mut child = self
            .command(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::spawn(self.tool_name(), e.to_string()))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            // Unreachable with piped stdio, but never leave the child behind.
            let _ = child.start_kill();
            return Err(Error::Internal("transcoder pipes were not captured".into()));
        };

        Ok(FrameProcess {
            child,
            stdout,
            stderr,
        })
    }

    /// Spawn a segmented-mode transcoder writing into `output.dir`, with both
    /// output streams appended to `log_path`.
    pub async fn spawn_segments(
        &self,
        source: &SourceUri,
        params: &SegmentParams,
        output: &SegmentOutput,
        log_path: &Path,
    ) -> Result<Child> {
        tokio::fs::create_dir_all(&output.dir).await?;

        let log = tokio::fs::File::create(log_path).await?.into_std().await;
        let log_err = log.try_clone()?;

        let args = Self::segment_args(source, params, output);
        tracing::info!(
            program = %self.program.display(),
            source = %source,
            dir = %output.dir.display(),
            "Spawning segment transcoder"
        );

        self.command(&args)
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| Error::spawn(self.tool_name(), e.to_string()))
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }
}

fn base_args() -> Vec<String> {
    vec!["-hide_banner".into(), "-nostdin".into()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use cr_core::Credentials;

    fn source(raw: &str) -> SourceUri {
        SourceUri::compose(raw, &Credentials::default()).unwrap()
    }

    fn output(dir: &Path) -> SegmentOutput {
        SegmentOutput {
            dir: dir.to_path_buf(),
            playlist_name: "stream.m3u8".into(),
            segment_extension: "ts".into(),
        }
    }

    fn window<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn frame_args_follow_contract() {
        let params = FrameParams {
            frame_rate: 4,
            quality: 7,
        };
        let args = TranscoderLauncher::frame_args(&source("rtsp://cam.example/live"), &params);
        assert_eq!(&args[..2], ["-hide_banner", "-nostdin"]);
        assert_eq!(window(&args, "-rtsp_transport"), Some("tcp"));
        assert_eq!(window(&args, "-i"), Some("rtsp://cam.example/live"));
        assert_eq!(window(&args, "-f"), Some("mjpeg"));
        assert_eq!(window(&args, "-q:v"), Some("7"));
        assert_eq!(window(&args, "-update"), Some("1"));
        assert_eq!(window(&args, "-r"), Some("4"));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn transport_flags_only_for_rtsp() {
        let args = TranscoderLauncher::frame_args(
            &source("http://cam.example/video.mjpg"),
            &FrameParams::default(),
        );
        assert!(!args.iter().any(|a| a == "-rtsp_transport"));

        let dir = tempfile::tempdir().unwrap();
        let args = TranscoderLauncher::segment_args(
            &source("http://cam.example/video"),
            &SegmentParams::default(),
            &output(dir.path()),
        );
        assert!(!args.iter().any(|a| a == "-rtsp_flags"));
        assert_eq!(window(&args, "-fflags"), Some("nobuffer"));
    }

    #[test]
    fn segment_args_follow_contract() {
        let dir = tempfile::tempdir().unwrap();
        let out = output(dir.path());
        let params = SegmentParams {
            video_bitrate_kbps: 1500,
            keyframe_interval: 50,
            segment_duration_secs: 4,
            segment_count: 6,
            ..SegmentParams::default()
        };
        let args =
            TranscoderLauncher::segment_args(&source("rtsps://cam.example/live"), &params, &out);

        assert_eq!(window(&args, "-rtsp_flags"), Some("prefer_tcp"));
        assert_eq!(window(&args, "-c:v"), Some("libx264"));
        assert_eq!(window(&args, "-b:v"), Some("1500k"));
        assert_eq!(window(&args, "-maxrate"), Some("2500k"));
        assert_eq!(window(&args, "-bufsize"), Some("5000k"));
        assert_eq!(window(&args, "-g"), Some("50"));
        assert_eq!(window(&args, "-b:a"), Some("128k"));
        assert_eq!(window(&args, "-hls_time"), Some("4"));
        assert_eq!(window(&args, "-hls_list_size"), Some("6"));
        assert_eq!(
            window(&args, "-hls_flags"),
            Some("delete_segments+append_list+independent_segments")
        );
        let pattern = dir.path().join("stream%d.ts");
        assert_eq!(
            window(&args, "-hls_segment_filename"),
            pattern.to_str()
        );
        let playlist = dir.path().join("stream.m3u8");
        assert_eq!(
            args.last().map(String::as_str),
            playlist.to_str()
        );
    }

    #[test]
    fn segment_pattern_uses_playlist_stem() {
        let out = SegmentOutput {
            dir: PathBuf::from("/tmp/x"),
            playlist_name: "live.m3u8".into(),
            segment_extension: "m4s".into(),
        };
        assert_eq!(out.segment_pattern(), PathBuf::from("/tmp/x/live%d.m4s"));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let launcher = TranscoderLauncher::new("nonexistent_ffmpeg_xyz_12345", Vec::new());
        let err = launcher
            .spawn_frames(&source("rtsp://cam.example/live"), &FrameParams::default())
            .unwrap_err();
        match err {
            Error::Spawn { tool, .. } => assert_eq!(tool, "nonexistent_ffmpeg_xyz_12345"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn frame_process_pipes_are_live() {
        use tokio::io::AsyncReadExt;

        // Leading args turn the generated argv into positional parameters.
        let launcher = TranscoderLauncher::new(
            "/bin/sh",
            vec![
                "-c".into(),
                "printf out; printf err >&2".into(),
                "fake-ffmpeg".into(),
            ],
        );
        let mut proc = launcher
            .spawn_frames(&source("rtsp://cam.example/live"), &FrameParams::default())
            .unwrap();

        let mut out = String::new();
        proc.stdout.read_to_string(&mut out).await.unwrap();
        let mut err = String::new();
        proc.stderr.read_to_string(&mut err).await.unwrap();
        assert_eq!(out, "out");
        assert_eq!(err, "err");
        assert!(proc.child.wait().await.unwrap().success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn segment_process_writes_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = output(&dir.path().join("session"));
        let log = dir.path().join("session.log");

        let launcher = TranscoderLauncher::new(
            "/bin/sh",
            vec![
                "-c".into(),
                "echo starting; echo boom >&2".into(),
                "fake-ffmpeg".into(),
            ],
        );
        let mut child = launcher
            .spawn_segments(
                &source("rtsp://cam.example/live"),
                &SegmentParams::default(),
                &out,
                &log,
            )
            .await
            .unwrap();
        assert!(child.wait().await.unwrap().success());

        assert!(out.dir.is_dir());
        let contents = std::fs::read_to_string(&log).unwrap();
        assert!(contents.contains("starting"));
        assert!(contents.contains("boom"));
    }
}
