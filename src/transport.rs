//! Media transport: ffmpeg-family subprocesses for streaming, playback,
//! frame counting and recording, all run under supervision.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::TransportError;
use crate::events::EventSink;
use crate::shutdown::Shutdown;
use crate::telemetry::SharedFrameRate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    pub fn name(self) -> &'static str {
        match self {
            StreamKind::Video => "Video",
            StreamKind::Audio => "Audio",
        }
    }
}

/// Program plus arguments, kept separate so tests can inspect them.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl MediaCommand {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn display(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// ffmpeg progress and status chatter that is not worth a log line.
pub fn is_progress_noise(line: &str) -> bool {
    (line.contains("M-A:") && line.contains("fd="))
        || (line.contains("M-V:") && line.contains("fd="))
        || (line.contains("aq=") && line.contains("vq=") && line.contains("sq="))
        || (line.contains("fps=") && line.contains(" q="))
        || line.contains("Non-monotonous DTS")
}

async fn forward_stderr<R: AsyncRead + Unpin>(name: String, stderr: R, events: Option<EventSink>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() || is_progress_noise(line) {
            continue;
        }
        log::warn!("{} output: {}", name, line);
        if let Some(events) = &events {
            events.log(format!("{} output: {}", name, line));
        }
    }
}

/// A child process whose stderr is filtered into the log and which can be
/// stopped with SIGTERM followed by a kill.
pub struct SupervisedProcess {
    name: String,
    child: Child,
    stderr_task: Option<JoinHandle<()>>,
}

impl SupervisedProcess {
    pub fn spawn(
        name: impl Into<String>,
        command: &MediaCommand,
        capture_stdout: bool,
        events: Option<EventSink>,
    ) -> Result<Self, TransportError> {
        let name = name.into();
        log::info!("Starting {}: {}", name, command.display());
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(if capture_stdout { Stdio::piped() } else { Stdio::null() })
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransportError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(forward_stderr(name.clone(), stderr, events)));

        Ok(Self {
            name,
            child,
            stderr_task,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    pub async fn wait(&mut self) -> Result<ExitStatus, TransportError> {
        let status = self.child.wait().await?;
        if let Some(task) = self.stderr_task.take() {
            let _ = task.await;
        }
        Ok(status)
    }

    /// SIGTERM, then SIGKILL if the process outlives `grace`.
    pub async fn terminate(&mut self, grace: Duration) {
        if !self.is_running() {
            return;
        }
        if let Some(pid) = self.child.id() {
            log::info!("Terminating {} (pid {})", self.name, pid);
            // SAFETY: pid belongs to a child we spawned and have not reaped yet.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                log::warn!("{} did not exit within {:?}, killing", self.name, grace);
                if let Err(e) = self.child.kill().await {
                    log::error!("Failed to kill {}: {}", self.name, e);
                }
            }
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

/// Seam used by the recorder to capture one stream to a file.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Captures `kind` into `output` for `duration`, returning when the
    /// capture process has exited. `stop` ends the capture early.
    async fn capture(
        &self,
        kind: StreamKind,
        output: &Path,
        duration: Duration,
        stop: Shutdown,
    ) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub struct FfmpegTransport {
    multicast_addr: String,
    bind_ip: String,
    video_port: u16,
    audio_port: u16,
    fps: u32,
    stop_grace: Duration,
    events: Option<EventSink>,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    r_frame_rate: Option<String>,
}

impl FfmpegTransport {
    pub fn new(config: &Config) -> Self {
        Self {
            multicast_addr: config.multicast_addr.to_string(),
            bind_ip: config.bind_ip.clone(),
            video_port: config.video_port,
            audio_port: config.audio_port,
            fps: config.frames_fps,
            stop_grace: config.stop_grace(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    fn port(&self, kind: StreamKind) -> u16 {
        match kind {
            StreamKind::Video => self.video_port,
            StreamKind::Audio => self.audio_port,
        }
    }

    fn receive_url(&self, kind: StreamKind) -> String {
        format!("udp://{}:{}?timeout=5000000&buffer_size=65536", self.multicast_addr, self.port(kind))
    }

    fn send_url(&self, kind: StreamKind) -> String {
        format!("udp://{}:{}?ttl=1&localaddr={}", self.multicast_addr, self.port(kind), self.bind_ip)
    }

    pub fn video_stream_command(&self) -> MediaCommand {
        MediaCommand::new(
            "libcamera-vid",
            &["-t", "0", "--inline", "--width", "640", "--height", "480", "--framerate"],
        )
        .arg(self.fps.to_string())
        .arg("--codec")
        .arg("h264")
        .arg("--profile")
        .arg("baseline")
        .arg("--intra")
        .arg("5")
        .arg("--bitrate")
        .arg("1000000")
        .arg("-o")
        .arg(self.send_url(StreamKind::Video))
    }

    pub fn audio_stream_command(&self, device: &str) -> MediaCommand {
        MediaCommand::new("ffmpeg", &["-f", "alsa", "-channels", "1", "-sample_rate", "16000", "-i"])
            .arg(device)
            .arg("-acodec")
            .arg("aac")
            .arg("-ab")
            .arg("128k")
            .arg("-ac")
            .arg("1")
            .arg("-f")
            .arg("mpegts")
            .arg(self.send_url(StreamKind::Audio))
    }

    pub fn playback_command(&self, kind: StreamKind, title: &str) -> MediaCommand {
        let mut cmd = MediaCommand::new(
            "ffplay",
            &["-fflags", "nobuffer", "-flags", "low_delay", "-framedrop", "-sync", "ext"],
        );
        cmd = match kind {
            StreamKind::Video => cmd.arg("-window_title").arg(title),
            StreamKind::Audio => cmd.arg("-nodisp"),
        };
        cmd.arg("-autoexit")
            .arg("-loglevel")
            .arg("warning")
            .arg(self.receive_url(kind))
    }

    pub fn frame_counter_command(&self) -> MediaCommand {
        MediaCommand::new(
            "ffprobe",
            &[
                "-v", "error", "-probesize", "1000000", "-analyzeduration", "2000000",
                "-show_entries", "frame=pkt_size,pkt_pts_time", "-of", "csv",
            ],
        )
        .arg(self.receive_url(StreamKind::Video))
    }

    pub fn capture_command(&self, kind: StreamKind, output: &Path, duration: Duration) -> MediaCommand {
        let cmd = MediaCommand::new("ffmpeg", &["-y", "-i"])
            .arg(self.receive_url(kind))
            .arg("-t")
            .arg(duration.as_secs().to_string());
        let cmd = match kind {
            StreamKind::Video => cmd
                .arg("-c:v")
                .arg("copy")
                .arg("-an")
                .arg("-fflags")
                .arg("+genpts")
                .arg("-avoid_negative_ts")
                .arg("make_zero"),
            StreamKind::Audio => cmd
                .arg("-vn")
                .arg("-ar")
                .arg("16000")
                .arg("-ac")
                .arg("1")
                .arg("-acodec")
                .arg("pcm_s16le")
                .arg("-fflags")
                .arg("+genpts"),
        };
        cmd.arg("-loglevel").arg("warning").arg(output.to_string_lossy().to_string())
    }

    pub fn start(&self, name: &str, command: &MediaCommand) -> Result<SupervisedProcess, TransportError> {
        SupervisedProcess::spawn(name, command, false, self.events.clone())
    }

    pub fn start_playback(&self, kind: StreamKind, sender_ip: &str) -> Result<SupervisedProcess, TransportError> {
        let title = format!("Video from {}", sender_ip);
        self.start(&format!("{} Receiver", kind.name()), &self.playback_command(kind, &title))
    }

    /// Starts ffprobe and feeds one arrival per output line into `window`.
    pub fn start_frame_counter(&self, window: SharedFrameRate) -> Result<(SupervisedProcess, JoinHandle<()>), TransportError> {
        let mut process =
            SupervisedProcess::spawn("Frame Counter", &self.frame_counter_command(), true, self.events.clone())?;
        let stdout = process.take_stdout().ok_or_else(|| TransportError::Exit {
            program: "ffprobe".to_string(),
            code: None,
        })?;
        let reader = tokio::spawn(count_frames(stdout, window));
        Ok((process, reader))
    }

    /// Reads the advertised frame rate of the incoming video stream.
    pub async fn probe_stream_fps(&self) -> Option<f64> {
        let cmd = MediaCommand::new(
            "ffprobe",
            &[
                "-v", "quiet", "-probesize", "1000000", "-analyzeduration", "2000000",
                "-select_streams", "v:0", "-show_entries", "stream=r_frame_rate,avg_frame_rate", "-of", "json",
            ],
        )
        .arg(self.receive_url(StreamKind::Video));
        let run = Command::new(&cmd.program).args(&cmd.args).kill_on_drop(true).output();
        let output = match tokio::time::timeout(Duration::from_secs(10), run).await {
            Ok(Ok(o)) if o.status.success() => o,
            Ok(Ok(o)) => {
                log::warn!("ffprobe failed: {}", String::from_utf8_lossy(&o.stderr).trim());
                return None;
            }
            Ok(Err(e)) => {
                log::warn!("Stream info error: {}", e);
                return None;
            }
            Err(_) => {
                log::warn!("ffprobe timed out");
                return None;
            }
        };
        let parsed: ProbeOutput = serde_json::from_slice(&output.stdout).ok()?;
        let rate = parsed.streams.first()?.r_frame_rate.as_deref()?;
        let fps = parse_frame_rate(rate)?;
        log::info!("Detected framerate: {:.0} fps", fps);
        Some(fps)
    }

    /// Picks the ALSA capture device from `arecord -l`.
    pub async fn detect_audio_device(&self) -> String {
        let listing = match Command::new("arecord").arg("-l").output().await {
            Ok(out) => String::from_utf8_lossy(&out.stdout).to_string(),
            Err(e) => {
                log::warn!("Audio device detection failed: {}", e);
                String::new()
            }
        };
        choose_audio_device(&listing).to_string()
    }
}

#[async_trait]
impl MediaTransport for FfmpegTransport {
    async fn capture(
        &self,
        kind: StreamKind,
        output: &Path,
        duration: Duration,
        mut stop: Shutdown,
    ) -> Result<(), TransportError> {
        let command = self.capture_command(kind, output, duration);
        let name = format!("{} Recording", kind.name());
        let mut process = SupervisedProcess::spawn(&name, &command, false, self.events.clone())?;

        // ffmpeg 应在 duration 后自行退出，超出宽限期则强制结束
        let waited = tokio::select! {
            waited = tokio::time::timeout(duration + self.stop_grace, process.wait()) => Some(waited),
            _ = stop.wait() => None,
        };
        let status = match waited {
            Some(Ok(status)) => status?,
            Some(Err(_)) => {
                process.terminate(self.stop_grace).await;
                return Err(TransportError::Exit { program: command.program, code: None });
            }
            None => {
                // SIGTERM 让 ffmpeg 写完文件尾
                process.terminate(self.stop_grace).await;
                return Err(TransportError::Stopped { program: command.program });
            }
        };
        if status.success() {
            log::info!("{} completed: {}", name, output.display());
            Ok(())
        } else {
            Err(TransportError::Exit {
                program: command.program,
                code: status.code(),
            })
        }
    }
}

/// `"30000/1001"` → 29.97.
pub fn parse_frame_rate(rate: &str) -> Option<f64> {
    let (num, den) = rate.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    if den == 0.0 { None } else { Some(num / den) }
}

pub fn choose_audio_device(arecord_listing: &str) -> &'static str {
    if arecord_listing.contains("card 2") {
        "hw:2,0"
    } else if arecord_listing.contains("card 1") {
        "hw:1,0"
    } else if arecord_listing.contains("card 0") {
        "hw:0,0"
    } else {
        log::warn!("No specific audio device detected, using default device");
        "hw:1,0"
    }
}

async fn count_frames<R: AsyncRead + Unpin>(stdout: R, window: SharedFrameRate) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match window.lock() {
            Ok(mut w) => w.record(Instant::now()),
            Err(_) => break,
        }
    }
    log::debug!("Frame counter output closed");
}
