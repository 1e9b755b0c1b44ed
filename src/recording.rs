//! Session recording: one video and one audio capture in parallel, tagged
//! with the decision in effect when the session started.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::decision::Decision;
use crate::error::{RecordError, TransportError};
use crate::events::EventSink;
use crate::shutdown::{self, Shutdown, ShutdownTrigger};
use crate::transport::{MediaTransport, StreamKind};

pub const FILE_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Sidecar written next to the media files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingInfo {
    pub timestamp: String,
    pub mode: String,
    pub mode_code: i64,
    pub s11_mean: f64,
    pub defuzzified_value: f64,
}

impl RecordingInfo {
    pub fn new(timestamp: &str, decision: Option<&Decision>) -> Self {
        match decision {
            Some(d) => Self {
                timestamp: timestamp.to_string(),
                mode: d.mode.label().to_string(),
                mode_code: i64::from(d.mode_code),
                s11_mean: d.s11_mean,
                defuzzified_value: d.defuzzified_value,
            },
            None => Self {
                timestamp: timestamp.to_string(),
                mode: "Unknown".to_string(),
                mode_code: -1,
                s11_mean: 0.0,
                defuzzified_value: 0.0,
            },
        }
    }

    pub fn load(path: &Path) -> Result<Self, RecordError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[derive(Debug, Clone)]
pub struct RecordingSession {
    pub id: Uuid,
    pub started_at: DateTime<Local>,
    pub duration: Duration,
    pub video_path: PathBuf,
    pub audio_path: PathBuf,
    pub info_path: PathBuf,
    pub decision: Option<Decision>,
}

/// Result of both captures once the session has ended.
#[derive(Debug)]
pub struct RecordingOutcome {
    pub session: RecordingSession,
    pub video: Result<(), TransportError>,
    pub audio: Result<(), TransportError>,
}

impl RecordingOutcome {
    pub fn is_complete(&self) -> bool {
        self.video.is_ok() && self.audio.is_ok()
    }
}

pub struct RecordingHandle {
    pub session: RecordingSession,
    pub task: JoinHandle<RecordingOutcome>,
}

/// Clears the active flag however the session task ends.
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Recorder {
    transport: Arc<dyn MediaTransport>,
    dir: PathBuf,
    duration: Duration,
    active: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    stop_trigger: ShutdownTrigger,
    stop_signal: Shutdown,
    events: Option<EventSink>,
}

impl Recorder {
    pub fn new(transport: Arc<dyn MediaTransport>, dir: impl Into<PathBuf>, duration: Duration) -> Self {
        let (stop_trigger, stop_signal) = shutdown::channel();
        Self {
            transport,
            dir: dir.into(),
            duration,
            active: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(true)),
            stop_trigger,
            stop_signal,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    pub fn is_recording(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Refuses new sessions and asks an active session's captures to end.
    /// Await the session's task to know when its files are closed.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_trigger.trigger();
    }

    fn notify(&self, line: String) {
        log::info!("{}", line);
        if let Some(events) = &self.events {
            events.log(line);
        }
    }

    /// Starts a session unless one is already active. Requests are never queued.
    pub fn start(&self, decision: Option<Decision>) -> Result<RecordingHandle, RecordError> {
        if !self.running.load(Ordering::SeqCst) {
            self.notify("Receiver not running".to_string());
            return Err(RecordError::NotRunning);
        }
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.notify("Already recording".to_string());
            return Err(RecordError::RecordingInProgress);
        }
        let guard = ActiveGuard(self.active.clone());

        let started_at = Local::now();
        let stamp = started_at.format(FILE_TIMESTAMP_FORMAT).to_string();
        std::fs::create_dir_all(&self.dir)?;
        let session = RecordingSession {
            id: Uuid::new_v4(),
            started_at,
            duration: self.duration,
            video_path: self.dir.join(format!("video_{}.mp4", stamp)),
            audio_path: self.dir.join(format!("audio_{}.wav", stamp)),
            info_path: self.dir.join(format!("info_{}.json", stamp)),
            decision,
        };

        let info = RecordingInfo::new(&stamp, decision.as_ref());
        std::fs::write(&session.info_path, serde_json::to_string_pretty(&info)?)?;
        self.notify(format!(
            "Starting recording to {} and {}",
            session.video_path.display(),
            session.audio_path.display()
        ));

        let transport = self.transport.clone();
        let events = self.events.clone();
        let task_session = session.clone();
        let stop = self.stop_signal.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            let (video, audio) = futures_util::future::join(
                transport.capture(StreamKind::Video, &task_session.video_path, task_session.duration, stop.clone()),
                transport.capture(StreamKind::Audio, &task_session.audio_path, task_session.duration, stop),
            )
            .await;
            for (kind, result) in [(StreamKind::Video, &video), (StreamKind::Audio, &audio)] {
                let line = match result {
                    Ok(()) => format!("{} recording completed", kind.name()),
                    Err(e) => format!("{} recording failed: {}", kind.name(), e),
                };
                log::info!("{}", line);
                if let Some(events) = &events {
                    events.log(line);
                }
            }
            RecordingOutcome {
                session: task_session,
                video,
                audio,
            }
        });

        Ok(RecordingHandle { session, task })
    }
}
