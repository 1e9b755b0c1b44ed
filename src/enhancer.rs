//! Offline audio enhancement of recorded sessions through an external model
//! runner.

use async_trait::async_trait;
use chrono::Local;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::config::Config;
use crate::error::EnhanceError;
use crate::recording::{FILE_TIMESTAMP_FORMAT, RecordingInfo};

/// The newest audio capture in a recording directory and its sidecar.
#[derive(Debug, Clone, PartialEq)]
pub struct LatestRecording {
    pub audio: PathBuf,
    pub info_path: Option<PathBuf>,
    pub info: Option<RecordingInfo>,
}

/// Finds the newest `audio_<ts>.wav`. Names sort chronologically, so the
/// greatest name wins.
pub fn find_latest_recording(dir: &Path) -> Result<LatestRecording, EnhanceError> {
    let mut latest: Option<(String, PathBuf)> = None;
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(EnhanceError::NoRecording(dir.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(stamp) = name.strip_prefix("audio_").and_then(|s| s.strip_suffix(".wav")) else {
            continue;
        };
        if latest.as_ref().map_or(true, |(best, _)| stamp > best.as_str()) {
            latest = Some((stamp.to_string(), entry.path()));
        }
    }
    let (stamp, audio) = latest.ok_or_else(|| EnhanceError::NoRecording(dir.to_path_buf()))?;

    let info_path = dir.join(format!("info_{}.json", stamp));
    if !info_path.exists() {
        log::warn!("No info file found for {}", audio.display());
        return Ok(LatestRecording { audio, info_path: None, info: None });
    }
    let info: RecordingInfo = serde_json::from_str(&std::fs::read_to_string(&info_path)?)?;
    Ok(LatestRecording {
        audio,
        info_path: Some(info_path),
        info: Some(info),
    })
}

/// Raw audio in, enhanced audio out.
#[async_trait]
pub trait Enhancer: Send + Sync {
    async fn enhance(&self, recording: &LatestRecording) -> Result<PathBuf, EnhanceError>;
}

/// Runs `<program> <input.wav> <output.wav> [<sidecar.json>]`.
pub struct CommandEnhancer {
    program: String,
    output_dir: PathBuf,
    timeout: Duration,
}

impl CommandEnhancer {
    pub fn new(program: impl Into<String>, output_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            output_dir: output_dir.into(),
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.enhancer_command,
            config.enhancer_output_dir,
            Duration::from_secs(config.enhancer_timeout_secs),
        )
    }

    pub fn output_path(&self, input: &Path, info: Option<&RecordingInfo>) -> PathBuf {
        let stem = input.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
        let mode_code = info.map_or(-1, |i| i.mode_code);
        let stamp = Local::now().format(FILE_TIMESTAMP_FORMAT);
        self.output_dir
            .join(format!("{}_enhanced_mode{}_{}.wav", stem, mode_code, stamp))
    }
}

#[async_trait]
impl Enhancer for CommandEnhancer {
    async fn enhance(&self, recording: &LatestRecording) -> Result<PathBuf, EnhanceError> {
        std::fs::create_dir_all(&self.output_dir)?;
        let output = self.output_path(&recording.audio, recording.info.as_ref());

        let mut cmd = Command::new(&self.program);
        cmd.arg(&recording.audio).arg(&output);
        if let Some(info_path) = &recording.info_path {
            cmd.arg(info_path);
        }
        log::info!("Enhancing {} -> {}", recording.audio.display(), output.display());

        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EnhanceError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let result = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| EnhanceError::Timeout(self.timeout.as_secs()))??;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
            return Err(EnhanceError::Failed(format!(
                "{} exited with {:?}: {}",
                self.program,
                result.status.code(),
                stderr
            )));
        }
        if !output.exists() {
            return Err(EnhanceError::MissingOutput(output));
        }

        if let Some(info) = &recording.info {
            let info_out = output.with_file_name(format!(
                "{}_info.json",
                output.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default()
            ));
            std::fs::write(&info_out, serde_json::to_string_pretty(info)?)?;
            log::info!("Enhancement info saved to: {}", info_out.display());
        }
        log::info!("Successfully enhanced audio: {}", output.display());
        Ok(output)
    }
}

/// Enhances the newest recording in `dir`.
pub async fn enhance_latest(dir: &Path, enhancer: &dyn Enhancer) -> Result<PathBuf, EnhanceError> {
    let latest = find_latest_recording(dir)?;
    match &latest.info {
        Some(info) => log::info!("Enhancement mode: {} (code: {})", info.mode, info.mode_code),
        None => log::warn!("Enhancing {} without mode information", latest.audio.display()),
    }
    enhancer.enhance(&latest).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Decision;

    fn write_recording(dir: &Path, stamp: &str, with_info: bool) {
        std::fs::write(dir.join(format!("audio_{}.wav", stamp)), b"RIFF").unwrap();
        if with_info {
            let info = RecordingInfo::new(stamp, Some(&Decision::new(-50.0, 12.5)));
            std::fs::write(
                dir.join(format!("info_{}.json", stamp)),
                serde_json::to_string_pretty(&info).unwrap(),
            )
            .unwrap();
        }
    }

    #[test]
    fn latest_recording_is_picked_by_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        write_recording(dir.path(), "20240101_120000", true);
        write_recording(dir.path(), "20240102_080000", true);
        write_recording(dir.path(), "20231231_235959", false);
        std::fs::write(dir.path().join("video_20250101_000000.mp4"), b"").unwrap();

        let latest = find_latest_recording(dir.path()).unwrap();
        assert!(latest.audio.ends_with("audio_20240102_080000.wav"));
        assert_eq!(latest.info.unwrap().mode_code, 2);
    }

    #[test]
    fn missing_sidecar_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        write_recording(dir.path(), "20240101_120000", false);
        let latest = find_latest_recording(dir.path()).unwrap();
        assert!(latest.info.is_none());
        assert!(latest.info_path.is_none());
    }

    #[test]
    fn empty_or_missing_directory_has_no_recording() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(find_latest_recording(dir.path()), Err(EnhanceError::NoRecording(_))));
        assert!(matches!(
            find_latest_recording(&dir.path().join("absent")),
            Err(EnhanceError::NoRecording(_))
        ));
    }

    #[tokio::test]
    async fn command_enhancer_writes_output_and_info() {
        let dir = tempfile::tempdir().unwrap();
        write_recording(dir.path(), "20240101_120000", true);
        let mut latest = find_latest_recording(dir.path()).unwrap();
        // `cp` takes exactly two paths here.
        latest.info_path = None;

        let out_dir = dir.path().join("after_process");
        let enhancer = CommandEnhancer::new("cp", &out_dir, Duration::from_secs(10));
        let output = enhancer.enhance(&latest).await.unwrap();

        let name = output.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("audio_20240101_120000_enhanced_mode2_"));
        assert!(output.exists());
        let info_out = output.with_file_name(format!("{}_info.json", output.file_stem().unwrap().to_string_lossy()));
        assert!(info_out.exists());
    }

    #[tokio::test]
    async fn failing_enhancer_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        write_recording(dir.path(), "20240101_120000", false);
        let enhancer = CommandEnhancer::new("false", dir.path().join("out"), Duration::from_secs(10));
        let err = enhance_latest(dir.path(), &enhancer).await.unwrap_err();
        assert!(matches!(err, EnhanceError::Failed(_)));
    }

    #[tokio::test]
    async fn enhancer_that_writes_nothing_is_missing_output() {
        let dir = tempfile::tempdir().unwrap();
        write_recording(dir.path(), "20240101_120000", false);
        let enhancer = CommandEnhancer::new("true", dir.path().join("out"), Duration::from_secs(10));
        let err = enhance_latest(dir.path(), &enhancer).await.unwrap_err();
        assert!(matches!(err, EnhanceError::MissingOutput(_)));
    }
}
