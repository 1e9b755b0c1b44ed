use async_trait::async_trait;
use num_complex::Complex64;
use serde::Deserialize;
use serde_json::{Value, json};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::{ChannelSample, ConnectionInterface, Instrument, InstrumentSession, SweepRequest};
use crate::error::SamplerError;

// 辅助程序退出码约定
const EXIT_NO_DEVICE: i32 = 2;
const EXIT_BUSY: i32 = 3;
const EXIT_CONNECT_REFUSED: i32 = 4;

/// Drives the instrument through an external helper that wraps the native
/// driver. Each operation is one helper invocation: a JSON request on stdin,
/// a JSON reply on stdout.
pub struct CommandInstrument {
    program: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct CountReply {
    devices: usize,
}

#[derive(Deserialize)]
struct SweepReply {
    s11: Vec<[f64; 2]>,
}

impl CommandInstrument {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

/// 子进程执行（tokio::process，异步非阻塞）
async fn run_helper(program: &str, request: Value, limit: Duration) -> Result<String, SamplerError> {
    let payload = serde_json::to_vec(&request)
        .map_err(|e| SamplerError::SweepFailed(format!("encode request: {}", e)))?;
    log::debug!("Instrument helper {} <- {}", program, request);

    let mut child = Command::new(program)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SamplerError::SweepFailed(format!("failed to spawn {}: {}", program, e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(&payload)
            .await
            .map_err(|e| SamplerError::SweepFailed(format!("write to {}: {}", program, e)))?;
    }

    let output = match timeout(limit, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| SamplerError::SweepFailed(format!("wait for {}: {}", program, e)))?,
        Err(_) => return Err(SamplerError::MeasurementTimeout),
    };

    match output.status.code() {
        Some(0) => Ok(String::from_utf8_lossy(&output.stdout).to_string()),
        Some(EXIT_NO_DEVICE) => Err(SamplerError::NoDeviceFound),
        Some(EXIT_BUSY) => Err(SamplerError::ResourceBusy),
        Some(EXIT_CONNECT_REFUSED) => Err(SamplerError::ConnectFailed {
            attempted: vec![request["interface"].as_str().unwrap_or("?").to_string()],
        }),
        code => {
            let err_str = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(SamplerError::SweepFailed(format!("{} exited with {:?}: {}", program, code, err_str)))
        }
    }
}

#[async_trait]
impl Instrument for CommandInstrument {
    async fn device_count(&self) -> Result<usize, SamplerError> {
        let stdout = match run_helper(&self.program, json!({ "op": "count" }), self.timeout).await {
            Err(SamplerError::NoDeviceFound) => return Ok(0),
            other => other?,
        };
        let reply: CountReply = serde_json::from_str(&stdout)
            .map_err(|e| SamplerError::MeasurementCorrupt(format!("count reply: {}", e)))?;
        Ok(reply.devices)
    }

    fn interfaces(&self) -> Vec<ConnectionInterface> {
        ConnectionInterface::PREFERRED.to_vec()
    }

    async fn connect(
        &self,
        interface: ConnectionInterface,
    ) -> Result<Box<dyn InstrumentSession>, SamplerError> {
        run_helper(
            &self.program,
            json!({ "op": "connect", "interface": interface.name() }),
            self.timeout,
        )
        .await?;
        Ok(Box::new(CommandSession {
            program: self.program.clone(),
            interface,
            timeout: self.timeout,
            open: true,
        }))
    }
}

struct CommandSession {
    program: String,
    interface: ConnectionInterface,
    timeout: Duration,
    open: bool,
}

#[async_trait]
impl InstrumentSession for CommandSession {
    fn is_valid(&self) -> bool {
        self.open
    }

    async fn sweep_s11(&mut self, request: &SweepRequest) -> Result<ChannelSample, SamplerError> {
        let stdout = run_helper(
            &self.program,
            json!({
                "op": "sweep",
                "interface": self.interface.name(),
                "start_hz": request.start_hz,
                "end_hz": request.end_hz,
                "points": request.points,
                "average": request.average,
                "parameter": "S11",
            }),
            self.timeout,
        )
        .await?;
        let reply: SweepReply = serde_json::from_str(&stdout)
            .map_err(|e| SamplerError::MeasurementCorrupt(format!("sweep reply: {}", e)))?;
        Ok(ChannelSample {
            start_hz: request.start_hz,
            end_hz: request.end_hz,
            s11: reply.s11.into_iter().map(|[re, im]| Complex64::new(re, im)).collect(),
        })
    }

    async fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let request = json!({ "op": "close", "interface": self.interface.name() });
        if let Err(e) = run_helper(&self.program, request, self.timeout).await {
            log::warn!("Instrument close via {} failed: {}", self.program, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_helper_is_reported_as_sweep_failure() {
        let instrument = CommandInstrument::new("/nonexistent/pocketvna-helper", Duration::from_secs(1));
        match instrument.device_count().await {
            Err(SamplerError::SweepFailed(msg)) => assert!(msg.contains("spawn")),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
