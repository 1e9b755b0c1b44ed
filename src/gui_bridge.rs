use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::decision::Decision;
use crate::events::MonitorConsumer;
use crate::shutdown::Shutdown;
use crate::telemetry::TelemetrySnapshot;

/// Commands the GUI process sends back to the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GuiEvent {
    Record,
    Enhance,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum GuiMessage<'a> {
    Telemetry(&'a TelemetrySnapshot),
    Decision(&'a Decision),
    Log { text: &'a str },
}

pub struct GuiBridge {
    socket: Arc<UdpSocket>,
    target_addr: String,
    buffer_size: usize,
    tx: mpsc::Sender<GuiEvent>,
}

// GUI进程和Core进程通过本地UDP通信，端口在配置中指定
impl GuiBridge {
    pub async fn new(config: &Config, tx: mpsc::Sender<GuiEvent>) -> anyhow::Result<Self> {
        // 绑定本地UDP端口
        let socket = UdpSocket::bind(format!("127.0.0.1:{}", config.gui_local_port)).await?;
        let target_addr = format!("127.0.0.1:{}", config.gui_remote_port);
        Ok(Self::from_socket(socket, target_addr, config.gui_buffer_size, tx))
    }

    pub fn from_socket(socket: UdpSocket, target_addr: String, buffer_size: usize, tx: mpsc::Sender<GuiEvent>) -> Self {
        Self {
            socket: Arc::new(socket),
            target_addr,
            buffer_size,
            tx,
        }
    }

    pub async fn run(&self, mut shutdown: Shutdown) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            // 通过UDP socket接收消息
            let len = tokio::select! {
                _ = shutdown.wait() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, _)) => len,
                    Err(e) => {
                        // 对端未启动时会收到 ICMP 端口不可达
                        log::debug!("GUI socket recv error: {}", e);
                        continue;
                    }
                },
            };
            if len == 0 {
                continue;
            }
            match serde_json::from_slice::<GuiEvent>(&buf[..len]) {
                Ok(event) => {
                    if self.tx.send(event).await.is_err() {
                        log::warn!("GUI event receiver closed");
                        break;
                    }
                }
                Err(_) => log::warn!("Unknown GUI message: {}", String::from_utf8_lossy(&buf[..len])),
            }
        }
        Ok(())
    }

    pub async fn send_message(&self, msg: &str) -> anyhow::Result<()> {
        self.socket.send_to(msg.as_bytes(), &self.target_addr).await?;
        Ok(())
    }

    async fn send(&self, message: GuiMessage<'_>) {
        let text = match serde_json::to_string(&message) {
            Ok(t) => t,
            Err(e) => {
                log::error!("Failed to encode GUI message: {}", e);
                return;
            }
        };
        if let Err(e) = self.send_message(&text).await {
            log::debug!("Failed to send to GUI: {}", e);
        }
    }
}

#[async_trait]
impl MonitorConsumer for GuiBridge {
    async fn on_telemetry(&self, snapshot: Arc<TelemetrySnapshot>) {
        self.send(GuiMessage::Telemetry(&snapshot)).await;
    }

    async fn on_decision(&self, decision: Decision) {
        self.send(GuiMessage::Decision(&decision)).await;
    }

    async fn on_log(&self, line: String) {
        self.send(GuiMessage::Log { text: &line }).await;
    }
}
