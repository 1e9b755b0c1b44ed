//! Receiver process: decision polling, telemetry, playback and the
//! GUI-driven recording and enhancement actions.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::decision_client::DecisionClient;
use crate::enhancer::{CommandEnhancer, Enhancer, enhance_latest};
use crate::events::{EventSink, LogConsumer, MonitorConsumer, spawn_dispatcher};
use crate::gui_bridge::{GuiBridge, GuiEvent};
use crate::recording::Recorder;
use crate::shutdown::Shutdown;
use crate::telemetry::{PingProbe, SystemCounters, TelemetryCollector, UdpEchoProbe};
use crate::transport::{FfmpegTransport, StreamKind, SupervisedProcess};

pub struct Receiver {
    config: Config,
    media: bool,
}

impl Receiver {
    pub fn new(config: Config, media: bool) -> Self {
        Self { config, media }
    }

    pub async fn run(self, mut shutdown: Shutdown) -> anyhow::Result<()> {
        let config = &self.config;
        log::info!("Starting receiver for sender {}", config.sender_ip);

        // 事件队列：所有循环只往队列里写，由单一任务分发给GUI
        let (events, events_rx) = EventSink::new(config.event_queue_len);
        let (tx_gui_event, mut rx_gui_event) = mpsc::channel::<GuiEvent>(16);
        let mut tasks = Vec::new();
        let consumer: Arc<dyn MonitorConsumer> = match GuiBridge::new(config, tx_gui_event).await {
            Ok(bridge) => {
                let gui = Arc::new(bridge);
                let bridge_task = gui.clone();
                let stop = shutdown.clone();
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = bridge_task.run(stop).await {
                        log::error!("GuiBridge error: {}", e);
                    }
                }));
                gui
            }
            Err(e) => {
                log::warn!("GUI bridge unavailable ({}), monitor events go to the log", e);
                Arc::new(LogConsumer)
            }
        };
        let dispatcher = spawn_dispatcher(events_rx, consumer);

        let client = DecisionClient::new(config.decision_server_addr()?, config).with_events(events.clone());
        let decisions = client.subscribe();
        tasks.push(tokio::spawn(client.run(shutdown.clone())));

        let echo = UdpEchoProbe::connect(
            config.timestamp_server_addr()?,
            Duration::from_millis(config.echo_timeout_ms),
        )
        .await?;
        let pinger = PingProbe::new(config.sender_ip.clone(), config.ping_timeout_secs);
        let collector = TelemetryCollector::new(
            config,
            Box::new(SystemCounters::new()),
            Arc::new(echo),
            Arc::new(pinger),
            decisions.clone(),
        )
        .with_events(events.clone());
        let frame_rate = collector.frame_rate();
        let connected = collector.connection_flag();

        let transport = Arc::new(FfmpegTransport::new(config).with_events(events.clone()));
        let mut playback: Option<SupervisedProcess> = None;
        let mut processes: Vec<SupervisedProcess> = Vec::new();
        if self.media {
            match transport.start_playback(StreamKind::Video, &config.sender_ip) {
                Ok(p) => playback = Some(p),
                Err(e) => events.log(format!("Video receiver not started: {}", e)),
            }
            match transport.start_playback(StreamKind::Audio, &config.sender_ip) {
                Ok(p) => processes.push(p),
                Err(e) => events.log(format!("Audio receiver not started: {}", e)),
            }
            if let Some(fps) = transport.probe_stream_fps().await {
                events.log(format!("Detected framerate: {:.0} fps", fps));
            }
            match transport.start_frame_counter(frame_rate) {
                Ok((p, reader)) => {
                    processes.push(p);
                    tasks.push(reader);
                }
                Err(e) => events.log(format!("Frame counter not started: {}", e)),
            }
        }
        tasks.push(tokio::spawn(collector.run(shutdown.clone())));

        let recorder = Recorder::new(transport.clone(), config.recording_path(), config.recording_duration())
            .with_events(events.clone());
        let enhancer: Arc<dyn Enhancer> = Arc::new(CommandEnhancer::from_config(config));
        let mut liveness = tokio::time::interval(config.telemetry_tick());
        let mut recording: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,

                _ = liveness.tick() => {
                    let alive = playback.as_mut().is_some_and(|p| p.is_running());
                    if connected.swap(alive, Ordering::Relaxed) != alive {
                        events.log(if alive { "Video stream connected" } else { "Video stream disconnected" });
                    }
                }

                Some(event) = rx_gui_event.recv() => match event {
                    GuiEvent::Record => {
                        let decision = *decisions.borrow();
                        match recorder.start(decision) {
                            Ok(handle) => {
                                let events = events.clone();
                                recording = Some(tokio::spawn(async move {
                                    match handle.task.await {
                                        Ok(outcome) if outcome.is_complete() => {
                                            events.log(format!("Recording {} finished", outcome.session.id))
                                        }
                                        Ok(outcome) => events.log(format!("Recording {} incomplete", outcome.session.id)),
                                        Err(e) => log::error!("Recording task failed: {}", e),
                                    }
                                }));
                            }
                            Err(e) => events.log(format!("Record request rejected: {}", e)),
                        }
                    }
                    GuiEvent::Enhance => {
                        let dir = config.recording_path();
                        let enhancer = enhancer.clone();
                        let events = events.clone();
                        tokio::spawn(async move {
                            match enhance_latest(&dir, enhancer.as_ref()).await {
                                Ok(path) => events.log(format!("Successfully enhanced audio: {}", path.display())),
                                Err(e) => events.log(format!("Enhancement failed: {}", e)),
                            }
                        });
                    }
                },
            }
        }

        log::info!("Stopping receiver");
        recorder.stop();
        // 进行中的录制先收到 SIGTERM，超过宽限期才会被强制结束
        if let Some(task) = recording.take() {
            if tokio::time::timeout(config.stop_grace() * 2, task).await.is_err() {
                log::warn!("Recording did not stop within {:?}", config.stop_grace() * 2);
            }
        }
        if let Some(p) = playback.as_mut() {
            p.terminate(config.stop_grace()).await;
        }
        for p in processes.iter_mut() {
            p.terminate(config.stop_grace()).await;
        }
        futures_util::future::join_all(tasks).await;
        drop(events);
        drop(recorder);
        drop(transport);
        // 剩余事件发送完毕后分发任务才退出
        let _ = tokio::time::timeout(config.stop_grace(), dispatcher).await;
        log::info!("Receiver stopped");
        Ok(())
    }
}
