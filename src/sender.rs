//! Sender process: channel measurement, decision service, frame stamps,
//! timestamp echo and (optionally) the media streams.

use std::sync::Arc;

use crate::config::Config;
use crate::decision_service::DecisionService;
use crate::echo_service::EchoService;
use crate::frames;
use crate::instrument;
use crate::sampler::ChannelQualitySampler;
use crate::shutdown::Shutdown;
use crate::transport::{FfmpegTransport, SupervisedProcess};

pub struct Sender {
    config: Config,
    media: bool,
}

impl Sender {
    pub fn new(config: Config, media: bool) -> Self {
        Self { config, media }
    }

    pub async fn run(self, mut shutdown: Shutdown) -> anyhow::Result<()> {
        let config = &self.config;
        log::info!(
            "Starting sender on {} (decision port {}, timestamp port {})",
            config.bind_ip,
            config.decision_port,
            config.timestamp_port
        );

        let instrument = instrument::from_config(config);
        let sampler = ChannelQualitySampler::from_config(config, instrument);
        let service = Arc::new(DecisionService::new(config, sampler));
        let frame_table = frames::shared(config.frame_table_capacity);
        let echo = Arc::new(EchoService::bind(config.timestamp_bind_addr()?, frame_table.clone()).await?);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(frames::run_frame_ticker(
            frame_table,
            config.frames_fps,
            shutdown.clone(),
        )));
        let echo_task = {
            let echo = echo.clone();
            let stop = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = echo.run(stop).await {
                    log::error!("Timestamp service error: {}", e);
                }
            })
        };
        tasks.push(echo_task);
        let decision_task = {
            let addr = config.decision_bind_addr()?;
            let stop = shutdown.clone();
            let service = service.clone();
            tokio::spawn(async move {
                if let Err(e) = service.run(addr, stop).await {
                    log::error!("Decision service error: {}", e);
                }
            })
        };
        tasks.push(decision_task);

        let mut processes: Vec<SupervisedProcess> = Vec::new();
        if self.media {
            let transport = FfmpegTransport::new(config);
            match transport.start("Video Stream", &transport.video_stream_command()) {
                Ok(p) => processes.push(p),
                Err(e) => log::error!("Video stream not started: {}", e),
            }
            let device = transport.detect_audio_device().await;
            match transport.start("Audio Stream", &transport.audio_stream_command(&device)) {
                Ok(p) => processes.push(p),
                Err(e) => log::error!("Audio stream not started: {}", e),
            }
        }

        shutdown.wait().await;
        log::info!("Stopping sender");
        for process in processes.iter_mut() {
            process.terminate(config.stop_grace()).await;
        }
        futures_util::future::join_all(tasks).await;
        log::info!("Sender stopped, last decision: {}", service.current().mode);
        Ok(())
    }
}
