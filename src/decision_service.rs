//! Sender-side decision service: a fixed-cadence measurement loop and a TCP
//! server handing the latest decision to any number of receivers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tokio::time::{MissedTickBehavior, timeout};

use crate::config::Config;
use crate::decision::Decision;
use crate::error::{ProtocolError, SamplerError};
use crate::fuzzy::FuzzyModeController;
use crate::protocol::{decision_reply, read_frame, write_frame};
use crate::sampler::ChannelQualitySampler;
use crate::shutdown::Shutdown;

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DecisionService {
    sampler: ChannelQualitySampler,
    controller: FuzzyModeController,
    current: watch::Sender<Decision>,
    last_error: Mutex<Option<String>>,
    tick: Duration,
    idle_timeout: Duration,
    max_frame_len: usize,
}

impl DecisionService {
    pub fn new(config: &Config, sampler: ChannelQualitySampler) -> Self {
        // 首次测量完成前提供保守的回退决策
        let (current, _) = watch::channel(Decision::fallback());
        Self {
            sampler,
            controller: FuzzyModeController::new(),
            current,
            last_error: Mutex::new(None),
            tick: config.decision_tick(),
            idle_timeout: Duration::from_secs(config.client_idle_timeout_secs),
            max_frame_len: config.max_frame_len,
        }
    }

    pub fn current(&self) -> Decision {
        *self.current.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Decision> {
        self.current.subscribe()
    }

    /// One measurement: sample, evaluate, publish. Sampling failures publish
    /// the fallback decision instead.
    pub async fn refresh(&self) -> Decision {
        let decision = match self.sampler.sample().await {
            Ok(s11) => {
                self.clear_error().await;
                self.controller.evaluate(s11)
            }
            Err(e) => {
                self.report_error(&e).await;
                Decision::fallback()
            }
        };

        let previous = self.current.send_replace(decision);
        if previous.mode_changed(&decision) {
            log::info!(
                "Processing mode changed: {} -> {} (S11: {:.2} dB, defuzzified {:.2})",
                previous.mode,
                decision.mode,
                decision.s11_mean,
                decision.defuzzified_value
            );
        } else {
            log::debug!("Decision unchanged: {} (S11: {:.2} dB)", decision.mode, decision.s11_mean);
        }
        decision
    }

    async fn report_error(&self, e: &SamplerError) {
        let text = e.to_string();
        let mut last = self.last_error.lock().await;
        if last.as_deref() == Some(text.as_str()) {
            log::debug!("Sampling still failing: {}", text);
            return;
        }
        match e {
            SamplerError::ResourceBusy => {
                log::warn!("Instrument is locked by another process, using fallback decision")
            }
            e if e.is_instrument_unavailable() => {
                log::warn!("Instrument unavailable ({}), using fallback decision", e)
            }
            e => log::error!("Channel sampling failed: {}, using fallback decision", e),
        }
        *last = Some(text);
    }

    async fn clear_error(&self) {
        if self.last_error.lock().await.take().is_some() {
            log::info!("Channel sampling recovered");
        }
    }

    /// Recomputes the decision every tick until shutdown.
    pub async fn run_ticker(self: Arc<Self>, mut shutdown: Shutdown) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = interval.tick() => {
                    self.refresh().await;
                }
            }
        }
        log::info!("Decision ticker stopped");
    }

    /// Accepts clients until shutdown; each one is served on its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: Shutdown) {
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        log::info!("Decision client connected: {}", peer);
                        let service = self.clone();
                        let client_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            match service.handle_client(stream, client_shutdown).await {
                                Ok(()) | Err(ProtocolError::Closed) => {
                                    log::info!("Decision client disconnected: {}", peer)
                                }
                                Err(e) => log::warn!("Decision client {} dropped: {}", peer, e),
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("Decision accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        log::info!("Decision service stopped accepting clients");
    }

    async fn handle_client(&self, stream: TcpStream, mut shutdown: Shutdown) -> Result<(), ProtocolError> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        loop {
            let frame = tokio::select! {
                _ = shutdown.wait() => return Ok(()),
                frame = timeout(self.idle_timeout, read_frame(&mut reader, self.max_frame_len)) => {
                    frame.map_err(|_| ProtocolError::Timeout)??
                }
            };
            let reply = decision_reply(&frame, &self.current());
            timeout(WRITE_TIMEOUT, write_frame(&mut write_half, &reply))
                .await
                .map_err(|_| ProtocolError::Timeout)??;
        }
    }

    /// Binds the listener and runs the ticker and server until shutdown.
    pub async fn run(self: Arc<Self>, addr: SocketAddr, shutdown: Shutdown) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("Decision service listening on {}", listener.local_addr()?);
        let ticker = tokio::spawn(self.clone().run_ticker(shutdown.clone()));
        self.serve(listener, shutdown).await;
        ticker.await?;
        Ok(())
    }
}
