//! Monitor event queue: producers push, one dispatcher task delivers.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::decision::Decision;
use crate::telemetry::TelemetrySnapshot;

#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Telemetry(Arc<TelemetrySnapshot>),
    Decision(Decision),
    Log(String),
}

/// Receives monitor events on the dispatcher task. A slow consumer only
/// fills the queue; producers never wait on it.
#[async_trait]
pub trait MonitorConsumer: Send + Sync {
    async fn on_telemetry(&self, snapshot: Arc<TelemetrySnapshot>);
    async fn on_decision(&self, decision: Decision);
    async fn on_log(&self, line: String);
}

/// Producer handle. Cloning shares the queue and the drop counter.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<MonitorEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MonitorEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Queues an event; drops it when the queue is full or closed.
    pub fn emit(&self, event: MonitorEvent) {
        if self.tx.try_send(event).is_err() {
            let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if n.is_power_of_two() {
                log::warn!("Monitor queue full, {} events dropped so far", n);
            }
        }
    }

    pub fn log(&self, line: impl Into<String>) {
        self.emit(MonitorEvent::Log(line.into()));
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Spawns the single dispatcher; it ends when every sink is dropped.
pub fn spawn_dispatcher(
    mut rx: mpsc::Receiver<MonitorEvent>,
    consumer: Arc<dyn MonitorConsumer>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                MonitorEvent::Telemetry(snapshot) => consumer.on_telemetry(snapshot).await,
                MonitorEvent::Decision(decision) => consumer.on_decision(decision).await,
                MonitorEvent::Log(line) => consumer.on_log(line).await,
            }
        }
        log::debug!("Monitor dispatcher stopped");
    })
}

/// Consumer that forwards everything to the process log.
pub struct LogConsumer;

#[async_trait]
impl MonitorConsumer for LogConsumer {
    async fn on_telemetry(&self, snapshot: Arc<TelemetrySnapshot>) {
        log::debug!(
            "Telemetry: video {:.1} kbps, audio {:.1} kbps, {:.1} fps, latency {:.1} ms, loss {:.0}%",
            snapshot.video_bitrate_kbps,
            snapshot.audio_bitrate_kbps,
            snapshot.video_fps,
            snapshot.video_latency_ms,
            snapshot.packet_loss_percent
        );
    }

    async fn on_decision(&self, decision: Decision) {
        log::info!("Decision: {} (S11: {:.2} dB)", decision.mode, decision.s11_mean);
    }

    async fn on_log(&self, line: String) {
        log::info!("{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MonitorConsumer for Recording {
        async fn on_telemetry(&self, _snapshot: Arc<TelemetrySnapshot>) {
            self.seen.lock().await.push("telemetry".into());
        }
        async fn on_decision(&self, decision: Decision) {
            self.seen.lock().await.push(format!("decision {}", decision.mode_code));
        }
        async fn on_log(&self, line: String) {
            self.seen.lock().await.push(line);
        }
    }

    #[tokio::test]
    async fn dispatcher_delivers_in_order() {
        let (sink, rx) = EventSink::new(8);
        let consumer = Arc::new(Recording::default());
        let handle = spawn_dispatcher(rx, consumer.clone());

        sink.log("first");
        sink.emit(MonitorEvent::Decision(Decision::fallback()));
        sink.emit(MonitorEvent::Telemetry(Arc::new(TelemetrySnapshot::default())));
        drop(sink);
        handle.await.unwrap();

        let seen = consumer.seen.lock().await;
        assert_eq!(*seen, vec!["first", "decision 4", "telemetry"]);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let (sink, _rx) = EventSink::new(2);
        for i in 0..5 {
            sink.log(format!("line {}", i));
        }
        assert_eq!(sink.dropped(), 3);
    }

    #[tokio::test]
    async fn log_consumer_drains_the_queue() {
        let (sink, rx) = EventSink::new(4);
        let handle = spawn_dispatcher(rx, Arc::new(LogConsumer));
        sink.log("bridge unavailable");
        sink.emit(MonitorEvent::Decision(Decision::fallback()));
        sink.emit(MonitorEvent::Telemetry(Arc::new(TelemetrySnapshot::default())));
        drop(sink);
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
