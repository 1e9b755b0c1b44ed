use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::counters::InterfaceCounters;
use super::frame_rate::FrameRateWindow;
use super::history::RollingHistory;
use super::latency::{EchoOutcome, EchoProbe, Pinger, in_range};
use super::snapshot::{HistorySeries, TelemetrySnapshot};
use crate::config::Config;
use crate::decision::Decision;
use crate::events::{EventSink, MonitorEvent};
use crate::shutdown::Shutdown;

/// Share of the received bitrate attributed to video; the rest is audio.
pub const VIDEO_SHARE: f64 = 0.9;

const LATENCY_LOG_DELTA_MS: f64 = 50.0;
const FPS_LOG_DELTA: f64 = 5.0;
const SUMMARY_LOG_INTERVAL: Duration = Duration::from_secs(60);

pub type SharedFrameRate = Arc<Mutex<FrameRateWindow>>;

/// Receiver-side 1 Hz sampler. Each tick runs bitrate, latency (or its
/// fallback) and history append in that order, then publishes one snapshot.
pub struct TelemetryCollector {
    counters: Box<dyn InterfaceCounters>,
    echo: Arc<dyn EchoProbe>,
    pinger: Arc<dyn Pinger>,
    frame_rate: SharedFrameRate,
    decision: watch::Receiver<Option<Decision>>,
    connected: Arc<AtomicBool>,
    events: Option<EventSink>,
    published: watch::Sender<Arc<TelemetrySnapshot>>,

    tick_interval: Duration,
    latency_interval: Duration,
    started: Instant,
    last_bytes: u64,
    last_tick: Instant,
    last_latency_check: Option<Instant>,

    video_bitrate_kbps: f64,
    audio_bitrate_kbps: f64,
    video_latency_ms: f64,
    audio_latency_ms: f64,
    packet_loss_percent: f64,

    timestamps: RollingHistory<f64>,
    bitrate_history: RollingHistory<f64>,
    latency_history: RollingHistory<f64>,
    s11_history: RollingHistory<Option<f64>>,

    reported_latency: Option<f64>,
    reported_fps: f64,
    last_fps_log: Option<Instant>,
    last_bitrate_log: Option<Instant>,
}

impl TelemetryCollector {
    pub fn new(
        config: &Config,
        mut counters: Box<dyn InterfaceCounters>,
        echo: Arc<dyn EchoProbe>,
        pinger: Arc<dyn Pinger>,
        decision: watch::Receiver<Option<Decision>>,
    ) -> Self {
        let now = Instant::now();
        let last_bytes = counters.total_received_bytes();
        let (published, _) = watch::channel(Arc::new(TelemetrySnapshot::default()));
        Self {
            counters,
            echo,
            pinger,
            frame_rate: Arc::new(Mutex::new(FrameRateWindow::default())),
            decision,
            connected: Arc::new(AtomicBool::new(false)),
            events: None,
            published,
            tick_interval: config.telemetry_tick(),
            latency_interval: Duration::from_millis(config.latency_interval_ms),
            started: now,
            last_bytes,
            last_tick: now,
            last_latency_check: None,
            video_bitrate_kbps: 0.0,
            audio_bitrate_kbps: 0.0,
            video_latency_ms: 0.0,
            audio_latency_ms: 0.0,
            packet_loss_percent: 0.0,
            timestamps: RollingHistory::new(config.history_len),
            bitrate_history: RollingHistory::new(config.history_len),
            latency_history: RollingHistory::new(config.history_len),
            s11_history: RollingHistory::new(config.history_len),
            reported_latency: None,
            reported_fps: 0.0,
            last_fps_log: None,
            last_bitrate_log: None,
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    /// Frame-arrival window fed by the frame counter.
    pub fn frame_rate(&self) -> SharedFrameRate {
        self.frame_rate.clone()
    }

    /// Set while the playback stream is alive.
    pub fn connection_flag(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<TelemetrySnapshot>> {
        self.published.subscribe()
    }

    pub async fn tick(&mut self, now: Instant) -> Arc<TelemetrySnapshot> {
        self.sample_bitrate(now);

        let due = self
            .last_latency_check
            .map_or(true, |last| now.saturating_duration_since(last) >= self.latency_interval);
        if due {
            self.sample_latency().await;
            self.last_latency_check = Some(now);
        }

        let video_fps = self.sample_fps(now);

        let s11 = self.decision.borrow().map(|d| d.s11_mean);
        self.timestamps.push(now.saturating_duration_since(self.started).as_secs_f64());
        self.bitrate_history.push(self.video_bitrate_kbps + self.audio_bitrate_kbps);
        self.latency_history.push(self.video_latency_ms);
        self.s11_history.push(s11);

        let snapshot = Arc::new(TelemetrySnapshot {
            video_bitrate_kbps: self.video_bitrate_kbps,
            audio_bitrate_kbps: self.audio_bitrate_kbps,
            video_fps,
            video_latency_ms: self.video_latency_ms,
            audio_latency_ms: self.audio_latency_ms,
            packet_loss_percent: self.packet_loss_percent,
            connected: self.connected.load(Ordering::Relaxed),
            history: HistorySeries {
                timestamps: self.timestamps.to_vec(),
                bitrate: self.bitrate_history.to_vec(),
                latency: self.latency_history.to_vec(),
                s11: self.s11_history.to_vec(),
            },
        });

        self.published.send_replace(snapshot.clone());
        if let Some(events) = &self.events {
            events.emit(MonitorEvent::Telemetry(snapshot.clone()));
        }
        snapshot
    }

    fn sample_bitrate(&mut self, now: Instant) {
        let bytes = self.counters.total_received_bytes();
        let elapsed = now.saturating_duration_since(self.last_tick).as_secs_f64();
        // 计数器回绕或网卡重置时按零处理
        let delta = bytes.saturating_sub(self.last_bytes);
        self.last_bytes = bytes;
        self.last_tick = now;
        if elapsed <= 0.0 {
            return;
        }
        let kbps = (delta as f64 * 8.0) / (1000.0 * elapsed);
        self.video_bitrate_kbps = kbps * VIDEO_SHARE;
        self.audio_bitrate_kbps = kbps * (1.0 - VIDEO_SHARE);

        if self.last_bitrate_log.map_or(true, |t| now.saturating_duration_since(t) >= SUMMARY_LOG_INTERVAL) {
            self.log(format!(
                "Network stats - Video bitrate: {:.0} kbps, Audio bitrate: {:.0} kbps",
                self.video_bitrate_kbps, self.audio_bitrate_kbps
            ));
            self.last_bitrate_log = Some(now);
        }
    }

    async fn sample_latency(&mut self) {
        let outcome = self.echo.probe().await;
        if let EchoOutcome::Latency(ms) = outcome {
            self.set_latency(ms);
            return;
        }
        log::debug!("Timestamp echo gave {:?}, falling back to ping", outcome);

        match self.pinger.ping().await {
            Some(ms) => {
                if in_range(ms) {
                    self.set_latency(ms);
                }
                self.packet_loss_percent = 0.0;
            }
            None => {
                if self.packet_loss_percent < 100.0 {
                    self.log("Sender not answering ping, reporting 100% packet loss".to_string());
                }
                self.packet_loss_percent = 100.0;
            }
        }
    }

    fn set_latency(&mut self, ms: f64) {
        self.video_latency_ms = ms;
        self.audio_latency_ms = ms;
        match self.reported_latency {
            None => {
                self.log(format!("Initial latency: {:.2} ms", ms));
                self.reported_latency = Some(ms);
            }
            Some(prev) if (ms - prev).abs() > LATENCY_LOG_DELTA_MS => {
                self.log(format!("Latency changed: {:.2} ms", ms));
                self.reported_latency = Some(ms);
            }
            Some(_) => {}
        }
    }

    fn sample_fps(&mut self, now: Instant) -> f64 {
        let fps = match self.frame_rate.lock() {
            Ok(mut w) => w.rate(now),
            Err(poisoned) => poisoned.into_inner().rate(now),
        };
        let changed = (fps - self.reported_fps).abs() > FPS_LOG_DELTA;
        let stale = self.last_fps_log.map_or(true, |t| now.saturating_duration_since(t) >= SUMMARY_LOG_INTERVAL);
        if changed || stale {
            self.log(format!("Frame rate update: {:.0} FPS", fps));
            self.reported_fps = fps;
            self.last_fps_log = Some(now);
        }
        fps
    }

    fn log(&self, line: String) {
        log::info!("{}", line);
        if let Some(events) = &self.events {
            events.log(line);
        }
    }

    /// Ticks at the configured rate until shutdown.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 第一次 tick 立即触发，跳过以获得完整的计数区间
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = interval.tick() => {
                    self.tick(Instant::now()).await;
                }
            }
        }
        log::info!("Telemetry collector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct ScriptedCounters(VecDeque<u64>);

    impl InterfaceCounters for ScriptedCounters {
        fn total_received_bytes(&mut self) -> u64 {
            if self.0.len() > 1 { self.0.pop_front().unwrap_or(0) } else { self.0.front().copied().unwrap_or(0) }
        }
    }

    struct FixedEcho(EchoOutcome);

    #[async_trait]
    impl EchoProbe for FixedEcho {
        async fn probe(&self) -> EchoOutcome {
            self.0.clone()
        }
    }

    struct FixedPing(Option<f64>);

    #[async_trait]
    impl Pinger for FixedPing {
        async fn ping(&self) -> Option<f64> {
            self.0
        }
    }

    fn collector(
        bytes: Vec<u64>,
        echo: EchoOutcome,
        ping: Option<f64>,
    ) -> (TelemetryCollector, watch::Sender<Option<Decision>>) {
        let (tx, rx) = watch::channel(None);
        let c = TelemetryCollector::new(
            &Config::default(),
            Box::new(ScriptedCounters(bytes.into())),
            Arc::new(FixedEcho(echo)),
            Arc::new(FixedPing(ping)),
            rx,
        );
        (c, tx)
    }

    #[tokio::test]
    async fn bitrate_splits_ninety_ten() {
        // 125_000 bytes in one second = 1000 kbps
        let (mut c, _tx) = collector(vec![0, 125_000], EchoOutcome::Latency(20.0), None);
        let start = c.started;
        let s = c.tick(start + Duration::from_secs(1)).await;
        assert!((s.video_bitrate_kbps - 900.0).abs() < 1e-9);
        assert!((s.audio_bitrate_kbps - 100.0).abs() < 1e-9);
        assert!((s.total_bitrate_kbps() - 1000.0).abs() < 1e-9);
        assert_eq!(s.history.bitrate, vec![s.total_bitrate_kbps()]);
    }

    #[tokio::test]
    async fn echo_latency_is_used_when_available() {
        let (mut c, _tx) = collector(vec![0], EchoOutcome::Latency(42.0), None);
        let s = c.tick(c.started + Duration::from_secs(1)).await;
        assert_eq!(s.video_latency_ms, 42.0);
        assert_eq!(s.audio_latency_ms, 42.0);
        assert_eq!(s.packet_loss_percent, 0.0);
    }

    #[tokio::test]
    async fn no_echo_data_falls_back_to_ping() {
        let (mut c, _tx) = collector(vec![0], EchoOutcome::NoData, Some(7.5));
        let s = c.tick(c.started + Duration::from_secs(1)).await;
        assert_eq!(s.video_latency_ms, 7.5);
        assert_eq!(s.packet_loss_percent, 0.0);
    }

    #[tokio::test]
    async fn failed_ping_reports_full_loss() {
        let (mut c, _tx) = collector(vec![0], EchoOutcome::Timeout, None);
        let s = c.tick(c.started + Duration::from_secs(1)).await;
        assert_eq!(s.packet_loss_percent, 100.0);
        assert_eq!(s.video_latency_ms, 0.0);
    }

    #[tokio::test]
    async fn out_of_range_ping_is_not_an_update() {
        let (mut c, _tx) = collector(vec![0], EchoOutcome::OutOfRange(9000.0), Some(6000.0));
        let s = c.tick(c.started + Duration::from_secs(1)).await;
        assert_eq!(s.video_latency_ms, 0.0);
        assert_eq!(s.packet_loss_percent, 0.0);
    }

    #[tokio::test]
    async fn latency_is_probed_every_other_tick() {
        let (mut c, _tx) = collector(vec![0], EchoOutcome::Latency(10.0), None);
        let t0 = c.started;
        c.tick(t0 + Duration::from_secs(1)).await;
        c.echo = Arc::new(FixedEcho(EchoOutcome::Latency(99.0)));
        let s = c.tick(t0 + Duration::from_secs(2)).await;
        assert_eq!(s.video_latency_ms, 10.0);
        let s = c.tick(t0 + Duration::from_secs(3)).await;
        assert_eq!(s.video_latency_ms, 99.0);
    }

    #[tokio::test]
    async fn histories_stay_aligned_and_capped() {
        let (mut c, tx) = collector(vec![0], EchoOutcome::Latency(5.0), None);
        let t0 = c.started;
        let mut last = None;
        for i in 1..=45u64 {
            if i == 10 {
                tx.send_replace(Some(Decision::new(-50.0, 12.5)));
            }
            last = Some(c.tick(t0 + Duration::from_secs(i)).await);
        }
        let s = last.unwrap();
        let h = &s.history;
        assert_eq!(h.timestamps.len(), 30);
        assert_eq!(h.bitrate.len(), 30);
        assert_eq!(h.latency.len(), 30);
        assert_eq!(h.s11.len(), 30);
        assert_eq!(h.timestamps[0], 16.0);
        assert_eq!(h.timestamps[29], 45.0);
        assert!(h.s11.iter().all(|v| *v == Some(-50.0)));
    }

    #[tokio::test]
    async fn s11_history_is_null_before_first_decision() {
        let (mut c, _tx) = collector(vec![0], EchoOutcome::NoData, Some(1.0));
        let s = c.tick(c.started + Duration::from_secs(1)).await;
        assert_eq!(s.history.s11, vec![None]);
    }

    #[tokio::test]
    async fn publish_is_a_whole_snapshot() {
        let (mut c, _tx) = collector(vec![0], EchoOutcome::Latency(5.0), None);
        let mut rx = c.subscribe();
        let s = c.tick(c.started + Duration::from_secs(1)).await;
        assert!(rx.has_changed().unwrap());
        assert!(Arc::ptr_eq(&rx.borrow_and_update(), &s));
    }

    #[tokio::test]
    async fn frame_window_feeds_fps() {
        let (mut c, _tx) = collector(vec![0], EchoOutcome::Latency(5.0), None);
        let now = c.started + Duration::from_secs(2);
        {
            let window = c.frame_rate();
            let mut w = window.lock().unwrap();
            for i in 0..25 {
                w.record(now - Duration::from_millis(960 - i * 40));
            }
        }
        let s = c.tick(now).await;
        assert_eq!(s.video_fps, 25.0);
    }
}
