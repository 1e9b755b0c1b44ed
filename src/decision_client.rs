//! Receiver-side decision client. Polls over one persistent connection and
//! carries the last decision forward across outages.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::backoff::BackoffPolicy;
use crate::config::Config;
use crate::decision::Decision;
use crate::error::ProtocolError;
use crate::events::{EventSink, MonitorEvent};
use crate::protocol::{GET_DECISION, parse_decision_reply, read_frame, write_frame};
use crate::shutdown::Shutdown;

type Observer = Box<dyn FnMut(Option<&Decision>, &Decision) + Send>;

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

pub struct DecisionClient {
    addr: SocketAddr,
    poll_interval: Duration,
    io_timeout: Duration,
    max_frame_len: usize,
    backoff: BackoffPolicy,
    conn: Option<Connection>,
    last: Option<Decision>,
    published: watch::Sender<Option<Decision>>,
    observer: Option<Observer>,
    events: Option<EventSink>,
}

impl DecisionClient {
    pub fn new(addr: SocketAddr, config: &Config) -> Self {
        let (published, _) = watch::channel(None);
        Self {
            addr,
            poll_interval: config.poll_interval(),
            io_timeout: Duration::from_millis(config.connect_timeout_ms),
            max_frame_len: config.max_frame_len,
            backoff: BackoffPolicy::from_config(config),
            conn: None,
            last: None,
            published,
            observer: None,
            events: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = policy;
        self
    }

    /// Called only when mode or mode code differs from the previous decision.
    pub fn on_change(mut self, observer: impl FnMut(Option<&Decision>, &Decision) + Send + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    /// Latest decision, `None` until the first successful poll.
    pub fn subscribe(&self) -> watch::Receiver<Option<Decision>> {
        self.published.subscribe()
    }

    pub fn last(&self) -> Option<Decision> {
        self.last
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    async fn connect(&mut self) -> Result<&mut Connection, ProtocolError> {
        if self.conn.is_none() {
            log::info!("Connecting to decision service at {}", self.addr);
            let stream = timeout(self.io_timeout, TcpStream::connect(self.addr))
                .await
                .map_err(|_| ProtocolError::Timeout)??;
            stream.set_nodelay(true)?;
            let (r, w) = stream.into_split();
            log::info!("Connected to decision service at {}", self.addr);
            if let Some(events) = &self.events {
                events.log(format!("Connected to decision service at {}", self.addr));
            }
            self.conn = Some(Connection {
                reader: BufReader::new(r),
                writer: w,
            });
        }
        self.conn.as_mut().ok_or(ProtocolError::Closed)
    }

    /// One request/response exchange. Any failure drops the connection.
    pub async fn poll_once(&mut self) -> Result<Decision, ProtocolError> {
        let result = self.exchange().await;
        match result {
            Ok(decision) => {
                self.accept(decision);
                Ok(decision)
            }
            Err(e) => {
                if self.conn.take().is_some() {
                    log::warn!("Decision service connection lost: {}", e);
                    if let Some(events) = &self.events {
                        events.log(format!("Decision service connection lost: {}", e));
                    }
                }
                Err(e)
            }
        }
    }

    async fn exchange(&mut self) -> Result<Decision, ProtocolError> {
        let io_timeout = self.io_timeout;
        let max_frame_len = self.max_frame_len;
        let conn = self.connect().await?;
        timeout(io_timeout, write_frame(&mut conn.writer, GET_DECISION))
            .await
            .map_err(|_| ProtocolError::Timeout)??;
        let frame = timeout(io_timeout, read_frame(&mut conn.reader, max_frame_len))
            .await
            .map_err(|_| ProtocolError::Timeout)??;
        parse_decision_reply(&frame)
    }

    /// Polls once and returns the freshest decision known, which is the
    /// previous one when this poll failed.
    pub async fn poll(&mut self) -> Option<Decision> {
        if let Err(e) = self.poll_once().await {
            log::debug!("Decision poll failed: {}", e);
        }
        self.last
    }

    fn accept(&mut self, decision: Decision) {
        let previous = self.last.replace(decision);
        self.published.send_replace(Some(decision));
        let changed = previous.map_or(true, |p| p.mode_changed(&decision));
        if !changed {
            return;
        }
        log::info!("Decision changed: {} (S11: {:.2} dB)", decision.mode, decision.s11_mean);
        if let Some(events) = &self.events {
            events.emit(MonitorEvent::Decision(decision));
        }
        if let Some(observer) = self.observer.as_mut() {
            observer(previous.as_ref(), &decision);
        }
    }

    /// Polls every interval; after a failure waits out the backoff before
    /// reconnecting. Returns on shutdown.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        let mut backoff = self.backoff.start();
        loop {
            let delay = match self.poll_once().await {
                Ok(_) => {
                    backoff.reset();
                    self.poll_interval
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    if backoff.attempt() == 1 {
                        log::warn!("Decision service unreachable ({}), retrying in {:?}", e, delay);
                    } else {
                        log::debug!("Decision service still unreachable ({}), retry {} in {:?}", e, backoff.attempt(), delay);
                    }
                    delay
                }
            };
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.conn = None;
        log::info!("Decision client stopped");
    }
}
