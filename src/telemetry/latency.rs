//! Latency measurement paths: the in-band timestamp echo and the ICMP ping
//! fallback.

use async_trait::async_trait;
use chrono::Local;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::process::Command;
use tokio::time::{Instant, timeout};

use crate::protocol::{EchoReply, EchoRequest};

/// Accepted latency range in milliseconds; anything else is measurement noise.
pub const LATENCY_RANGE_MS: (f64, f64) = (0.0, 5000.0);

pub fn in_range(ms: f64) -> bool {
    ms.is_finite() && ms >= LATENCY_RANGE_MS.0 && ms <= LATENCY_RANGE_MS.1
}

#[derive(Debug, Clone, PartialEq)]
pub enum EchoOutcome {
    Latency(f64),
    /// The sender has not stamped any frame yet.
    NoData,
    Timeout,
    OutOfRange(f64),
    Garbled,
}

#[async_trait]
pub trait EchoProbe: Send + Sync {
    async fn probe(&self) -> EchoOutcome;
}

#[async_trait]
pub trait Pinger: Send + Sync {
    /// Round-trip time in ms, `None` when the host did not answer.
    async fn ping(&self) -> Option<f64>;
}

/// Asks the sender for its latest frame stamp and compares it to local time.
///
/// Replies that arrive after their request timed out are discarded before the
/// next request goes out, and a frame id at or below the last measured one is
/// never measured again.
pub struct UdpEchoProbe {
    socket: UdpSocket,
    server: SocketAddr,
    timeout: Duration,
    last_frame: Mutex<Option<u64>>,
}

impl UdpEchoProbe {
    pub async fn connect(server: SocketAddr, timeout: Duration) -> std::io::Result<Self> {
        let local = if server.is_ipv4() {
            SocketAddr::from(([0u8; 4], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local).await?;
        Ok(Self {
            socket,
            server,
            timeout,
            last_frame: Mutex::new(None),
        })
    }

    fn drain_late_replies(&self, buf: &mut [u8]) {
        let mut dropped = 0usize;
        while self.socket.try_recv_from(buf).is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            log::debug!("Discarded {} late timestamp replies", dropped);
        }
    }

    /// Records `frame_id` as measured unless it is not newer than the last one.
    fn accept_frame(&self, frame_id: u64) -> bool {
        let mut last = self.last_frame.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if last.is_some_and(|seen| frame_id <= seen) {
            return false;
        }
        *last = Some(frame_id);
        true
    }
}

#[async_trait]
impl EchoProbe for UdpEchoProbe {
    async fn probe(&self) -> EchoOutcome {
        let mut buf = [0u8; 1024];
        self.drain_late_replies(&mut buf);

        let request = EchoRequest::Latest.encode();
        if let Err(e) = self.socket.send_to(request.as_bytes(), self.server).await {
            log::debug!("Timestamp request failed: {}", e);
            return EchoOutcome::Timeout;
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (len, from) = match timeout(remaining, self.socket.recv_from(&mut buf)).await {
                Ok(Ok(r)) => r,
                Ok(Err(e)) => {
                    log::debug!("Timestamp reply error: {}", e);
                    return EchoOutcome::Timeout;
                }
                Err(_) => return EchoOutcome::Timeout,
            };
            // 只接受来自发送端的应答
            if from != self.server {
                continue;
            }
            let received_at = Local::now();
            return match EchoReply::parse(&buf[..len]) {
                Some(EchoReply::NoFramesAvailable) => EchoOutcome::NoData,
                Some(EchoReply::Frame(stamp)) if !self.accept_frame(stamp.frame_id) => {
                    log::debug!("Ignoring stale frame {}", stamp.frame_id);
                    continue;
                }
                Some(EchoReply::Frame(stamp)) => match stamp.captured_at() {
                    Some(captured) => {
                        let ms = (received_at - captured).num_microseconds().unwrap_or(i64::MAX) as f64 / 1000.0;
                        if in_range(ms) { EchoOutcome::Latency(ms) } else { EchoOutcome::OutOfRange(ms) }
                    }
                    None => EchoOutcome::Garbled,
                },
                _ => EchoOutcome::Garbled,
            };
        }
    }
}

/// `ping -c 1 -W <secs> <host>`.
pub struct PingProbe {
    host: String,
    timeout_secs: u64,
}

impl PingProbe {
    pub fn new(host: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            host: host.into(),
            timeout_secs: timeout_secs.max(1),
        }
    }
}

#[async_trait]
impl Pinger for PingProbe {
    async fn ping(&self) -> Option<f64> {
        let run = Command::new("ping")
            .args(["-c", "1", "-W", &self.timeout_secs.to_string(), &self.host])
            .kill_on_drop(true)
            .output();
        let limit = Duration::from_secs(self.timeout_secs + 1);
        let output = match timeout(limit, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                log::debug!("Failed to run ping: {}", e);
                return None;
            }
            Err(_) => return None,
        };
        if !output.status.success() {
            return None;
        }
        parse_ping_time(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Extracts `time=<ms> ms` from ping output.
pub fn parse_ping_time(output: &str) -> Option<f64> {
    let start = output.find("time=")? + "time=".len();
    let rest = &output[start..];
    let end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
    rest[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::echo_service::EchoService;
    use crate::frames;
    use crate::protocol::FrameStamp;
    use crate::shutdown;
    use std::sync::Arc;

    #[test]
    fn parses_linux_ping_output() {
        let out = "PING 192.168.1.1 (192.168.1.1) 56(84) bytes of data.\n\
                   64 bytes from 192.168.1.1: icmp_seq=1 ttl=64 time=3.42 ms\n";
        assert_eq!(parse_ping_time(out), Some(3.42));
        assert_eq!(parse_ping_time("1 packets transmitted, 0 received"), None);
    }

    #[test]
    fn range_check() {
        assert!(in_range(0.0));
        assert!(in_range(5000.0));
        assert!(!in_range(-1.0));
        assert!(!in_range(5000.1));
        assert!(!in_range(f64::NAN));
    }

    #[tokio::test]
    async fn echo_probe_against_live_service() {
        let table = frames::shared(10);
        let service = Arc::new(EchoService::bind("127.0.0.1:0".parse().unwrap(), table.clone()).await.unwrap());
        let addr = service.local_addr().unwrap();
        let (trigger, stop) = shutdown::channel();
        let svc = service.clone();
        let task = tokio::spawn(async move { svc.run(stop).await });

        let probe = UdpEchoProbe::connect(addr, Duration::from_secs(2)).await.unwrap();
        assert_eq!(probe.probe().await, EchoOutcome::NoData);

        table.lock().unwrap().insert(1, Local::now());
        match probe.probe().await {
            EchoOutcome::Latency(ms) => assert!(in_range(ms)),
            other => panic!("unexpected {:?}", other),
        }

        trigger.trigger();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let probe = UdpEchoProbe::connect(silent.local_addr().unwrap(), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(probe.probe().await, EchoOutcome::Timeout);
    }

    /// Answers one `LATEST_FRAME` request with the given frame.
    async fn answer_latest(server: &UdpSocket, frame_id: u64, captured_at: chrono::DateTime<Local>) {
        let mut buf = [0u8; 256];
        let (len, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(EchoRequest::parse(&buf[..len]), Some(EchoRequest::Latest));
        let reply = EchoReply::Frame(FrameStamp::new(frame_id, captured_at)).encode();
        server.send_to(reply.as_bytes(), from).await.unwrap();
    }

    #[tokio::test]
    async fn late_reply_is_not_taken_for_the_next_one() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo = UdpEchoProbe::connect(server.local_addr().unwrap(), Duration::from_millis(100))
            .await
            .unwrap();

        // The first answer only arrives after the request has timed out.
        let mut buf = [0u8; 256];
        let (pending, first) = tokio::join!(echo.probe(), server.recv_from(&mut buf));
        assert_eq!(pending, EchoOutcome::Timeout);
        let (_, from) = first.unwrap();
        let stale = EchoReply::Frame(FrameStamp::new(5, Local::now() - chrono::Duration::seconds(1))).encode();
        server.send_to(stale.as_bytes(), from).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (outcome, ()) = tokio::join!(echo.probe(), answer_latest(&server, 6, Local::now()));
        match outcome {
            EchoOutcome::Latency(ms) => assert!(ms < 500.0, "measured the late reply: {} ms", ms),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn repeated_frame_is_not_measured_twice() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo = UdpEchoProbe::connect(server.local_addr().unwrap(), Duration::from_millis(100))
            .await
            .unwrap();
        let stamped = Local::now();

        let (first, ()) = tokio::join!(echo.probe(), answer_latest(&server, 7, stamped));
        assert!(matches!(first, EchoOutcome::Latency(_)));
        let (second, ()) = tokio::join!(echo.probe(), answer_latest(&server, 7, stamped));
        assert_eq!(second, EchoOutcome::Timeout);
    }
}
