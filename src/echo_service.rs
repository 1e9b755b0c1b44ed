use chrono::Local;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::frames::SharedFrameTable;
use crate::protocol::{EchoReply, EchoRequest, format_timestamp};
use crate::shutdown::Shutdown;

/// Timestamp echo responder. Each datagram is answered on its own; the only
/// shared state is the frame table.
pub struct EchoService {
    socket: Arc<UdpSocket>,
    frames: SharedFrameTable,
}

impl EchoService {
    pub async fn bind(addr: SocketAddr, frames: SharedFrameTable) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        log::info!("Timestamp service bound to {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
            frames,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// `TIMESTAMP` never touches the frame table.
    pub fn answer(&self, request: &EchoRequest) -> EchoReply {
        // 写入方 panic 不影响已记录的时间戳
        let table = || self.frames.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match request {
            EchoRequest::Timestamp => EchoReply::Time(format_timestamp(Local::now())),
            EchoRequest::Frame(id) => table().get(*id).map(EchoReply::Frame).unwrap_or(EchoReply::FrameNotFound),
            EchoRequest::InvalidFrame => EchoReply::InvalidFrameId,
            EchoRequest::Latest => table().latest().map(EchoReply::Frame).unwrap_or(EchoReply::NoFramesAvailable),
        }
    }

    pub async fn run(&self, mut shutdown: Shutdown) -> anyhow::Result<()> {
        let mut buf = [0u8; 1024];
        loop {
            let (len, peer) = tokio::select! {
                _ = shutdown.wait() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(r) => r,
                    Err(e) => {
                        // ICMP 端口不可达等错误不应终止服务
                        log::debug!("Timestamp service recv error: {}", e);
                        continue;
                    }
                },
            };
            let Some(request) = EchoRequest::parse(&buf[..len]) else {
                log::debug!("Ignoring unknown timestamp request from {}", peer);
                continue;
            };
            if request == EchoRequest::InvalidFrame {
                log::warn!("Invalid frame id from {}: {}", peer, String::from_utf8_lossy(&buf[..len]));
            }
            let reply = self.answer(&request).encode();
            if let Err(e) = self.socket.send_to(reply.as_bytes(), peer).await {
                log::warn!("Timestamp reply to {} failed: {}", peer, e);
            }
        }
        log::info!("Timestamp service stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames;
    use crate::shutdown;
    use std::time::Duration;

    async fn exchange(client: &UdpSocket, server: SocketAddr, request: &str) -> EchoReply {
        client.send_to(request.as_bytes(), server).await.unwrap();
        let mut buf = [0u8; 1024];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        EchoReply::parse(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn answers_each_request_kind() {
        let table = frames::shared(100);
        let service = Arc::new(EchoService::bind("127.0.0.1:0".parse().unwrap(), table.clone()).await.unwrap());
        let server = service.local_addr().unwrap();
        let (trigger, stop) = shutdown::channel();
        let svc = service.clone();
        let task = tokio::spawn(async move { svc.run(stop).await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        assert_eq!(exchange(&client, server, "LATEST_FRAME").await, EchoReply::NoFramesAvailable);

        table.lock().unwrap().insert(3, Local::now());
        table.lock().unwrap().insert(4, Local::now());

        match exchange(&client, server, "LATEST_FRAME").await {
            EchoReply::Frame(stamp) => assert_eq!(stamp.frame_id, 4),
            other => panic!("unexpected {:?}", other),
        }
        // Duplicates are answered the same way.
        match exchange(&client, server, "GET_FRAME_3").await {
            EchoReply::Frame(stamp) => assert_eq!(stamp.frame_id, 3),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(exchange(&client, server, "GET_FRAME_99").await, EchoReply::FrameNotFound);
        assert_eq!(exchange(&client, server, "GET_FRAME_abc").await, EchoReply::InvalidFrameId);
        assert!(matches!(exchange(&client, server, "TIMESTAMP").await, EchoReply::Time(_)));

        trigger.trigger();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn poisoned_table_still_answers() {
        let table = frames::shared(10);
        table.lock().unwrap().insert(1, Local::now());
        let poisoner = table.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("frame ticker died");
        })
        .join();
        assert!(table.is_poisoned());

        let service = EchoService::bind("127.0.0.1:0".parse().unwrap(), table).await.unwrap();
        assert!(matches!(service.answer(&EchoRequest::Timestamp), EchoReply::Time(_)));
        match service.answer(&EchoRequest::Latest) {
            EchoReply::Frame(stamp) => assert_eq!(stamp.frame_id, 1),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(service.answer(&EchoRequest::Frame(9)), EchoReply::FrameNotFound);
    }
}
