//! Wire formats: the newline-framed decision protocol (TCP) and the
//! timestamp echo protocol (UDP).

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::decision::Decision;
use crate::error::ProtocolError;

pub const GET_DECISION: &str = "GET_DECISION";
pub const UNKNOWN_REQUEST: &str = "UNKNOWN_REQUEST";

/// Wall-clock format used for every timestamp on the echo protocol.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Reads one `\n`-terminated frame of at most `max_len` bytes (terminator
/// excluded). A trailing `\r` is stripped.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<String, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(max_len as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Err(ProtocolError::Closed);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() > max_len {
            return Err(ProtocolError::FrameTooLong(max_len));
        }
        // 对端在帧中途关闭
        return Err(ProtocolError::Closed);
    }
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8(buf).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

pub async fn write_frame<W>(writer: &mut W, frame: &str) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorReply {
    error: String,
}

/// Server-side reply to one request frame.
pub fn decision_reply(request: &str, current: &Decision) -> String {
    let result = if request.trim() == GET_DECISION {
        serde_json::to_string(current)
    } else {
        serde_json::to_string(&ErrorReply { error: UNKNOWN_REQUEST.to_string() })
    };
    // 两种结构都只含有限浮点和字符串，序列化不会失败
    result.unwrap_or_else(|_| format!(r#"{{"error":"{}"}}"#, UNKNOWN_REQUEST))
}

/// Client-side parsing of a decision reply frame.
pub fn parse_decision_reply(frame: &str) -> Result<Decision, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if let Some(err) = value.get("error").and_then(|e| e.as_str()) {
        return Err(ProtocolError::Remote(err.to_string()));
    }
    let decision: Decision =
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if !decision.is_consistent() {
        return Err(ProtocolError::Malformed(format!(
            "mode {} does not match code {}",
            decision.mode, decision.mode_code
        )));
    }
    Ok(decision)
}

// ---- timestamp echo protocol ----

pub const ECHO_TIMESTAMP: &str = "TIMESTAMP";
pub const ECHO_GET_FRAME_PREFIX: &str = "GET_FRAME_";
pub const ECHO_LATEST_FRAME: &str = "LATEST_FRAME";
pub const FRAME_NOT_FOUND: &str = "FRAME_NOT_FOUND";
pub const INVALID_FRAME_ID: &str = "INVALID_FRAME_ID";
pub const NO_FRAMES_AVAILABLE: &str = "NO_FRAMES_AVAILABLE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EchoRequest {
    Timestamp,
    Frame(u64),
    /// `GET_FRAME_` followed by something that is not a frame id.
    InvalidFrame,
    Latest,
}

impl EchoRequest {
    /// `None` for datagrams that are not echo requests at all.
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(datagram).ok()?.trim();
        if text == ECHO_TIMESTAMP {
            Some(EchoRequest::Timestamp)
        } else if text == ECHO_LATEST_FRAME {
            Some(EchoRequest::Latest)
        } else if let Some(id) = text.strip_prefix(ECHO_GET_FRAME_PREFIX) {
            Some(id.parse().map(EchoRequest::Frame).unwrap_or(EchoRequest::InvalidFrame))
        } else {
            None
        }
    }

    pub fn encode(&self) -> String {
        match self {
            EchoRequest::Timestamp => ECHO_TIMESTAMP.to_string(),
            EchoRequest::Frame(id) => format!("{}{}", ECHO_GET_FRAME_PREFIX, id),
            EchoRequest::InvalidFrame => format!("{}?", ECHO_GET_FRAME_PREFIX),
            EchoRequest::Latest => ECHO_LATEST_FRAME.to_string(),
        }
    }
}

/// Frame id and its capture time, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameStamp {
    pub frame_id: u64,
    pub timestamp: String,
}

impl FrameStamp {
    pub fn new(frame_id: u64, captured_at: DateTime<Local>) -> Self {
        Self {
            frame_id,
            timestamp: format_timestamp(captured_at),
        }
    }

    pub fn captured_at(&self) -> Option<DateTime<Local>> {
        parse_timestamp(&self.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EchoReply {
    Time(String),
    Frame(FrameStamp),
    FrameNotFound,
    InvalidFrameId,
    NoFramesAvailable,
}

impl EchoReply {
    pub fn encode(&self) -> String {
        match self {
            EchoReply::Time(t) => t.clone(),
            EchoReply::Frame(stamp) => serde_json::to_string(stamp)
                .unwrap_or_else(|_| FRAME_NOT_FOUND.to_string()),
            EchoReply::FrameNotFound => FRAME_NOT_FOUND.to_string(),
            EchoReply::InvalidFrameId => INVALID_FRAME_ID.to_string(),
            EchoReply::NoFramesAvailable => NO_FRAMES_AVAILABLE.to_string(),
        }
    }

    /// Parses a reply datagram; `None` means garbled.
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(datagram).ok()?.trim();
        match text {
            FRAME_NOT_FOUND => Some(EchoReply::FrameNotFound),
            INVALID_FRAME_ID => Some(EchoReply::InvalidFrameId),
            NO_FRAMES_AVAILABLE => Some(EchoReply::NoFramesAvailable),
            _ if text.starts_with('{') => serde_json::from_str(text).ok().map(EchoReply::Frame),
            _ => parse_timestamp(text).map(|_| EchoReply::Time(text.to_string())),
        }
    }
}

pub fn format_timestamp(t: DateTime<Local>) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).ok()?;
    Local.from_local_datetime(&naive).earliest()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn frames_split_on_newline() {
        let data: &[u8] = b"GET_DECISION\nGET_DECISION\r\n";
        let mut reader = BufReader::new(data);
        assert_eq!(read_frame(&mut reader, 64).await.unwrap(), "GET_DECISION");
        assert_eq!(read_frame(&mut reader, 64).await.unwrap(), "GET_DECISION");
        assert!(matches!(read_frame(&mut reader, 64).await, Err(ProtocolError::Closed)));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let data = vec![b'x'; 100];
        let mut reader = BufReader::new(&data[..]);
        assert!(matches!(read_frame(&mut reader, 16).await, Err(ProtocolError::FrameTooLong(16))));
    }

    #[tokio::test]
    async fn frame_of_exactly_max_len_is_accepted() {
        let mut data = vec![b'a'; 16];
        data.push(b'\n');
        let mut reader = BufReader::new(&data[..]);
        assert_eq!(read_frame(&mut reader, 16).await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn partial_frame_at_eof_is_closed() {
        let data: &[u8] = b"GET_DEC";
        let mut reader = BufReader::new(data);
        assert!(matches!(read_frame(&mut reader, 64).await, Err(ProtocolError::Closed)));
    }

    #[test]
    fn decision_request_and_unknown_token() {
        let d = Decision::fallback();
        let reply = decision_reply("GET_DECISION", &d);
        assert_eq!(parse_decision_reply(&reply).unwrap(), d);

        let err = decision_reply("HELLO", &d);
        assert_eq!(err, r#"{"error":"UNKNOWN_REQUEST"}"#);
        assert!(matches!(parse_decision_reply(&err), Err(ProtocolError::Remote(_))));
    }

    #[test]
    fn inconsistent_reply_is_malformed() {
        let raw = r#"{"mode":"Advanced AV Mode","mode_code":1,"s11_mean":-30.0,"defuzzified_value":40.0}"#;
        assert!(matches!(parse_decision_reply(raw), Err(ProtocolError::Malformed(_))));
        assert!(matches!(parse_decision_reply("not json"), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn echo_requests_parse() {
        assert_eq!(EchoRequest::parse(b"TIMESTAMP"), Some(EchoRequest::Timestamp));
        assert_eq!(EchoRequest::parse(b"LATEST_FRAME"), Some(EchoRequest::Latest));
        assert_eq!(EchoRequest::parse(b"GET_FRAME_42"), Some(EchoRequest::Frame(42)));
        assert_eq!(EchoRequest::parse(b"GET_FRAME_x1"), Some(EchoRequest::InvalidFrame));
        assert_eq!(EchoRequest::parse(b"GET_FRAME_-3"), Some(EchoRequest::InvalidFrame));
        assert_eq!(EchoRequest::parse(b"PING"), None);
        assert_eq!(EchoRequest::parse(&[0xff, 0xfe]), None);
    }

    #[test]
    fn echo_replies_distinguish_no_data_from_garbage() {
        assert_eq!(EchoReply::parse(b"NO_FRAMES_AVAILABLE"), Some(EchoReply::NoFramesAvailable));
        assert_eq!(EchoReply::parse(b"FRAME_NOT_FOUND"), Some(EchoReply::FrameNotFound));
        assert_eq!(EchoReply::parse(b"garbled"), None);

        let stamp = FrameStamp { frame_id: 7, timestamp: "2024-05-01 12:00:00.250000".into() };
        let wire = EchoReply::Frame(stamp.clone()).encode();
        assert_eq!(EchoReply::parse(wire.as_bytes()), Some(EchoReply::Frame(stamp.clone())));
        assert!(stamp.captured_at().is_some());

        let time = EchoReply::parse(b"2024-05-01 12:00:00.000001");
        assert!(matches!(time, Some(EchoReply::Time(_))));
    }
}
