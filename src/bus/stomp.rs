//! STOMP 1.2 client transport.
//!
//! # Frame format
//!
//! ```text
//! COMMAND\n
//! key:value\n        (repeated, values escaped except in CONNECT/CONNECTED)
//! \n
//! body\0             (content-length used when present)
//! ```
//!
//! Bare newlines between frames are heart-beats and are skipped.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use secrecy::ExposeSecret;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedWriteHalf, TcpStream},
    sync::Mutex,
    task::JoinHandle,
};
use tracing::{debug, error, instrument, trace, warn};

use super::{
    message::{Headers, Message},
    transport::{
        Credentials, MessageHandler, MessageTransport, SubscriptionHandle, TransportError,
        TransportResult,
    },
};
use crate::{
    config::{ConfigError, ConfigResult, MessageBusDefinition, ARG_ADDRESS},
    topics::normalize_destination,
};

const READ_CHUNK: usize = 8 * 1024;
const RECENT_MESSAGE_IDS: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First occurrence wins for repeated headers.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn escapes_headers(&self) -> bool {
        self.command != "CONNECT" && self.command != "CONNECTED"
    }

    pub fn encode(&self) -> Vec<u8> {
        let escape = self.escapes_headers();
        let mut out = Vec::with_capacity(self.body.len() + 128);
        out.extend_from_slice(self.command.as_bytes());
        out.push(b'\n');
        for (k, v) in &self.headers {
            if k == "content-length" {
                continue;
            }
            if escape {
                out.extend_from_slice(escape_header(k).as_bytes());
                out.push(b':');
                out.extend_from_slice(escape_header(v).as_bytes());
            } else {
                out.extend_from_slice(k.as_bytes());
                out.push(b':');
                out.extend_from_slice(v.as_bytes());
            }
            out.push(b'\n');
        }
        if !self.body.is_empty() {
            out.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }

    /// Decodes one frame from the start of `buf`. Returns the frame and the
    /// number of bytes it occupied, or `None` if `buf` holds a partial frame.
    pub fn decode(buf: &[u8]) -> TransportResult<Option<(Frame, usize)>> {
        let Some(header_end) = find_header_end(buf) else {
            return Ok(None);
        };
        let (head_len, sep_len) = header_end;
        let head = std::str::from_utf8(&buf[..head_len])
            .map_err(|e| TransportError::Protocol(format!("invalid frame header: {}", e)))?;
        let mut lines = head.lines();
        let command = lines
            .next()
            .map(|c| c.trim_end_matches('\r').to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| TransportError::Protocol("missing command".to_string()))?;
        let unescape = command != "CONNECT" && command != "CONNECTED";

        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            let (k, v) = line
                .split_once(':')
                .ok_or_else(|| TransportError::Protocol(format!("malformed header: {}", line)))?;
            if unescape {
                headers.push((unescape_header(k)?, unescape_header(v)?));
            } else {
                headers.push((k.to_string(), v.to_string()));
            }
        }

        let body_start = head_len + sep_len;
        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| {
                v.parse::<usize>()
                    .map_err(|_| TransportError::Protocol(format!("bad content-length: {}", v)))
            })
            .transpose()?;

        let body_end = match content_length {
            Some(len) => {
                if buf.len() < body_start + len + 1 {
                    return Ok(None);
                }
                if buf[body_start + len] != 0 {
                    return Err(TransportError::Protocol(
                        "frame body not NUL terminated".to_string(),
                    ));
                }
                body_start + len
            }
            None => match buf[body_start..].iter().position(|b| *b == 0) {
                Some(pos) => body_start + pos,
                None => return Ok(None),
            },
        };

        let frame = Frame {
            command,
            headers,
            body: buf[body_start..body_end].to_vec(),
        };
        Ok(Some((frame, body_end + 1)))
    }
}

/// Position of the blank line ending the header block and its length.
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    for i in 0..buf.len() {
        if buf[i..].starts_with(b"\n\n") {
            return Some((i, 2));
        }
        if buf[i..].starts_with(b"\r\n\r\n") {
            return Some((i, 4));
        }
    }
    None
}

fn leading_heartbeats(buf: &[u8]) -> usize {
    buf.iter().take_while(|b| **b == b'\n' || **b == b'\r').count()
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(value: &str) -> TransportResult<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            other => {
                return Err(TransportError::Protocol(format!(
                    "undefined header escape: \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

/// Reads until one full frame is buffered. `None` on a clean EOF.
///
/// Every frame ends in NUL, so decoding is only retried when a NUL shows up
/// past the bytes already scanned.
async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> TransportResult<Option<Frame>> {
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut scanned: usize = 0;
    loop {
        let skip = leading_heartbeats(buf);
        buf.drain(..skip);
        scanned = scanned.saturating_sub(skip);
        if buf[scanned..].contains(&0) {
            if let Some((frame, used)) = Frame::decode(buf)? {
                buf.drain(..used);
                return Ok(Some(frame));
            }
        }
        scanned = buf.len();
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn parse_address(address: &str) -> ConfigResult<String> {
    let host_port = address
        .strip_prefix("tcp://")
        .or_else(|| address.strip_prefix("stomp://"))
        .unwrap_or(address);
    if !host_port.contains(':') {
        return Err(ConfigError::Invalid(format!(
            "broker address must be host:port, got {}",
            address
        )));
    }
    Ok(host_port.to_string())
}

struct Connection {
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

pub struct StompTransport {
    address: String,
    connection: Mutex<Option<Connection>>,
    handlers: Arc<DashMap<String, MessageHandler>>,
    connected: Arc<AtomicBool>,
}

impl StompTransport {
    pub fn new(address: &str) -> ConfigResult<Self> {
        Ok(Self {
            address: parse_address(address)?,
            connection: Mutex::new(None),
            handlers: Arc::new(DashMap::new()),
            connected: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn from_definition(definition: &MessageBusDefinition) -> ConfigResult<Self> {
        Self::new(&definition.require_arg(ARG_ADDRESS)?)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn write(&self, frame: Frame) -> TransportResult<()> {
        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(TransportError::NotConnected)?;
        trace!("Sending {} frame", frame.command);
        connection.writer.write_all(&frame.encode()).await?;
        Ok(())
    }
}

fn connect_frame(host: &str, credentials: &Credentials) -> Frame {
    let frame = Frame::new("CONNECT")
        .header("accept-version", "1.2")
        .header("host", host)
        .header("heart-beat", "0,0");
    match credentials {
        Credentials::Anonymous => frame,
        Credentials::Basic { user, password } => frame
            .header("login", user.as_str())
            .header("passcode", password.expose_secret()),
        Credentials::Token { token, .. } => frame
            .header("login", token.expose_secret())
            .header("passcode", ""),
    }
}

async fn reader_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    mut buf: Vec<u8>,
    handlers: Arc<DashMap<String, MessageHandler>>,
    connected: Arc<AtomicBool>,
) {
    let mut recent: VecDeque<(String, usize)> = VecDeque::with_capacity(RECENT_MESSAGE_IDS);
    loop {
        let frame = match read_frame(&mut reader, &mut buf).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                warn!("Broker closed the connection");
                break;
            }
            Err(e) => {
                error!("Failed to read from broker: {}", e);
                break;
            }
        };
        match frame.command.as_str() {
            "MESSAGE" => dispatch_message(frame, &handlers, &mut recent),
            "ERROR" => error!(
                "Broker error: {} {}",
                frame.get("message").unwrap_or_default(),
                String::from_utf8_lossy(&frame.body)
            ),
            other => trace!("Ignoring {} frame", other),
        }
    }
    connected.store(false, Ordering::SeqCst);
}

fn dispatch_message(
    frame: Frame,
    handlers: &DashMap<String, MessageHandler>,
    recent: &mut VecDeque<(String, usize)>,
) {
    let Some(handler) = frame
        .get("subscription")
        .and_then(|id| handlers.get(id).map(|h| h.value().clone()))
    else {
        debug!("MESSAGE for unknown subscription dropped");
        return;
    };

    // 同じハンドラへの重複配信を抑止する
    if let Some(message_id) = frame.get("message-id") {
        let key = (message_id.to_string(), Arc::as_ptr(&handler) as *const () as usize);
        if recent.contains(&key) {
            trace!("Duplicate delivery of {} suppressed", message_id);
            return;
        }
        if recent.len() == RECENT_MESSAGE_IDS {
            recent.pop_front();
        }
        recent.push_back(key);
    }

    let mut headers = Headers::new();
    for (k, v) in &frame.headers {
        headers.entry(k.clone()).or_insert_with(|| v.clone());
    }
    let destination = normalize_destination(frame.get("destination").unwrap_or_default());
    handler(Message {
        destination,
        headers,
        body: String::from_utf8_lossy(&frame.body).into_owned(),
    });
}

#[async_trait]
impl MessageTransport for StompTransport {
    #[instrument(skip(self, credentials), fields(address = %self.address))]
    async fn connect(&self, credentials: &Credentials) -> TransportResult<()> {
        let mut guard = self.connection.lock().await;
        if guard.is_some() && self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(stale) = guard.take() {
            stale.reader.abort();
        }

        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| TransportError::Connection(format!("{}: {}", self.address, e)))?;
        let (mut reader, mut writer) = stream.into_split();
        let host = self.address.split(':').next().unwrap_or_default();
        writer
            .write_all(&connect_frame(host, credentials).encode())
            .await?;

        let mut buf = Vec::new();
        let reply = read_frame(&mut reader, &mut buf)
            .await?
            .ok_or_else(|| TransportError::Connection("connection closed during handshake".into()))?;
        match reply.command.as_str() {
            "CONNECTED" => {}
            "ERROR" => {
                return Err(TransportError::Connection(
                    reply
                        .get("message")
                        .map(str::to_string)
                        .unwrap_or_else(|| String::from_utf8_lossy(&reply.body).into_owned()),
                ))
            }
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected CONNECTED, got {}",
                    other
                )))
            }
        }
        debug!("Connected to broker, version {:?}", reply.get("version"));

        self.connected.store(true, Ordering::SeqCst);
        let reader = tokio::spawn(reader_loop(
            reader,
            buf,
            self.handlers.clone(),
            self.connected.clone(),
        ));
        *guard = Some(Connection { writer, reader });
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        let Some(mut connection) = self.connection.lock().await.take() else {
            return Ok(());
        };
        let _ = connection.writer.write_all(&Frame::new("DISCONNECT").encode()).await;
        let _ = connection.writer.shutdown().await;
        connection.reader.abort();
        self.handlers.clear();
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, destination: &str, headers: &Headers, body: &str) -> TransportResult<()> {
        let mut frame = Frame::new("SEND").header("destination", normalize_destination(destination));
        for (k, v) in headers {
            frame = frame.header(k.as_str(), v.as_str());
        }
        self.write(frame.with_body(body.as_bytes().to_vec())).await
    }

    async fn subscribe(
        &self,
        destination: &str,
        handler: MessageHandler,
    ) -> TransportResult<SubscriptionHandle> {
        let handle = SubscriptionHandle::new();
        self.handlers.insert(handle.to_string(), handler);
        let frame = Frame::new("SUBSCRIBE")
            .header("id", handle.as_str())
            .header("destination", normalize_destination(destination))
            .header("ack", "auto");
        if let Err(e) = self.write(frame).await {
            self.handlers.remove(handle.as_str());
            return Err(e);
        }
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> TransportResult<()> {
        if self.handlers.remove(handle.as_str()).is_none() {
            return Err(TransportError::SubscriptionNotFound(handle.to_string()));
        }
        self.write(Frame::new("UNSUBSCRIBE").header("id", handle.as_str()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::time::Duration;
    use tokio::{net::TcpListener, time::sleep};

    #[test]
    fn test_encode_decode_with_escaping() {
        let frame = Frame::new("SEND")
            .header("destination", "/queue/a")
            .header("note", "a:b\nc")
            .with_body(b"{\"x\":1}".to_vec());
        let bytes = frame.encode();
        let (decoded, used) = Frame::decode(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded.get("note"), Some("a:b\nc"));
        assert_eq!(decoded.get("content-length"), Some("7"));
        assert_eq!(decoded.body, b"{\"x\":1}".to_vec());
    }

    #[test]
    fn test_partial_frame_needs_more_bytes() {
        let bytes = Frame::new("MESSAGE").with_body(b"hello".to_vec()).encode();
        assert!(Frame::decode(&bytes[..bytes.len() - 3]).unwrap().is_none());
        assert!(Frame::decode(b"MESSAGE\ndestination:/q").unwrap().is_none());
    }

    #[test]
    fn test_body_without_content_length_and_crlf() {
        let raw = b"MESSAGE\r\ndestination:/topic/a\r\n\r\nhi\0rest";
        let (frame, used) = Frame::decode(raw).unwrap().unwrap();
        assert_eq!(frame.get("destination"), Some("/topic/a"));
        assert_eq!(frame.body, b"hi".to_vec());
        assert_eq!(&raw[used..], b"rest");
    }

    #[tokio::test]
    async fn test_large_frame_read_in_small_pieces() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        let body = vec![b'x'; 20_000];
        let mut raw = b"MESSAGE\ndestination:/topic/big\n\n".to_vec();
        raw.extend_from_slice(&body);
        raw.push(0);
        raw.extend_from_slice(&Frame::new("RECEIPT").header("receipt-id", "7").encode());
        tokio::spawn(async move {
            tokio::io::AsyncWriteExt::write_all(&mut writer, &raw).await.unwrap();
        });

        let mut buf = Vec::new();
        let big = read_frame(&mut reader, &mut buf).await.unwrap().unwrap();
        assert_eq!(big.get("destination"), Some("/topic/big"));
        assert_eq!(big.body, body);
        let receipt = read_frame(&mut reader, &mut buf).await.unwrap().unwrap();
        assert_eq!(receipt.command, "RECEIPT");
        assert_eq!(receipt.get("receipt-id"), Some("7"));
        assert!(read_frame(&mut reader, &mut buf).await.unwrap().is_none());
    }

    #[test]
    fn test_invalid_escape_rejected() {
        assert!(Frame::decode(b"MESSAGE\nkey:bad\\t\n\n\0").is_err());
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("tcp://gridappsd:61613").unwrap(), "gridappsd:61613");
        assert_eq!(parse_address("localhost:61613").unwrap(), "localhost:61613");
        assert!(parse_address("localhost").is_err());
    }

    #[tokio::test]
    async fn test_handshake_subscribe_and_dedupe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let broker = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let connect = read_frame(&mut socket, &mut buf).await.unwrap().unwrap();
            assert_eq!(connect.command, "CONNECT");
            assert_eq!(connect.get("login"), Some("system"));
            socket
                .write_all(&Frame::new("CONNECTED").header("version", "1.2").encode())
                .await
                .unwrap();

            let subscribe = read_frame(&mut socket, &mut buf).await.unwrap().unwrap();
            assert_eq!(subscribe.get("destination"), Some("/topic/goss.gridappsd.field.sw1"));
            let sub_id = subscribe.get("id").unwrap().to_string();

            let message = Frame::new("MESSAGE")
                .header("subscription", sub_id.as_str())
                .header("message-id", "m-1")
                .header("destination", "/topic/goss.gridappsd.field.sw1")
                .with_body(b"payload".to_vec());
            // ハートビートを挟んで同じメッセージを二回送る
            socket.write_all(b"\n").await.unwrap();
            socket.write_all(&message.encode()).await.unwrap();
            socket.write_all(&message.encode()).await.unwrap();

            let send = read_frame(&mut socket, &mut buf).await.unwrap().unwrap();
            assert_eq!(send.command, "SEND");
            assert_eq!(send.get("destination"), Some("/queue/goss.gridappsd.process.request.field"));
            assert_eq!(send.body, b"ping".to_vec());
        });

        let transport = StompTransport::new(&address).unwrap();
        transport
            .connect(&Credentials::Basic {
                user: "system".to_string(),
                password: secrecy::SecretString::from("manager".to_string()),
            })
            .await
            .unwrap();
        assert!(transport.is_connected());

        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: MessageHandler = Arc::new(move |m: Message| sink.lock().push(m));
        transport
            .subscribe("/topic/goss.gridappsd.field.sw1", handler)
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;

        transport
            .publish("goss.gridappsd.process.request.field", &Headers::new(), "ping")
            .await
            .unwrap();
        broker.await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].body, "payload");
        assert_eq!(seen[0].headers.get("message-id").map(String::as_str), Some("m-1"));

        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_error_frame_fails_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let _ = read_frame(&mut socket, &mut buf).await;
            socket
                .write_all(&Frame::new("ERROR").header("message", "bad credentials").encode())
                .await
                .unwrap();
        });

        let transport = StompTransport::new(&address).unwrap();
        let err = transport.connect(&Credentials::Anonymous).await.unwrap_err();
        assert!(matches!(err, TransportError::Connection(m) if m == "bad credentials"));
        assert!(!transport.is_connected());
    }
}
