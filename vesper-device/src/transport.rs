//! Blocking websocket session with the inference server.
//!
//! ## Threading
//!
//! ```text
//! reader thread ── socket.read() (short timeout, lock held only per read)
//!      │               │
//!      │               └─ Text / Binary / Close ──► crossbeam bounded queue ──► control loop
//!      │
//! control loop ─── send_text / send_binary / send_ping (same lock, per-call write timeout)
//! ```
//!
//! Only plain `ws://` URLs are supported.

use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use tungstenite::{client::IntoClientRequest, Message, WebSocket};
use vesper_core::{InboundFrame, Messenger, Result, VesperError};

type Socket = WebSocket<TcpStream>;

#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    /// Socket read timeout; bounds how long a writer waits for the lock.
    pub read_timeout: Duration,
    /// Write timeout for text frames and pings.
    pub write_timeout: Duration,
    pub inbound_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_millis(20),
            write_timeout: Duration::from_millis(500),
            inbound_capacity: 256,
        }
    }
}

pub struct WsMessenger {
    url: String,
    config: TransportConfig,
    inbound_tx: Sender<InboundFrame>,
    socket: Option<Arc<Mutex<Socket>>>,
    connected: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl WsMessenger {
    /// Returns the messenger and the queue its reader feeds.
    pub fn new(url: impl Into<String>, config: TransportConfig) -> (Self, Receiver<InboundFrame>) {
        let (inbound_tx, inbound_rx) = crossbeam_channel::bounded(config.inbound_capacity.max(1));
        let messenger = Self {
            url: url.into(),
            config,
            inbound_tx,
            socket: None,
            connected: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
            reader: None,
        };
        (messenger, inbound_rx)
    }

    fn open_socket(&self) -> Result<Socket> {
        let request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| VesperError::Config(format!("invalid server url {}: {e}", self.url)))?;
        let uri = request.uri();
        if uri.scheme_str() != Some("ws") {
            return Err(VesperError::Config(format!(
                "unsupported scheme in {} (only ws:// is supported)",
                self.url
            )));
        }
        let host = uri
            .host()
            .ok_or_else(|| VesperError::Config(format!("no host in {}", self.url)))?;
        let port = uri.port_u16().unwrap_or(80);
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| VesperError::Transport(format!("{host}:{port} did not resolve")))?;

        let stream = TcpStream::connect_timeout(&addr, self.config.connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.config.connect_timeout))?;
        stream.set_write_timeout(Some(self.config.connect_timeout))?;

        let (socket, _response) = tungstenite::client(request, stream)
            .map_err(|e| VesperError::Transport(format!("handshake failed: {e}")))?;
        socket.get_ref().set_read_timeout(Some(self.config.read_timeout))?;
        socket.get_ref().set_write_timeout(Some(self.config.write_timeout))?;
        Ok(socket)
    }

    fn send_message(&mut self, message: Message, timeout: Duration) -> Result<()> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(VesperError::NotConnected);
        };
        if !self.connected.load(Ordering::Acquire) {
            return Err(VesperError::NotConnected);
        }
        let mut socket = socket.lock();
        socket.get_ref().set_write_timeout(Some(timeout))?;
        socket.send(message).map_err(|e| {
            if is_timeout(&e) {
                VesperError::Transport(format!("send timed out after {timeout:?}"))
            } else {
                VesperError::Transport(e.to_string())
            }
        })
    }

    fn shutdown_reader(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("websocket reader panicked");
            }
        }
    }
}

impl Messenger for WsMessenger {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.shutdown_reader();
        self.socket = None;

        let socket = Arc::new(Mutex::new(self.open_socket()?));
        info!(url = self.url.as_str(), "websocket connected");

        self.stop = Arc::new(AtomicBool::new(false));
        self.connected.store(true, Ordering::Release);
        let reader = Reader {
            socket: Arc::clone(&socket),
            tx: self.inbound_tx.clone(),
            connected: Arc::clone(&self.connected),
            stop: Arc::clone(&self.stop),
        };
        self.reader = Some(
            thread::Builder::new()
                .name("vesper-ws-reader".into())
                .spawn(move || reader.run())?,
        );
        self.socket = Some(socket);
        let _ = self.inbound_tx.try_send(InboundFrame::Connected);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(socket) = self.socket.as_ref() {
            let mut socket = socket.lock();
            if let Err(e) = socket.close(None).and_then(|()| socket.flush()) {
                debug!("websocket close: {e}");
            }
        }
        self.shutdown_reader();
        self.socket = None;
        self.connected.store(false, Ordering::Release);
        info!("websocket disconnected");
    }

    fn send_text(&mut self, text: &str) -> Result<()> {
        let timeout = self.config.write_timeout;
        self.send_message(Message::text(text.to_owned()), timeout)
    }

    fn send_binary(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        self.send_message(Message::binary(data.to_vec()), timeout)
    }

    fn send_ping(&mut self) -> Result<()> {
        let timeout = self.config.write_timeout;
        self.send_message(Message::Ping(Default::default()), timeout)
    }
}

impl Drop for WsMessenger {
    fn drop(&mut self) {
        if self.socket.is_some() {
            self.disconnect();
        }
    }
}

struct Reader {
    socket: Arc<Mutex<Socket>>,
    tx: Sender<InboundFrame>,
    connected: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

impl Reader {
    fn run(self) {
        while !self.stop.load(Ordering::Relaxed) {
            let read = self.socket.lock().read();
            match read {
                Ok(Message::Text(text)) => self.forward(InboundFrame::Text(text.to_string())),
                Ok(Message::Binary(data)) => self.forward(InboundFrame::Binary(data.to_vec())),
                Ok(Message::Close(frame)) => {
                    info!(?frame, "server closed the session");
                    break;
                }
                Ok(_) => {}
                Err(e) if is_timeout(&e) => {
                    // Give writers a turn at the lock.
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) => {
                    if !self.stop.load(Ordering::Relaxed) {
                        warn!("websocket read failed: {e}");
                        self.forward(InboundFrame::Error(e.to_string()));
                    }
                    break;
                }
            }
        }
        self.connected.store(false, Ordering::Release);
        let _ = self.tx.try_send(InboundFrame::Disconnected);
        debug!("websocket reader exited");
    }

    /// Blocks while the queue is full so reply audio is not lost; gives up
    /// once the session is being torn down.
    fn forward(&self, frame: InboundFrame) {
        let mut frame = frame;
        loop {
            match self.tx.send_timeout(frame, Duration::from_millis(100)) {
                Ok(()) => return,
                Err(crossbeam_channel::SendTimeoutError::Timeout(f)) => {
                    if self.stop.load(Ordering::Relaxed) {
                        return;
                    }
                    frame = f;
                }
                Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => return,
            }
        }
    }
}

fn is_timeout(e: &tungstenite::Error) -> bool {
    matches!(e, tungstenite::Error::Io(io)
        if matches!(io.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    /// One-connection echo-ish server: sends a text and a binary frame, then
    /// records what the client sends until it closes.
    fn spawn_server() -> (String, thread::JoinHandle<Vec<Message>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut ws = tungstenite::accept(stream).unwrap();
            ws.send(Message::text(r#"{"event":"response_finished"}"#.to_string()))
                .unwrap();
            ws.send(Message::binary(vec![1u8, 2, 3, 4])).unwrap();
            let mut seen = Vec::new();
            loop {
                match ws.read() {
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(m) => seen.push(m),
                }
            }
            seen
        });
        (url, handle)
    }

    fn next_payload(rx: &Receiver<InboundFrame>) -> InboundFrame {
        loop {
            match rx.recv_timeout(Duration::from_secs(3)).unwrap() {
                InboundFrame::Connected => continue,
                other => return other,
            }
        }
    }

    #[test]
    fn frames_flow_both_ways() {
        let (url, server) = spawn_server();
        let (mut messenger, rx) = WsMessenger::new(url, TransportConfig::default());
        messenger.connect().unwrap();
        assert!(messenger.is_connected());

        assert_eq!(
            next_payload(&rx),
            InboundFrame::Text(r#"{"event":"response_finished"}"#.into())
        );
        assert_eq!(next_payload(&rx), InboundFrame::Binary(vec![1, 2, 3, 4]));

        messenger.send_text(r#"{"event":"recording_started"}"#).unwrap();
        messenger
            .send_binary(&[9, 8, 7], Duration::from_millis(500))
            .unwrap();
        messenger.disconnect();
        assert!(!messenger.is_connected());

        let seen = server.join().unwrap();
        assert!(seen.contains(&Message::text(r#"{"event":"recording_started"}"#.to_string())));
        assert!(seen.contains(&Message::binary(vec![9u8, 8, 7])));
    }

    #[test]
    fn sends_fail_when_not_connected() {
        let (mut messenger, _rx) =
            WsMessenger::new("ws://127.0.0.1:9/ws", TransportConfig::default());
        assert!(matches!(
            messenger.send_text("{}"),
            Err(VesperError::NotConnected)
        ));
        assert!(matches!(
            messenger.send_binary(&[0; 4], Duration::from_millis(10)),
            Err(VesperError::NotConnected)
        ));
    }

    #[test]
    fn secure_urls_are_rejected() {
        let (mut messenger, _rx) =
            WsMessenger::new("wss://example.invalid/ws", TransportConfig::default());
        assert!(matches!(messenger.connect(), Err(VesperError::Config(_))));
    }
}
