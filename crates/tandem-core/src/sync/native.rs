//! Blocking `tungstenite` socket driven from a background thread.

use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tungstenite::{Message, connect};
use url::Url;

use super::{ConnectionState, SyncEvent, Transport, TransportError};

/// Commands sent to the WebSocket thread.
enum WsCommand {
    Send(String),
    Close,
}

/// WebSocket client for native platforms.
///
/// Uses a background thread for non-blocking operation.
pub struct NativeWebSocket {
    state: ConnectionState,
    events: Vec<SyncEvent>,
    /// Channel to send commands to the WebSocket thread.
    cmd_tx: Option<Sender<WsCommand>>,
    /// Channel to receive events from the WebSocket thread.
    event_rx: Option<Receiver<SyncEvent>>,
    _thread: Option<JoinHandle<()>>,
}

impl NativeWebSocket {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            events: Vec::new(),
            cmd_tx: None,
            event_rx: None,
            _thread: None,
        }
    }

    fn release(&mut self) {
        self.cmd_tx = None;
        self.event_rx = None;
        self._thread = None;
    }
}

fn run_socket(url: String, cmd_rx: Receiver<WsCommand>, event_tx: Sender<SyncEvent>) {
    log::info!("WebSocket thread: connecting to {}", url);

    let (mut socket, response) = match connect(url.as_str()) {
        Ok(pair) => pair,
        Err(e) => {
            log::error!("WebSocket connection failed: {}", e);
            let _ = event_tx.send(SyncEvent::Error {
                message: format!("Connection failed: {}", e),
            });
            return;
        }
    };
    log::info!("WebSocket connected, status: {}", response.status());
    let _ = event_tx.send(SyncEvent::Connected);

    // Short read timeout keeps the loop responsive to outgoing commands.
    match socket.get_mut() {
        tungstenite::stream::MaybeTlsStream::Plain(tcp) => {
            let _ = tcp.set_read_timeout(Some(Duration::from_millis(50)));
            let _ = tcp.set_write_timeout(Some(Duration::from_secs(5)));
        }
        #[allow(unreachable_patterns)]
        _ => log::debug!("Non-plain stream, using default timeout handling"),
    }

    loop {
        match cmd_rx.try_recv() {
            Ok(WsCommand::Send(msg)) => {
                log::debug!("WebSocket sending {} bytes", msg.len());
                if let Err(e) = socket.send(Message::Text(msg)) {
                    log::error!("WebSocket send error: {}", e);
                    break;
                }
            }
            Ok(WsCommand::Close) => {
                log::info!("WebSocket close requested");
                let _ = socket.close(None);
                // Owner is gone; nobody reads further events.
                return;
            }
            Err(TryRecvError::Disconnected) => {
                log::info!("WebSocket command channel disconnected");
                let _ = socket.close(None);
                return;
            }
            Err(TryRecvError::Empty) => {}
        }

        match socket.read() {
            Ok(Message::Text(txt)) => {
                if let Some(event) = SyncEvent::from_text(&txt) {
                    let _ = event_tx.send(event);
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = socket.send(Message::Pong(data));
            }
            Ok(Message::Close(_)) => {
                log::info!("WebSocket received close frame");
                break;
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                log::error!("WebSocket read error: {}", e);
                break;
            }
        }
    }

    log::info!("WebSocket thread exiting");
    let _ = event_tx.send(SyncEvent::Disconnected);
}

impl Transport for NativeWebSocket {
    fn connect(&mut self, url: &str) -> Result<(), TransportError> {
        if self.cmd_tx.is_some() {
            return Err(TransportError::AlreadyConnected);
        }

        let parsed = Url::parse(url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme: {}",
                parsed.scheme()
            )));
        }

        self.state = ConnectionState::Connecting;
        let (cmd_tx, cmd_rx) = channel::<WsCommand>();
        let (event_tx, event_rx) = channel::<SyncEvent>();
        let url = url.to_string();
        let handle = thread::spawn(move || run_socket(url, cmd_rx, event_tx));

        self.cmd_tx = Some(cmd_tx);
        self.event_rx = Some(event_rx);
        self._thread = Some(handle);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(tx) = self.cmd_tx.take() {
            let _ = tx.send(WsCommand::Close);
        }
        self.release();
        self.state = ConnectionState::Disconnected;
    }

    fn send(&self, msg: &str) -> Result<(), TransportError> {
        match (&self.cmd_tx, self.state) {
            (Some(tx), ConnectionState::Connected) => tx
                .send(WsCommand::Send(msg.to_string()))
                .map_err(|e| TransportError::SendFailed(e.to_string())),
            _ => Err(TransportError::NotConnected),
        }
    }

    fn poll_events(&mut self) -> Vec<SyncEvent> {
        let mut finished = false;
        if let Some(rx) = &self.event_rx {
            while let Ok(event) = rx.try_recv() {
                match &event {
                    SyncEvent::Connected => self.state = ConnectionState::Connected,
                    SyncEvent::Disconnected => {
                        self.state = ConnectionState::Disconnected;
                        finished = true;
                    }
                    SyncEvent::Error { .. } if self.state != ConnectionState::Connected => {
                        self.state = ConnectionState::Error;
                        finished = true;
                    }
                    _ => {}
                }
                self.events.push(event);
            }
        }
        // The thread has exited; allow a fresh `connect`.
        if finished {
            self.release();
        }
        std::mem::take(&mut self.events)
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}

impl Default for NativeWebSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NativeWebSocket {
    fn drop(&mut self) {
        self.disconnect();
    }
}
