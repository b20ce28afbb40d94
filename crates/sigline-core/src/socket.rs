use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::errors::SignalError;
use crate::services::AuthHeaders;
use crate::transport::Command;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// The peer closed without sending a status code.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// The connection dropped without a closing handshake.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Callbacks from a socket to the transport that owns it.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Connected,
    Disconnected { code: u16, reason: String },
    Binary(Vec<u8>),
    Text(String),
}

/// Sender half handed to each socket. Tags every event with the socket's
/// generation so the transport can ignore sockets it already discarded.
#[derive(Debug, Clone)]
pub struct SocketEvents {
    socket: u64,
    tx: mpsc::WeakUnboundedSender<Command>,
}

impl SocketEvents {
    pub(crate) fn new(socket: u64, tx: mpsc::WeakUnboundedSender<Command>) -> Self {
        Self { socket, tx }
    }

    pub fn emit(&self, event: SocketEvent) {
        let delivered = self
            .tx
            .upgrade()
            .is_some_and(|tx| tx.send(Command::Socket { socket: self.socket, event }).is_ok());
        if !delivered {
            tracing::debug!(socket = self.socket, "transport gone, socket event dropped");
        }
    }
}

/// A resumable websocket as seen by the transport. Calls never block;
/// outcomes come back through [`SocketEvents`].
pub trait Socket: Send {
    /// Start the opening handshake, or resume a socket that closed.
    fn connect(&mut self);
    /// Begin the closing handshake.
    fn disconnect(&mut self);
    fn write(&mut self, frame: Vec<u8>);
}

pub trait SocketFactory: Send + Sync {
    fn create(&self, endpoint: &Url, headers: &AuthHeaders, events: SocketEvents) -> Box<dyn Socket>;
}

/// Production sockets over `tokio-tungstenite`.
pub struct WsSocketFactory;

impl SocketFactory for WsSocketFactory {
    fn create(&self, endpoint: &Url, headers: &AuthHeaders, events: SocketEvents) -> Box<dyn Socket> {
        Box::new(WsSocket {
            endpoint: endpoint.clone(),
            headers: headers.clone(),
            events,
            writer: None,
            task: None,
        })
    }
}

struct WsSocket {
    endpoint: Url,
    headers: AuthHeaders,
    events: SocketEvents,
    writer: Option<mpsc::UnboundedSender<Message>>,
    task: Option<JoinHandle<()>>,
}

impl Socket for WsSocket {
    fn connect(&mut self) {
        // A handshake that is still pending has stalled; start over.
        if let Some(task) = self.task.take() {
            if !task.is_finished() {
                tracing::debug!(url = %self.endpoint, "restarting stalled websocket handshake");
                task.abort();
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.writer = Some(tx);
        self.task = Some(tokio::spawn(run_socket(
            self.endpoint.clone(),
            self.headers.clone(),
            self.events.clone(),
            rx,
        )));
    }

    fn disconnect(&mut self) {
        if let Some(writer) = self.writer.take() {
            let close = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }));
            let _ = writer.send(close);
        }
    }

    fn write(&mut self, frame: Vec<u8>) {
        match &self.writer {
            Some(writer) if writer.send(Message::binary(frame)).is_ok() => {}
            _ => tracing::warn!("write on a closed websocket dropped"),
        }
    }
}

fn build_request(endpoint: &Url, headers: &AuthHeaders) -> Result<Request, SignalError> {
    let mut request = endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| SignalError::Connection(e.to_string()))?;
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| SignalError::Connection(format!("header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| SignalError::Connection(format!("header value: {e}")))?;
        request.headers_mut().insert(name, value);
    }
    Ok(request)
}

async fn run_socket(
    endpoint: Url,
    headers: AuthHeaders,
    events: SocketEvents,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
) {
    let request = match build_request(&endpoint, &headers) {
        Ok(request) => request,
        Err(e) => {
            tracing::error!("cannot build websocket request: {e}");
            events.emit(SocketEvent::Disconnected {
                code: CLOSE_ABNORMAL,
                reason: e.to_string(),
            });
            return;
        }
    };

    let stream = match connect_async(request).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            tracing::warn!(url = %endpoint, "websocket handshake failed: {e}");
            events.emit(SocketEvent::Disconnected {
                code: CLOSE_ABNORMAL,
                reason: e.to_string(),
            });
            return;
        }
    };
    tracing::debug!(url = %endpoint, "websocket handshake complete");
    events.emit(SocketEvent::Connected);

    let (mut sink, mut source) = stream.split();
    let (code, reason) = loop {
        tokio::select! {
            message = outgoing.recv() => match message {
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        break (CLOSE_ABNORMAL, e.to_string());
                    }
                }
                // The owning socket was dropped.
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
            },
            incoming = source.next() => match incoming {
                Some(Ok(Message::Binary(data))) => events.emit(SocketEvent::Binary(data.to_vec())),
                Some(Ok(Message::Text(text))) => events.emit(SocketEvent::Text(text.to_string())),
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                        None => (CLOSE_NO_STATUS, String::new()),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break (CLOSE_ABNORMAL, e.to_string()),
                None => break (CLOSE_ABNORMAL, "stream ended".to_string()),
            },
        }
    };
    events.emit(SocketEvent::Disconnected { code, reason });
}
