use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::{connect_async_with_config, WebSocketStream};

use crate::config::WebsocketConnectorConfig;
use crate::connection::{ConnectionType, RawConnection, RawConnectionHandle, RawEventSink};
use crate::error::{ConnectionError, Result};
use crate::identifiers::ConnectionId;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

enum Command {
    Frame(Bytes),
    Close { code: CloseCode, reason: String },
}

pub(crate) fn socket_config(max_message_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message_size);
    config.max_frame_size = Some(max_message_size);
    config
}

/// A WebSocket client or an accepted server socket.
///
/// A `Going Away` close frame marks a graceful close, any other code an
/// ordinary one.
pub struct WebsocketConnection {
    id: ConnectionId,
    connection_type: ConnectionType,
    sink: Arc<RawEventSink>,
    commands: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebsocketConnection {
    /// Dials `url` in the background. Reports `Connected` once the upgrade
    /// succeeds and `Disconnected` when it fails or times out.
    pub fn connect(url: String, config: &WebsocketConnectorConfig) -> RawConnectionHandle {
        let (sink, events) = RawEventSink::channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let socket_config = socket_config(config.max_message_size);
        let connect_timeout = config.connect_timeout;
        let task_sink = sink.clone();
        let task = tokio::spawn(async move {
            let connecting = connect_async_with_config(url.as_str(), Some(socket_config), false);
            match tokio::time::timeout(connect_timeout, connecting).await {
                Ok(Ok((stream, _response))) => {
                    tracing::debug!(target = "dht::websocket", url = %url, "websocket connected");
                    task_sink.connected();
                    run_socket(stream, commands_rx, task_sink).await;
                }
                Ok(Err(err)) => {
                    tracing::debug!(target = "dht::websocket", url = %url, error = %err, "websocket connect failed");
                    task_sink.disconnected(false, Some(err.to_string()));
                }
                Err(_) => {
                    tracing::debug!(target = "dht::websocket", url = %url, "websocket connect timed out");
                    task_sink.disconnected(false, Some("connect timed out".into()));
                }
            }
        });
        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            connection_type: ConnectionType::WebsocketClient,
            sink,
            commands,
            task: Mutex::new(Some(task)),
        });
        RawConnectionHandle::new(connection, events)
    }

    /// Wraps a socket the server already upgraded.
    pub fn accepted<S>(stream: WebSocketStream<S>) -> RawConnectionHandle
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, events) = RawEventSink::channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        sink.connected();
        let task = tokio::spawn(run_socket(stream, commands_rx, sink.clone()));
        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            connection_type: ConnectionType::WebsocketServer,
            sink,
            commands,
            task: Mutex::new(Some(task)),
        });
        RawConnectionHandle::new(connection, events)
    }
}

async fn run_socket<S>(
    stream: WebSocketStream<S>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    sink: Arc<RawEventSink>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut writer, mut reader) = stream.split();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Frame(data)) => {
                    if let Err(err) = writer.send(Frame::Binary(data.to_vec())).await {
                        tracing::debug!(target = "dht::websocket", error = %err, "websocket write failed");
                        sink.disconnected(false, Some(err.to_string()));
                        break;
                    }
                }
                Some(Command::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    let _ = writer.send(Frame::Close(Some(frame))).await;
                    let _ = writer.close().await;
                    break;
                }
                None => {
                    let _ = writer.close().await;
                    break;
                }
            },
            frame = reader.next() => match frame {
                Some(Ok(Frame::Binary(data))) => sink.data(Bytes::from(data)),
                Some(Ok(Frame::Close(frame))) => {
                    let graceful = frame.as_ref().is_some_and(|frame| frame.code == CloseCode::Away);
                    let reason = frame
                        .map(|frame| frame.reason.into_owned())
                        .filter(|reason| !reason.is_empty());
                    sink.disconnected(graceful, reason);
                    break;
                }
                Some(Ok(Frame::Text(_))) => {
                    tracing::trace!(target = "dht::websocket", "ignoring text frame");
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(target = "dht::websocket", error = %err, "websocket read failed");
                    sink.disconnected(false, Some(err.to_string()));
                    break;
                }
                None => {
                    sink.disconnected(false, Some("websocket stream ended".into()));
                    break;
                }
            },
        }
    }
}

#[async_trait]
impl RawConnection for WebsocketConnection {
    fn connection_id(&self) -> ConnectionId {
        self.id.clone()
    }

    fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    fn send(&self, data: Bytes) -> Result<()> {
        if self.sink.is_disconnected() {
            return Err(ConnectionError::SendFailed("websocket is closed".into()));
        }
        self.commands
            .send(Command::Frame(data))
            .map_err(|_| ConnectionError::SendFailed("websocket task ended".into()))
    }

    async fn close(&self, graceful: bool, reason: Option<String>) {
        if self.sink.is_disconnected() {
            return;
        }
        let code = if graceful {
            CloseCode::Away
        } else {
            CloseCode::Normal
        };
        let _ = self.commands.send(Command::Close {
            code,
            reason: reason.clone().unwrap_or_default(),
        });
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                tracing::debug!(target = "dht::websocket", connection_id = %self.id, "websocket close timed out");
                task.abort();
            }
        }
        self.sink.disconnected(graceful, reason);
    }
}
