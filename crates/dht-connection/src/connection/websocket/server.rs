use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_native_tls::{native_tls, TlsAcceptor};
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use super::connection::{socket_config, WebsocketConnection};
use crate::config::{PortRange, TlsCertificate, WebsocketConnectorConfig};
use crate::connection::RawConnectionHandle;
use crate::error::{ConnectionError, Result};

/// Accepts WebSocket upgrades on the first free port of a range and hands the
/// resulting connections to `incoming`.
pub(crate) struct WebsocketServer {
    port: u16,
    task: JoinHandle<()>,
}

impl WebsocketServer {
    pub(crate) async fn start(
        config: &WebsocketConnectorConfig,
        port_range: PortRange,
        incoming: mpsc::UnboundedSender<RawConnectionHandle>,
    ) -> Result<Self> {
        let tls = match &config.tls {
            Some(certificate) => Some(load_tls_acceptor(certificate).await?),
            None => None,
        };
        let (listener, port) = bind_in_range(&config.bind_address, port_range).await?;
        tracing::info!(
            target = "dht::websocket",
            bind_address = %config.bind_address,
            port,
            tls = tls.is_some(),
            "websocket server listening"
        );
        let task = tokio::spawn(accept_loop(
            listener,
            tls,
            socket_config(config.max_message_size),
            config.handshake_timeout,
            incoming,
        ));
        Ok(Self { port, task })
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for WebsocketServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn bind_in_range(bind_address: &str, range: PortRange) -> Result<(TcpListener, u16)> {
    for port in range.min..=range.max {
        match TcpListener::bind((bind_address, port)).await {
            Ok(listener) => {
                let port = listener.local_addr()?.port();
                return Ok((listener, port));
            }
            Err(err) => {
                tracing::trace!(target = "dht::websocket", port, error = %err, "port unavailable");
            }
        }
    }
    Err(ConnectionError::CouldNotStart(format!(
        "no free port in range {}-{}",
        range.min, range.max
    )))
}

async fn load_tls_acceptor(certificate: &TlsCertificate) -> Result<TlsAcceptor> {
    let cert = tokio::fs::read(&certificate.cert_path).await?;
    let key = tokio::fs::read(&certificate.key_path).await?;
    let identity = native_tls::Identity::from_pkcs8(&cert, &key)
        .map_err(|err| ConnectionError::Tls(err.to_string()))?;
    let acceptor =
        native_tls::TlsAcceptor::new(identity).map_err(|err| ConnectionError::Tls(err.to_string()))?;
    Ok(TlsAcceptor::from(acceptor))
}

async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    socket_config: WebSocketConfig,
    handshake_timeout: Duration,
    incoming: mpsc::UnboundedSender<RawConnectionHandle>,
) {
    loop {
        let (stream, address) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(target = "dht::websocket", error = %err, "accept failed");
                continue;
            }
        };
        let tls = tls.clone();
        let incoming = incoming.clone();
        tokio::spawn(async move {
            let upgraded = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => upgrade(stream, socket_config, handshake_timeout, address).await,
                    Err(err) => {
                        tracing::debug!(target = "dht::websocket", %address, error = %err, "tls handshake failed");
                        return;
                    }
                },
                None => upgrade(stream, socket_config, handshake_timeout, address).await,
            };
            if let Some(handle) = upgraded {
                let _ = incoming.send(handle);
            }
        });
    }
}

async fn upgrade<S>(
    stream: S,
    socket_config: WebSocketConfig,
    handshake_timeout: Duration,
    address: SocketAddr,
) -> Option<RawConnectionHandle>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match tokio::time::timeout(
        handshake_timeout,
        accept_async_with_config(stream, Some(socket_config)),
    )
    .await
    {
        Ok(Ok(socket)) => {
            tracing::debug!(target = "dht::websocket", %address, "websocket accepted");
            Some(WebsocketConnection::accepted(socket))
        }
        Ok(Err(err)) => {
            tracing::debug!(target = "dht::websocket", %address, error = %err, "websocket upgrade failed");
            None
        }
        Err(_) => {
            tracing::debug!(target = "dht::websocket", %address, "websocket upgrade timed out");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_next_port_when_first_is_taken() {
        let taken = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let Some(next) = port.checked_add(1) else {
            return;
        };
        let range = PortRange::new(port, next).unwrap();
        match bind_in_range("127.0.0.1", range).await {
            Ok((_listener, bound)) => assert_eq!(bound, next),
            // The neighbouring port may belong to another process.
            Err(err) => assert!(matches!(err, ConnectionError::CouldNotStart(_))),
        }
    }

    #[tokio::test]
    async fn exhausted_range_fails_to_start() {
        let taken = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let err = bind_in_range("127.0.0.1", PortRange::single(port))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::CouldNotStart(_)));
    }

    #[tokio::test]
    async fn missing_certificate_files_fail() {
        let certificate = TlsCertificate {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
        };
        assert!(matches!(
            load_tls_acceptor(&certificate).await,
            Err(ConnectionError::Io(_))
        ));
    }
}
