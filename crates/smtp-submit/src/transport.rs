use crate::tls::TlsOptions;
use crate::types::ClientTimeouts;
use async_trait::async_trait;
use std::fmt::Debug;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_util::sync::CancellationToken;

pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Debug + Unpin + Send {}
impl AsyncReadAndWrite for TcpStream {}
impl AsyncReadAndWrite for tokio_rustls::client::TlsStream<TcpStream> {}

pub type BoxedAsyncReadAndWrite = Box<dyn AsyncReadAndWrite>;

/// Callbacks through which a connection feeds the protocol engine.
/// Delivery may happen from any task; the engine serializes internally.
pub trait ConnectionEvents: Send + Sync {
    fn on_bytes(&self, bytes: &[u8]);
    /// `graceful` is true when the peer closed the stream cleanly.
    fn on_broken(&self, graceful: bool);
}

/// A live bidirectional byte stream to the server.
pub trait Connection: Send + Sync + Debug {
    /// Begin delivering events. Called exactly once, after the consumer
    /// has stored the connection, so no bytes are observed early.
    fn start(&self, events: Arc<dyn ConnectionEvents>);
    /// Queue bytes for transmission. Never blocks; write order is
    /// preserved on the wire.
    fn send(&self, bytes: &[u8]);
    /// Tear the connection down. Idempotent.
    fn close(&self);
    /// The address this end of the socket is bound to.
    fn local_addr(&self) -> SocketAddr;
}

/// Factory for server connections. The engine is written against this
/// port so that tests can substitute a scripted transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Option<Arc<dyn Connection>>;
}

/// Plain TCP transport, optionally tunneled through TLS at connect time.
pub struct TcpTransport {
    timeouts: ClientTimeouts,
    tls: Option<TlsOptions>,
}

impl TcpTransport {
    pub fn new(timeouts: ClientTimeouts) -> Self {
        Self { timeouts, tls: None }
    }

    /// Tunnel the session through TLS. The handshake must complete
    /// within `tls_handshake_timeout` or the connect attempt fails.
    pub fn enable_tls(mut self, tls: TlsOptions) -> Self {
        self.tls.replace(tls);
        self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, host: &str, port: u16) -> Option<Arc<dyn Connection>> {
        let addr = format!("{host}:{port}");
        let stream = match timeout(self.timeouts.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                tracing::warn!("connect {addr}: {err:#}");
                return None;
            }
            Err(_) => {
                tracing::warn!(
                    "connect {addr}: timed out after {:?}",
                    self.timeouts.connect_timeout
                );
                return None;
            }
        };
        // No need for Nagle with SMTP request/response
        if let Err(err) = stream.set_nodelay(true) {
            tracing::warn!("set_nodelay {addr}: {err:#}");
        }
        let local_addr = match stream.local_addr() {
            Ok(local_addr) => local_addr,
            Err(err) => {
                tracing::warn!("local_addr {addr}: {err:#}");
                return None;
            }
        };

        let stream: BoxedAsyncReadAndWrite = match &self.tls {
            Some(tls) => {
                let connector = tls.build_tls_connector();
                let server_name = match IpAddr::from_str(host) {
                    Ok(ip) => ServerName::IpAddress(ip.into()),
                    Err(_) => {
                        let name = tls.alt_name.clone().unwrap_or_else(|| host.to_string());
                        match ServerName::try_from(name) {
                            Ok(server_name) => server_name,
                            Err(_) => {
                                tracing::warn!("{host} is not a valid DNS name");
                                return None;
                            }
                        }
                    }
                };
                match timeout(
                    self.timeouts.tls_handshake_timeout,
                    connector.connect(server_name, stream),
                )
                .await
                {
                    Ok(Ok(stream)) => Box::new(stream),
                    Ok(Err(err)) => {
                        tracing::warn!("TLS handshake with {addr}: {err:#}");
                        return None;
                    }
                    Err(_) => {
                        tracing::warn!(
                            "TLS handshake with {addr}: timed out after {:?}",
                            self.timeouts.tls_handshake_timeout
                        );
                        return None;
                    }
                }
            }
            None => Box::new(stream),
        };

        Some(Arc::new(SocketConnection::new(stream, local_addr)))
    }
}

/// Connection over a tokio byte stream. A reader task and a writer task
/// are spawned on `start`; both are stopped through a shared
/// cancellation token when the connection is closed or breaks.
#[derive(Debug)]
pub struct SocketConnection {
    local_addr: SocketAddr,
    tx: UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
    io: parking_lot::Mutex<Option<(BoxedAsyncReadAndWrite, UnboundedReceiver<Vec<u8>>)>>,
}

impl SocketConnection {
    pub fn new(stream: BoxedAsyncReadAndWrite, local_addr: SocketAddr) -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            local_addr,
            tx,
            cancel: CancellationToken::new(),
            io: parking_lot::Mutex::new(Some((stream, rx))),
        }
    }
}

impl Connection for SocketConnection {
    fn start(&self, events: Arc<dyn ConnectionEvents>) {
        let Some((stream, rx)) = self.io.lock().take() else {
            return;
        };
        let (rd, wr) = tokio::io::split(stream);
        tokio::spawn(read_loop(rd, events.clone(), self.cancel.clone()));
        tokio::spawn(write_loop(wr, rx, events, self.cancel.clone()));
    }

    fn send(&self, bytes: &[u8]) {
        let _ = self.tx.send(bytes.to_vec());
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn read_loop<R>(mut rd: R, events: Arc<dyn ConnectionEvents>, cancel: CancellationToken)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut data = [0u8; 4096];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            read = rd.read(&mut data) => match read {
                Ok(0) => {
                    cancel.cancel();
                    events.on_broken(true);
                    return;
                }
                Ok(size) => events.on_bytes(&data[0..size]),
                Err(err) => {
                    tracing::trace!("read: {err:#}");
                    cancel.cancel();
                    events.on_broken(false);
                    return;
                }
            }
        }
    }
}

async fn write_loop<W>(
    mut wr: W,
    mut rx: UnboundedReceiver<Vec<u8>>,
    events: Arc<dyn ConnectionEvents>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = wr.shutdown().await;
                return;
            }
            queued = rx.recv() => match queued {
                Some(bytes) => {
                    if let Err(err) = wr.write_all(&bytes).await {
                        tracing::trace!("write: {err:#}");
                        cancel.cancel();
                        events.on_broken(false);
                        return;
                    }
                    let _ = wr.flush().await;
                }
                None => {
                    let _ = wr.shutdown().await;
                    return;
                }
            }
        }
    }
}
