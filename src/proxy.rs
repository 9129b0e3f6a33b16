use anyhow::{anyhow, Context, Result};
use rustls::pki_types::ServerName;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

/// Hard ceiling imposed by the 2-byte frame length prefix.
pub const MAX_FRAME_LEN: usize = 65535;
pub const DEFAULT_BUFFER_SIZE: usize = 8192;
const MIN_BUFFER_SIZE: usize = 512;
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const STREAM_COPY_BUFFER: usize = 16 * 1024;

/// How bytes are relayed between the accepted client and the remote.
///
/// `Stream` copies bytes verbatim. `Framed` treats each client read as one
/// datagram and carries it as `[u16 BE length][payload]`, preserving
/// datagram boundaries over the TCP leg.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayMode {
    Stream,
    Framed { buffer_size: usize },
}

/// TLS material for both legs: `server` wraps accepted clients, `client`
/// wraps the dialed remote.
#[derive(Clone)]
pub struct TlsSettings {
    pub server: Arc<rustls::ServerConfig>,
    pub client: Arc<rustls::ClientConfig>,
}

#[derive(Clone)]
pub struct ProxyConfig {
    pub local_addr: SocketAddr,
    pub remote_addr: String,
    pub tls: Option<TlsSettings>,
    pub timeout: Duration,
    pub idle_timeout: Duration,
    pub mode: RelayMode,
}

/// A single listener relaying accepted connections to one remote.
///
/// The configuration is fixed at construction. `start` binds and spawns the
/// accept loop; `stop` tears everything down, including live connections.
pub struct Proxy {
    config: ProxyConfig,
    state: Mutex<Option<Running>>,
    local_addr: StdMutex<Option<SocketAddr>>,
    conns: Arc<ConnTable>,
}

struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl Proxy {
    pub fn new(mut config: ProxyConfig) -> Self {
        if config.timeout.is_zero() {
            config.timeout = DEFAULT_DIAL_TIMEOUT;
        }
        if config.idle_timeout.is_zero() {
            config.idle_timeout = DEFAULT_IDLE_TIMEOUT;
        }
        if let RelayMode::Framed { buffer_size } = &mut config.mode {
            *buffer_size = (*buffer_size).clamp(MIN_BUFFER_SIZE, MAX_FRAME_LEN);
        }
        Self {
            config,
            state: Mutex::new(None),
            local_addr: StdMutex::new(None),
            conns: Arc::new(ConnTable::new()),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// The bound listen address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    /// Point-in-time count of relayed connections; advisory only.
    pub fn active_connections(&self) -> usize {
        self.conns.len()
    }

    /// Binds the listener and spawns the accept loop. Fails only when the
    /// bind fails; already started is a no-op.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut state = self.state.lock().await;
        if let Some(running) = state.as_ref() {
            debug!(local = %running.local_addr, "proxy already started");
            return Ok(running.local_addr);
        }

        let listener = TcpListener::bind(self.config.local_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.local_addr))?;
        let local_addr = listener.local_addr().context("failed to read bound address")?;

        let acceptor = self
            .config
            .tls
            .as_ref()
            .map(|tls| TlsAcceptor::from(tls.server.clone()));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            self.config.clone(),
            Arc::clone(&self.conns),
            shutdown_rx,
        ));

        *state = Some(Running {
            local_addr,
            shutdown,
            accept_task,
        });
        *self.local_addr.lock().unwrap() = Some(local_addr);
        info!(local = %local_addr, remote = %self.config.remote_addr, "proxy started");
        Ok(local_addr)
    }

    /// Closes the listener, terminates every relayed connection and waits for
    /// all of them to wind down. No-op on a stopped proxy.
    pub async fn stop(&self) {
        let running = self.state.lock().await.take();
        let Some(running) = running else {
            return;
        };
        let _ = running.shutdown.send(true);
        if let Err(err) = running.accept_task.await {
            debug!(error = %err, "accept loop join failed");
        }
        *self.local_addr.lock().unwrap() = None;
        info!(local = %running.local_addr, "proxy stopped");
    }
}

struct ConnTable {
    next_id: AtomicU64,
    conns: StdMutex<HashMap<u64, SocketAddr>>,
}

impl ConnTable {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            conns: StdMutex::new(HashMap::new()),
        }
    }

    fn register(&self, peer: SocketAddr) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.conns.lock().unwrap().insert(id, peer);
        id
    }

    fn deregister(&self, id: u64) {
        self.conns.lock().unwrap().remove(&id);
    }

    fn len(&self) -> usize {
        self.conns.lock().unwrap().len()
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    config: ProxyConfig,
    conns: Arc<ConnTable>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut handlers = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let acceptor = acceptor.clone();
                    let config = config.clone();
                    let conns = Arc::clone(&conns);
                    let shutdown = shutdown.clone();
                    handlers.spawn(async move {
                        if let Err(err) =
                            handle_connection(stream, peer, acceptor, config, conns, shutdown).await
                        {
                            debug!(peer = %peer, error = %err, "proxy connection ended");
                        }
                    });
                }
                Err(err) => {
                    if *shutdown.borrow() {
                        break;
                    }
                    warn!(error = %err, "accept failed");
                }
            },
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
        }
    }
    // Listener drops here; wait for the remaining connection handlers.
    while handlers.join_next().await.is_some() {}
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    config: ProxyConfig,
    conns: Arc<ConnTable>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let id = conns.register(peer);
    debug!(peer = %peer, remote = %config.remote_addr, "relaying connection");
    let result = tokio::select! {
        _ = shutdown.changed() => Ok(()),
        res = relay_connection(stream, acceptor, &config) => res,
    };
    conns.deregister(id);
    result
}

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}
type IoStream = Box<dyn AsyncStream>;

async fn relay_connection(
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
    config: &ProxyConfig,
) -> Result<()> {
    let client: IoStream = match acceptor {
        Some(acceptor) => Box::new(
            acceptor
                .accept(stream)
                .await
                .context("tls accept failed")?,
        ),
        None => Box::new(stream),
    };
    // Dial failure drops the client here; no retry.
    let remote = dial_remote(config).await?;

    let (client_read, client_write) = tokio::io::split(client);
    let (remote_read, remote_write) = tokio::io::split(remote);
    let idle = config.idle_timeout;
    let (to_remote, to_client) = match config.mode {
        RelayMode::Stream => tokio::join!(
            copy_stream(client_read, remote_write, idle),
            copy_stream(remote_read, client_write, idle),
        ),
        RelayMode::Framed { buffer_size } => tokio::join!(
            encode_frames(client_read, remote_write, buffer_size, idle),
            decode_frames(remote_read, client_write, idle),
        ),
    };
    to_remote.and(to_client)
}

async fn dial_remote(config: &ProxyConfig) -> Result<IoStream> {
    let stream = timeout(config.timeout, TcpStream::connect(&config.remote_addr))
        .await
        .with_context(|| format!("dial {} timed out", config.remote_addr))?
        .with_context(|| format!("dial {} failed", config.remote_addr))?;
    match &config.tls {
        Some(tls) => {
            let name = server_name_for(&config.remote_addr)?;
            let connector = TlsConnector::from(tls.client.clone());
            let stream = timeout(config.timeout, connector.connect(name, stream))
                .await
                .context("tls handshake timed out")?
                .context("tls handshake failed")?;
            Ok(Box::new(stream))
        }
        None => Ok(Box::new(stream)),
    }
}

fn server_name_for(remote: &str) -> Result<ServerName<'static>> {
    let host = remote.rsplit_once(':').map(|(host, _)| host).unwrap_or(remote);
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string())
        .map_err(|_| anyhow!("invalid tls server name {host:?}"))
}

/// Copies bytes until EOF, then half-closes the destination so the remote
/// sees the end of stream while its own reply direction keeps flowing.
async fn copy_stream<R, W>(mut src: R, mut dst: W, idle: Duration) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = async {
        let mut buf = vec![0u8; STREAM_COPY_BUFFER];
        loop {
            let n = timeout(idle, src.read(&mut buf))
                .await
                .context("connection idle timeout")??;
            if n == 0 {
                return Ok(());
            }
            timeout(idle, dst.write_all(&buf[..n]))
                .await
                .context("write stalled")??;
        }
    }
    .await;
    let _ = dst.shutdown().await;
    result
}

/// Datagram side to framed side: one read is one datagram, prefixed with its
/// big-endian length. A read that fills the whole buffer may have truncated
/// the datagram, so the connection is torn down instead of forwarding it.
async fn encode_frames<R, W>(mut src: R, mut dst: W, buffer_size: usize, idle: Duration) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = async {
        let mut buf = vec![0u8; buffer_size];
        loop {
            let n = timeout(idle, src.read(&mut buf))
                .await
                .context("connection idle timeout")??;
            if n == 0 {
                return Ok(());
            }
            if n == buf.len() {
                return Err(anyhow!("datagram exceeds the {buffer_size} byte frame buffer"));
            }
            let header = (n as u16).to_be_bytes();
            timeout(idle, async {
                dst.write_all(&header).await?;
                dst.write_all(&buf[..n]).await
            })
            .await
            .context("write stalled")??;
        }
    }
    .await;
    let _ = dst.shutdown().await;
    result
}

/// Framed side to datagram side: reads exactly one length prefix and payload
/// per frame and forwards the bare payload. A truncated frame is an error;
/// EOF on a frame boundary ends the direction cleanly.
async fn decode_frames<R, W>(mut src: R, mut dst: W, idle: Duration) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = async {
        let mut header = [0u8; 2];
        loop {
            match timeout(idle, src.read_exact(&mut header))
                .await
                .context("connection idle timeout")?
            {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(err.into()),
            }
            let len = u16::from_be_bytes(header) as usize;
            if len == 0 {
                continue;
            }
            let mut payload = vec![0u8; len];
            timeout(idle, src.read_exact(&mut payload))
                .await
                .context("connection idle timeout")?
                .context("truncated frame")?;
            timeout(idle, dst.write_all(&payload))
                .await
                .context("write stalled")??;
        }
    }
    .await;
    let _ = dst.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn spawn_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut read, mut write) = stream.split();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                });
            }
        });
        addr
    }

    fn test_config(remote: SocketAddr, mode: RelayMode) -> ProxyConfig {
        ProxyConfig {
            local_addr: "127.0.0.1:0".parse().unwrap(),
            remote_addr: remote.to_string(),
            tls: None,
            timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(5),
            mode,
        }
    }

    #[tokio::test]
    async fn stream_proxy_echoes() {
        let echo = spawn_echo_server().await;
        let proxy = Proxy::new(test_config(echo, RelayMode::Stream));
        let local = proxy.start().await.unwrap();

        let mut client = TcpStream::connect(local).await.unwrap();
        client.write_all(b"ping through the proxy").await.unwrap();
        let mut buf = [0u8; 22];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping through the proxy");

        proxy.stop().await;
    }

    #[tokio::test]
    async fn stop_terminates_live_connections() {
        let echo = spawn_echo_server().await;
        let proxy = Proxy::new(test_config(echo, RelayMode::Stream));
        let local = proxy.start().await.unwrap();

        let mut client = TcpStream::connect(local).await.unwrap();
        client.write_all(b"hold").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(proxy.active_connections(), 1);

        proxy.stop().await;
        assert_eq!(proxy.active_connections(), 0);
        // The forced close surfaces as EOF or a reset on the client side.
        let mut rest = Vec::new();
        let _ = client.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
        assert!(TcpStream::connect(local).await.is_err() || {
            // The port may be rebound by another process; a fresh accept from
            // this proxy is impossible either way.
            proxy.local_addr().is_none()
        });
    }

    #[tokio::test]
    async fn start_fails_on_occupied_port() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = holder.local_addr().unwrap();
        let mut config = test_config(addr, RelayMode::Stream);
        config.local_addr = addr;
        let proxy = Proxy::new(config);
        assert!(proxy.start().await.is_err());
    }

    #[tokio::test]
    async fn frames_preserve_datagram_boundaries() {
        let (mut raw, raw_peer) = duplex(1024);
        let (framed_peer, mut framed) = duplex(1024);
        let (peer_read, _peer_write) = tokio::io::split(raw_peer);
        let (_fp_read, fp_write) = tokio::io::split(framed_peer);
        let task = tokio::spawn(encode_frames(
            peer_read,
            fp_write,
            1024,
            Duration::from_secs(5),
        ));

        for datagram in [b"hello".as_slice(), b"wireguard!".as_slice()] {
            raw.write_all(datagram).await.unwrap();
            let mut header = [0u8; 2];
            framed.read_exact(&mut header).await.unwrap();
            assert_eq!(u16::from_be_bytes(header) as usize, datagram.len());
            let mut payload = vec![0u8; datagram.len()];
            framed.read_exact(&mut payload).await.unwrap();
            assert_eq!(payload, datagram);
        }

        drop(raw);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn decode_reassembles_split_frames() {
        let (mut framed, framed_peer) = duplex(1024);
        let (raw_peer, mut raw) = duplex(1024);
        let (fp_read, _fp_write) = tokio::io::split(framed_peer);
        let (_rp_read, rp_write) = tokio::io::split(raw_peer);
        let task = tokio::spawn(decode_frames(fp_read, rp_write, Duration::from_secs(5)));

        framed.write_all(&[0, 5]).await.unwrap();
        framed.write_all(b"hel").await.unwrap();
        framed.write_all(b"lo").await.unwrap();
        framed.write_all(&[0, 0]).await.unwrap();
        framed.write_all(&[0, 3]).await.unwrap();
        framed.write_all(b"abc").await.unwrap();
        drop(framed);

        task.await.unwrap().unwrap();
        let mut out = Vec::new();
        raw.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"helloabc");
    }

    #[tokio::test]
    async fn oversized_datagram_tears_the_connection_down() {
        let (mut raw, raw_peer) = duplex(1024);
        let (framed_peer, _framed) = duplex(1024);
        let (peer_read, _peer_write) = tokio::io::split(raw_peer);
        let (_fp_read, fp_write) = tokio::io::split(framed_peer);
        let task = tokio::spawn(encode_frames(
            peer_read,
            fp_write,
            MIN_BUFFER_SIZE,
            Duration::from_secs(5),
        ));

        raw.write_all(&vec![0xAB; MIN_BUFFER_SIZE]).await.unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn config_defaults_are_applied() {
        let proxy = Proxy::new(ProxyConfig {
            local_addr: "127.0.0.1:0".parse().unwrap(),
            remote_addr: "127.0.0.1:51820".to_string(),
            tls: None,
            timeout: Duration::ZERO,
            idle_timeout: Duration::ZERO,
            mode: RelayMode::Framed { buffer_size: 1 << 20 },
        });
        assert_eq!(proxy.config().timeout, DEFAULT_DIAL_TIMEOUT);
        assert_eq!(proxy.config().idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert_eq!(
            proxy.config().mode,
            RelayMode::Framed { buffer_size: MAX_FRAME_LEN }
        );
    }
}
