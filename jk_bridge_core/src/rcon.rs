//! Quake 3 style remote console over UDP.
//!
//! Every command goes out as a single connectionless datagram and the reply
//! may come back split across several. The exchange itself is blocking and is
//! run on a small worker pool so the event loop never waits on a socket.

use std::{
    io::{self, ErrorKind},
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use threadpool::ThreadPool;
use tokio::sync::oneshot;

/// Prefix of every connectionless packet in both directions.
pub const OUT_OF_BAND: [u8; 4] = [0xFF; 4];
const PRINT_HEADER: &[u8] = b"print\n";

pub const RECV_TIMEOUT: Duration = Duration::from_secs(1);
pub const RESPONSE_WINDOW: Duration = Duration::from_secs(5);
pub const MAX_WORKERS: usize = 2;
const MAX_DATAGRAM: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum RconError {
    #[error("RCON settings not configured.")]
    NotConfigured,
    #[error("No response from server")]
    TimedOut,
    #[error("Transport({0})")]
    Transport(#[from] io::Error),
    #[error("RCON worker stopped before replying")]
    WorkerGone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconTarget {
    pub host: String,
    pub port: u16,
    pub password: String,
}

// **** Latin-1 ****

/// Drops every character the game can't represent in a single byte.
#[must_use]
pub fn clean_latin1(text: &str) -> String {
    text.chars().filter(|&c| u32::from(c) < 0x100).collect()
}

#[must_use]
pub fn encode_latin1(text: &str) -> Vec<u8> {
    text.chars()
        .filter_map(|c| u8::try_from(u32::from(c)).ok())
        .collect()
}

#[must_use]
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().copied().map(char::from).collect()
}

#[must_use]
pub fn build_packet(password: &str, command: &str) -> Vec<u8> {
    let mut packet = OUT_OF_BAND.to_vec();
    packet.extend(encode_latin1(&format!("rcon {password} {command}")));
    packet
}

// **** Response ****

/// Every datagram received inside the response window, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconResponse {
    fragments: Vec<Bytes>,
}

impl RconResponse {
    #[must_use]
    pub fn fragments(&self) -> &[Bytes] {
        &self.fragments
    }

    /// All fragments concatenated untouched.
    #[must_use]
    pub fn raw(&self) -> Bytes {
        let mut out = BytesMut::new();
        for fragment in &self.fragments {
            out.extend_from_slice(fragment);
        }
        out.freeze()
    }

    /// The printable body with each fragment's `\xff\xff\xff\xffprint\n`
    /// header removed.
    #[must_use]
    pub fn text(&self) -> String {
        self.fragments
            .iter()
            .map(|fragment| {
                let fragment: &[u8] = fragment;
                let body = fragment
                    .strip_prefix(&OUT_OF_BAND[..])
                    .unwrap_or(fragment);
                let body = body.strip_prefix(PRINT_HEADER).unwrap_or(body);
                decode_latin1(body)
            })
            .collect()
    }
}

// **** Transport ****

pub trait DatagramSocket {
    /// # Errors
    /// On any socket failure
    fn send(&self, buf: &[u8]) -> io::Result<usize>;
    /// Must time out with `WouldBlock` or `TimedOut` once the receive
    /// timeout the socket was opened with has elapsed.
    ///
    /// # Errors
    /// On timeout or any socket failure
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Opens a fresh socket for each exchange.
pub trait Connector: Send + Sync + 'static {
    type Socket: DatagramSocket;

    /// # Errors
    /// If the target can't be resolved or the socket can't be opened
    fn open(&self, target: &RconTarget, recv_timeout: Duration) -> io::Result<Self::Socket>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UdpConnector;

impl Connector for UdpConnector {
    type Socket = UdpSocket;

    fn open(&self, target: &RconTarget, recv_timeout: Duration) -> io::Result<UdpSocket> {
        let remote = (target.host.as_str(), target.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, "host did not resolve"))?;
        let local: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };

        let socket = UdpSocket::bind(local)?;
        socket.connect(remote)?;
        socket.set_read_timeout(Some(recv_timeout))?;
        Ok(socket)
    }
}

impl DatagramSocket for UdpSocket {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        Self::send(self, buf)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        Self::recv(self, buf)
    }
}

/// Sends one command and collects datagrams until a receive times out or the
/// window closes.
///
/// # Errors
/// * `Transport` - the socket couldn't be opened or failed mid-exchange
/// * `TimedOut` - nothing came back at all
pub fn exchange<C: Connector>(
    connector: &C,
    target: &RconTarget,
    command: &str,
    window: Duration,
    recv_timeout: Duration,
) -> Result<RconResponse, RconError> {
    let socket = connector.open(target, recv_timeout)?;
    socket.send(&build_packet(&target.password, command))?;

    let started = Instant::now();
    let mut fragments = Vec::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    while started.elapsed() < window {
        match socket.recv(&mut buf) {
            Ok(0) => {}
            Ok(n) => fragments.push(Bytes::copy_from_slice(&buf[..n])),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
            Err(e) => return Err(e.into()),
        }
    }

    if fragments.is_empty() {
        return Err(RconError::TimedOut);
    }
    Ok(RconResponse { fragments })
}

// **** Client ****

/// Runs exchanges on a bounded pool of worker threads and hands results back
/// to async callers.
pub struct RconClient<C: Connector = UdpConnector> {
    connector: Arc<C>,
    pool: Mutex<ThreadPool>,
    window: Duration,
    recv_timeout: Duration,
}

impl RconClient<UdpConnector> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_connector(UdpConnector)
    }
}

impl Default for RconClient<UdpConnector> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connector> RconClient<C> {
    pub fn with_connector(connector: C) -> Self {
        let workers = MAX_WORKERS.min(num_cpus::get()).max(1);
        Self {
            connector: Arc::new(connector),
            pool: Mutex::new(ThreadPool::with_name("rcon".into(), workers)),
            window: RESPONSE_WINDOW,
            recv_timeout: RECV_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_timing(mut self, window: Duration, recv_timeout: Duration) -> Self {
        self.window = window;
        self.recv_timeout = recv_timeout;
        self
    }

    /// # Errors
    /// See [`exchange`]. Also `WorkerGone` if the pool dropped the job.
    pub async fn send(
        &self,
        target: &RconTarget,
        command: &str,
    ) -> Result<RconResponse, RconError> {
        let rx = self.dispatch(target.clone(), command.to_owned())?;
        rx.await.map_err(|_| RconError::WorkerGone)?
    }

    fn dispatch(
        &self,
        target: RconTarget,
        command: String,
    ) -> Result<oneshot::Receiver<Result<RconResponse, RconError>>, RconError> {
        let (tx, rx) = oneshot::channel();
        let connector = self.connector.clone();
        let (window, recv_timeout) = (self.window, self.recv_timeout);

        let pool = self.pool.lock().map_err(|_| RconError::WorkerGone)?;
        pool.execute(move || {
            let result = exchange(connector.as_ref(), &target, &command, window, recv_timeout);
            if let Err(e) = &result {
                tracing::debug!("RCON `{command}` failed: {e}");
            }
            // Caller may have given up already.
            let _ = tx.send(result);
        });
        Ok(rx)
    }

    /// Blocks until every queued exchange has finished.
    pub fn join(&self) {
        if let Ok(pool) = self.pool.lock() {
            pool.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::VecDeque};

    use super::*;

    #[derive(Clone)]
    struct ScriptedConnector {
        replies: Vec<Vec<u8>>,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    struct ScriptedSocket {
        replies: RefCell<VecDeque<Vec<u8>>>,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl DatagramSocket for ScriptedSocket {
        fn send(&self, buf: &[u8]) -> io::Result<usize> {
            self.sent.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        }

        fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            match self.replies.borrow_mut().pop_front() {
                Some(reply) => {
                    buf[..reply.len()].copy_from_slice(&reply);
                    Ok(reply.len())
                }
                None => Err(io::Error::new(ErrorKind::WouldBlock, "timed out")),
            }
        }
    }

    impl Connector for ScriptedConnector {
        type Socket = ScriptedSocket;

        fn open(&self, _: &RconTarget, _: Duration) -> io::Result<ScriptedSocket> {
            Ok(ScriptedSocket {
                replies: RefCell::new(self.replies.iter().cloned().collect()),
                sent: self.sent.clone(),
            })
        }
    }

    struct RefusingConnector;

    impl Connector for RefusingConnector {
        type Socket = UdpSocket;

        fn open(&self, _: &RconTarget, _: Duration) -> io::Result<UdpSocket> {
            Err(io::Error::new(ErrorKind::ConnectionRefused, "refused"))
        }
    }

    fn target() -> RconTarget {
        RconTarget {
            host: "127.0.0.1".into(),
            port: 29070,
            password: "secret".into(),
        }
    }

    fn print_packet(body: &str) -> Vec<u8> {
        let mut packet = OUT_OF_BAND.to_vec();
        packet.extend_from_slice(PRINT_HEADER);
        packet.extend_from_slice(body.as_bytes());
        packet
    }

    #[test]
    fn packet_layout() {
        let packet = build_packet("secret", "status");
        assert_eq!(&packet[..4], &OUT_OF_BAND);
        assert_eq!(&packet[4..], b"rcon secret status");
    }

    #[test]
    fn unencodable_characters_are_dropped() {
        assert_eq!(clean_latin1("héllo ✓ world"), "héllo  world");
        assert_eq!(encode_latin1("é"), vec![0xE9]);
        assert_eq!(decode_latin1(&[0x68, 0xE9]), "hé");
    }

    #[test]
    fn collects_fragments_until_quiet() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let connector = ScriptedConnector {
            replies: vec![print_packet("map: mp/ffa3\n"), print_packet("num score\n")],
            sent: sent.clone(),
        };

        let response = exchange(&connector, &target(), "status", RESPONSE_WINDOW, RECV_TIMEOUT)
            .expect("response");

        assert_eq!(response.fragments().len(), 2);
        assert_eq!(response.text(), "map: mp/ffa3\nnum score\n");
        assert!(response.raw().starts_with(&OUT_OF_BAND));
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn silence_is_a_timeout() {
        let connector = ScriptedConnector {
            replies: Vec::new(),
            sent: Arc::default(),
        };
        let result = exchange(&connector, &target(), "status", RESPONSE_WINDOW, RECV_TIMEOUT);
        assert!(matches!(result, Err(RconError::TimedOut)));
    }

    #[tokio::test]
    async fn client_reports_transport_failures() {
        let client = RconClient::with_connector(RefusingConnector);
        let result = client.send(&target(), "status").await;
        assert!(matches!(result, Err(RconError::Transport(_))));
    }

    #[tokio::test]
    async fn client_returns_response_from_pool() {
        let client = RconClient::with_connector(ScriptedConnector {
            replies: vec![print_packet("ok\n")],
            sent: Arc::default(),
        });
        let response = client.send(&target(), "say hi").await.expect("response");
        assert_eq!(response.text(), "ok\n");
        client.join();
    }
}
