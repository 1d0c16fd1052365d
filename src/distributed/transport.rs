use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::distributed::protocol::Message;

#[derive(Debug)]
pub enum TransportError {
    Io(std::io::Error),
    Codec(serde_json::Error),

    UnknownRank(usize),

    /// A peer closed its connection.
    Disconnected(usize),

    /// Could not reach a peer in time.
    ConnectTimeout(String),

    /// A peer opened a connection without saying which rank it is.
    BadGreeting(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "i/o error: {}", e),
            TransportError::Codec(e) => write!(f, "bad message: {}", e),
            TransportError::UnknownRank(rank) => write!(f, "no rank {}", rank),
            TransportError::Disconnected(rank) => write!(f, "rank {} disconnected", rank),
            TransportError::ConnectTimeout(host) => write!(f, "could not connect to {}", host),
            TransportError::BadGreeting(line) => write!(f, "unexpected greeting '{}'", line),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Codec(e)
    }
}

/// Reliable point-to-point messaging within a fixed group of ranks.
/// Messages between any ordered pair of ranks are delivered in order.
pub trait Transport: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn send(&self, to: usize, message: &Message) -> Result<(), TransportError>;

    /// Returns the sender and the message, or None if nothing is waiting.
    fn try_recv(&self) -> Result<Option<(usize, Message)>, TransportError>;

    /// Sends to every other rank.
    fn broadcast(&self, message: &Message) -> Result<(), TransportError> {
        for peer in 0..self.size() {
            if peer != self.rank() {
                self.send(peer, message)?;
            }
        }
        Ok(())
    }
}

type Inbox = Receiver<Result<(usize, Message), TransportError>>;
type Outbox = Sender<Result<(usize, Message), TransportError>>;

/// Ranks within one process, connected by channels.
pub struct LocalTransport {
    rank: usize,
    peers: Vec<Outbox>,
    inbox: Mutex<Inbox>,
}

impl LocalTransport {
    /// Creates `size` connected ranks, in rank order.
    pub fn group(size: usize) -> Vec<LocalTransport> {
        let (senders, receivers): (Vec<Outbox>, Vec<Inbox>) =
            (0..size).map(|_| channel()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalTransport {
                rank,
                peers: senders.clone(),
                inbox: Mutex::new(inbox),
            })
            .collect()
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, to: usize, message: &Message) -> Result<(), TransportError> {
        let peer = self.peers.get(to).ok_or(TransportError::UnknownRank(to))?;
        peer.send(Ok((self.rank, message.clone())))
            .map_err(|_| TransportError::Disconnected(to))
    }

    fn try_recv(&self) -> Result<Option<(usize, Message)>, TransportError> {
        match self.inbox.lock().try_recv() {
            Ok(received) => received.map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Disconnected(self.rank)),
        }
    }
}

/// Ranks in separate processes, connected pairwise over TCP.
/// Each message is one line of JSON. A reader thread per peer feeds a shared inbox.
pub struct TcpTransport {
    rank: usize,
    writers: Vec<Option<Mutex<TcpStream>>>,
    inbox: Mutex<Inbox>,

    // Keeps the inbox open when there are no peers.
    _outbox: Outbox,
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_RETRY: Duration = Duration::from_millis(100);

impl TcpTransport {
    /// Listens on `hosts[rank]` and connects to every other host.
    pub fn connect(rank: usize, hosts: &[String]) -> Result<TcpTransport, TransportError> {
        let address = hosts.get(rank).ok_or(TransportError::UnknownRank(rank))?;
        let listener = TcpListener::bind(address)?;
        TcpTransport::establish(rank, listener, hosts)
    }

    /// Builds the full mesh with an already bound listener.
    /// Lower ranks accept connections from higher ranks, which connect to them.
    pub fn establish(
        rank: usize,
        listener: TcpListener,
        hosts: &[String],
    ) -> Result<TcpTransport, TransportError> {
        let size = hosts.len();
        if rank >= size {
            return Err(TransportError::UnknownRank(rank));
        }
        let mut streams: Vec<Option<TcpStream>> = (0..size).map(|_| None).collect();

        for (peer, host) in hosts.iter().enumerate().take(rank) {
            let mut stream = connect_with_retry(host)?;
            writeln!(stream, "{}", rank)?;
            stream.flush()?;
            debug!(rank, peer, host = %host, "connected");
            streams[peer] = Some(stream);
        }

        for _ in (rank + 1)..size {
            let (mut stream, remote) = listener.accept()?;
            let greeting = read_greeting(&mut stream)?;
            let peer: usize = greeting
                .trim()
                .parse()
                .map_err(|_| TransportError::BadGreeting(greeting.trim().to_string()))?;
            if peer <= rank || peer >= size || streams[peer].is_some() {
                return Err(TransportError::BadGreeting(greeting.trim().to_string()));
            }
            debug!(rank, peer, remote = %remote, "accepted");
            streams[peer] = Some(stream);
        }

        let (outbox, inbox) = channel();
        let mut writers = Vec::with_capacity(size);
        for (peer, stream) in streams.into_iter().enumerate() {
            let Some(stream) = stream else {
                writers.push(None);
                continue;
            };
            stream.set_nodelay(true)?;
            let reader = BufReader::new(stream.try_clone()?);
            let outbox = outbox.clone();
            std::thread::Builder::new()
                .name(format!("rank{}-from{}", rank, peer))
                .spawn(move || read_messages(peer, reader, outbox))?;
            writers.push(Some(Mutex::new(stream)));
        }

        Ok(TcpTransport {
            rank,
            writers,
            inbox: Mutex::new(inbox),
            _outbox: outbox,
        })
    }
}

// Reads the first line byte by byte, so nothing after it gets buffered away from the reader
// thread.
fn read_greeting(stream: &mut TcpStream) -> Result<String, TransportError> {
    let mut bytes = vec![];
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte)?;
        if byte[0] == b'\n' {
            break;
        }
        bytes.push(byte[0]);
        if bytes.len() > 32 {
            return Err(TransportError::BadGreeting(
                String::from_utf8_lossy(&bytes).to_string(),
            ));
        }
    }
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        // The reader threads hold clones of the streams, so signal the end explicitly.
        for writer in self.writers.iter().flatten() {
            let _ = writer.lock().shutdown(Shutdown::Write);
        }
    }
}

fn connect_with_retry(host: &str) -> Result<TcpStream, TransportError> {
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    loop {
        let addresses = host.to_socket_addrs()?;
        for address in addresses {
            if let Ok(stream) = TcpStream::connect(address) {
                return Ok(stream);
            }
        }
        if Instant::now() >= deadline {
            return Err(TransportError::ConnectTimeout(host.to_string()));
        }
        std::thread::sleep(CONNECT_RETRY);
    }
}

// Runs until the peer closes the connection, which is reported as a disconnect.
fn read_messages(peer: usize, reader: BufReader<TcpStream>, outbox: Outbox) {
    for line in reader.lines() {
        let decoded = match line {
            Ok(line) => serde_json::from_str::<Message>(line.trim())
                .map(|message| (peer, message))
                .map_err(TransportError::from),
            Err(e) => Err(TransportError::from(e)),
        };
        let failed = decoded.is_err();
        if outbox.send(decoded).is_err() || failed {
            return;
        }
    }
    trace!(peer, "connection closed");
    let _ = outbox.send(Err(TransportError::Disconnected(peer)));
}

impl Transport for TcpTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.writers.len()
    }

    fn send(&self, to: usize, message: &Message) -> Result<(), TransportError> {
        let writer = self
            .writers
            .get(to)
            .and_then(|w| w.as_ref())
            .ok_or(TransportError::UnknownRank(to))?;
        let json = serde_json::to_string(message)?;
        let mut stream = writer.lock();
        let written = stream.write_all(format!("{}\n", json).as_bytes());
        if let Err(e) = written.and_then(|_| stream.flush()) {
            warn!(to, error = %e, "send failed");
            return Err(TransportError::Disconnected(to));
        }
        Ok(())
    }

    fn try_recv(&self) -> Result<Option<(usize, Message)>, TransportError> {
        match self.inbox.lock().try_recv() {
            Ok(received) => received.map(Some),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv_blocking(transport: &dyn Transport) -> (usize, Message) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(received) = transport.try_recv().unwrap() {
                return received;
            }
            assert!(Instant::now() < deadline, "timed out waiting for a message");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_local_group_preserves_order() {
        let group = LocalTransport::group(3);
        for i in 0..5 {
            group[2].send(0, &Message::IndexDone(i)).unwrap();
        }
        group[1].broadcast(&Message::Terminate).unwrap();
        for i in 0..5 {
            assert_eq!(group[0].try_recv().unwrap(), Some((2, Message::IndexDone(i))));
        }
        assert_eq!(group[0].try_recv().unwrap(), Some((1, Message::Terminate)));
        assert_eq!(group[2].try_recv().unwrap(), Some((1, Message::Terminate)));
        assert_eq!(group[1].try_recv().unwrap(), None);
        assert!(matches!(
            group[0].send(7, &Message::Terminate),
            Err(TransportError::UnknownRank(7))
        ));
    }

    #[test]
    fn test_tcp_mesh() {
        let listeners: Vec<TcpListener> = (0..3)
            .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        let hosts: Vec<String> = listeners
            .iter()
            .map(|l| l.local_addr().unwrap().to_string())
            .collect();
        let transports: Vec<TcpTransport> = std::thread::scope(|s| {
            let handles: Vec<_> = listeners
                .into_iter()
                .enumerate()
                .map(|(rank, listener)| {
                    let hosts = &hosts;
                    s.spawn(move || TcpTransport::establish(rank, listener, hosts).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        transports[2]
            .send(0, &Message::ReservableResponse { first: 4, end: 8 })
            .unwrap();
        transports[2].send(0, &Message::IndexDone(3)).unwrap();
        assert_eq!(
            recv_blocking(&transports[0]),
            (2, Message::ReservableResponse { first: 4, end: 8 })
        );
        assert_eq!(recv_blocking(&transports[0]), (2, Message::IndexDone(3)));

        transports[0].broadcast(&Message::Terminate).unwrap();
        assert_eq!(recv_blocking(&transports[1]), (0, Message::Terminate));
        assert_eq!(recv_blocking(&transports[2]), (0, Message::Terminate));
    }
}
