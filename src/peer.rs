use std::{
    collections::HashSet,
    fmt,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::Mutex,
    time::{Instant, timeout, timeout_at},
};
use tracing::{debug, info, trace, warn};

use crate::{
    config::Config,
    error::{ApplicationError, DownloadError},
    keepalive::KeepAlive,
    piece::PieceWork,
    protocol::{HANDSHAKE_LEN, Handshake, Message, read_message, write_message},
    storage::SeedSource,
    torrent::TorrentInfo,
};

/// Largest block we agree to upload in one `piece` message.
pub const MAX_REQUEST_LEN: u32 = 128 * 1024;

type Reader = BufReader<ReadHalf<TcpStream>>;
type Writer = Arc<Mutex<BufWriter<WriteHalf<TcpStream>>>>;

/// Represents a peer in the BitTorrent network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub ip:   IpAddr,
    pub port: u16,
}

impl Peer {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr())
    }
}

impl From<SocketAddr> for Peer {
    fn from(addr: SocketAddr) -> Self {
        Peer {
            ip:   addr.ip(),
            port: addr.port(),
        }
    }
}

/// Lifecycle of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    /// Handshaken, no blocks outstanding.
    Idle,
    /// Unchoked with block requests in flight.
    Requesting,
    Closed,
}

/// Manages the connection to a peer, including reading and writing
pub struct PeerConnection {
    peer:             Peer,
    state:            ConnectionState,
    reader:           Reader,
    writer:           Writer,
    closed:           Arc<AtomicBool>,
    available_pieces: HashSet<usize>,
    pieces:           usize,
    am_interested:    bool,
    am_choking:       bool,
    peer_choking:     bool,
    peer_interested:  bool,
    last_activity:    Instant,
    uploaded:         u64,
    config:           Config,
}

/// Write-only view of a connection used to emit keep-alives from outside
/// the task that owns it.
#[derive(Clone)]
pub struct PeerHandle {
    peer:          Peer,
    writer:        Writer,
    closed:        Arc<AtomicBool>,
    write_timeout: Duration,
}

impl PeerHandle {
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Best-effort keep-alive.
    ///
    /// Skipped while the owner is writing, since that traffic already keeps
    /// the link warm. A failed or stalled write marks the connection closed
    /// so that its owner sees `ConnectionLost` on the next operation.
    pub async fn send_keep_alive(&self) {
        if self.is_closed() {
            return;
        }
        let Ok(mut writer) = self.writer.try_lock() else {
            trace!(peer = %self.peer, "writer busy, skipping keep-alive");
            return;
        };
        match timeout(self.write_timeout, write_message(&mut *writer, &Message::KeepAlive)).await {
            Ok(Ok(())) => trace!(peer = %self.peer, "sent keep-alive"),
            Ok(Err(e)) => {
                warn!(peer = %self.peer, error = %e, "keep-alive failed, marking connection lost");
                self.closed.store(true, Ordering::Release);
            }
            Err(_) => {
                warn!(peer = %self.peer, "keep-alive stalled, marking connection lost");
                self.closed.store(true, Ordering::Release);
            }
        }
    }
}

fn lost(e: ApplicationError) -> DownloadError {
    match e {
        ApplicationError::Download(inner) => inner,
        other => {
            debug!(error = %other, "connection failure");
            DownloadError::ConnectionLost
        }
    }
}

impl PeerConnection {
    /// Opens a TCP connection, exchanges handshakes and reads the optional
    /// initial bitfield.
    pub async fn connect(
        peer:    &Peer,
        torrent: &TorrentInfo,
        config:  &Config,
    ) -> Result<Self, ApplicationError> {
        debug!(%peer, state = ?ConnectionState::Connecting, "opening connection");
        let stream = timeout(config.connect_timeout, TcpStream::connect(peer.addr()))
            .await
            .map_err(|_| ApplicationError::HandshakeError(format!("connect to {} timed out", peer)))?
            .map_err(|e| ApplicationError::HandshakeError(format!("connect to {}: {}", peer, e)))?;

        Self::handshake(peer.clone(), stream, torrent, config).await
    }

    async fn handshake(
        peer:    Peer,
        stream:  TcpStream,
        torrent: &TorrentInfo,
        config:  &Config,
    ) -> Result<Self, ApplicationError> {
        let info_hash = torrent.info_hash;
        debug!(%peer, state = ?ConnectionState::Handshaking, "sending handshake");
        let (rh, wh) = tokio::io::split(stream);
        let mut reader = BufReader::new(rh);
        let mut writer = BufWriter::new(wh);

        let exchange = async {
            writer.write_all(&Handshake::new(info_hash, torrent.peer_id).encode()).await?;
            writer.flush().await?;
            let mut buf = [0u8; HANDSHAKE_LEN];
            reader.read_exact(&mut buf).await?;
            Ok::<_, std::io::Error>(buf)
        };

        let buf = timeout(config.handshake_timeout, exchange)
            .await
            .map_err(|_| ApplicationError::HandshakeError(format!("handshake with {} timed out", peer)))?
            .map_err(|e| ApplicationError::HandshakeError(format!("handshake with {}: {}", peer, e)))?;

        let reply = Handshake::decode(&buf)?;
        if reply.info_hash != info_hash {
            return Err(ApplicationError::HandshakeError("invalid info_hash".into()));
        }

        let mut conn = PeerConnection {
            peer,
            state: ConnectionState::Idle,
            reader,
            writer: Arc::new(Mutex::new(writer)),
            closed: Arc::new(AtomicBool::new(false)),
            available_pieces: HashSet::new(),
            pieces: torrent.pieces_count(),
            am_interested: false,
            am_choking: true,
            peer_choking: true,
            peer_interested: false,
            last_activity: Instant::now(),
            uploaded: 0,
            config: *config,
        };

        let deadline = Instant::now() + config.bitfield_timeout;
        match conn.next_message(Some(deadline)).await? {
            Some(Message::Bitfield(_)) => {
                debug!(peer = %conn.peer, pieces = conn.available_pieces.len(), "received bitfield")
            }
            Some(other) => debug!(peer = %conn.peer, msg = other.name(), "first message was not a bitfield"),
            None => debug!(peer = %conn.peer, "no bitfield, assuming peer has nothing"),
        }

        Ok(conn)
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_closed() {
            ConnectionState::Closed
        } else {
            self.state
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed || self.closed.load(Ordering::Acquire)
    }

    pub fn handle(&self) -> PeerHandle {
        PeerHandle {
            peer:          self.peer.clone(),
            writer:        self.writer.clone(),
            closed:        self.closed.clone(),
            write_timeout: self.config.read_timeout,
        }
    }

    pub fn available_pieces(&self) -> &HashSet<usize> {
        &self.available_pieces
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.available_pieces.contains(&index)
    }

    pub fn is_choked(&self) -> bool {
        self.peer_choking
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Bytes served to this peer while seeding.
    pub fn uploaded(&self) -> u64 {
        self.uploaded
    }

    /// Marks the connection closed and shuts the write side down.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        debug!(peer = %self.peer, "closing connection");
        self.state = ConnectionState::Closed;
        self.closed.store(true, Ordering::Release);
        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = writer.shutdown().await;
        }
    }

    /// Writes one frame. Any failure, including a timeout, closes the connection.
    async fn send(&mut self, msg: &Message) -> Result<(), ApplicationError> {
        if self.is_closed() {
            return Err(DownloadError::ConnectionLost.into());
        }
        trace!(peer = %self.peer, msg = msg.name(), "send");
        let write = async {
            let mut writer = self.writer.lock().await;
            write_message(&mut *writer, msg).await
        };
        let err = match timeout(self.config.read_timeout, write).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => ApplicationError::from(e),
            Err(_) => DownloadError::ConnectionLost.into(),
        };
        debug!(peer = %self.peer, msg = msg.name(), error = %err, "write failed");
        self.close().await;
        Err(err)
    }

    /// Waits for the next frame and applies it to the connection state.
    ///
    /// Returns `Ok(None)` if `deadline` passes before a frame starts. The wait
    /// only peeks at the buffer, so an expired deadline never leaves half a
    /// frame consumed. Once a frame has started, the rest must arrive within
    /// `read_timeout`.
    async fn next_message(
        &mut self,
        deadline: Option<Instant>,
    ) -> Result<Option<Message>, ApplicationError> {
        if self.is_closed() {
            return Err(DownloadError::ConnectionLost.into());
        }

        let ready = async { self.reader.fill_buf().await.map(|buf| buf.len()) };
        let available = match deadline {
            Some(deadline) => match timeout_at(deadline, ready).await {
                Ok(res) => res?,
                Err(_) => return Ok(None),
            },
            None => ready.await?,
        };
        if available == 0 {
            return Err(DownloadError::ConnectionLost.into());
        }

        let msg = timeout(self.config.read_timeout, read_message(&mut self.reader))
            .await
            .map_err(|_| ApplicationError::Download(DownloadError::ConnectionLost))??;

        self.last_activity = Instant::now();
        trace!(peer = %self.peer, msg = msg.name(), "recv");
        self.apply(&msg);
        Ok(Some(msg))
    }

    fn apply(&mut self, msg: &Message) {
        match msg {
            Message::Choke => self.peer_choking = true,
            Message::Unchoke => self.peer_choking = false,
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Bitfield(bytes) => {
                // spare bits past the last piece are ignored
                for (i, byte) in bytes.iter().take(self.pieces.div_ceil(8)).enumerate() {
                    for bit in 0..8 {
                        let index = i * 8 + bit;
                        if index < self.pieces && byte & (0b1000_0000 >> bit) != 0 {
                            self.available_pieces.insert(index);
                        }
                    }
                }
            }
            Message::Have(index) if (*index as usize) < self.pieces => {
                self.available_pieces.insert(*index as usize);
            }
            Message::Have(index) => {
                debug!(peer = %self.peer, index, "ignoring have for unknown piece");
            }
            _ => {}
        }
    }

    /// Downloads one piece into `buf`, which must be exactly `work.length` bytes.
    ///
    /// `Choked` and `Timeout` leave the connection usable. `ConnectionLost`
    /// closes it for good.
    pub async fn download_piece(
        &mut self,
        work: &PieceWork,
        buf:  &mut [u8],
    ) -> Result<(), DownloadError> {
        if self.is_closed() {
            return Err(DownloadError::ConnectionLost);
        }

        let result = self.try_download(work, buf).await;
        match result {
            Err(DownloadError::ConnectionLost) => self.close().await,
            _ => self.state = ConnectionState::Idle,
        }
        result
    }

    async fn try_download(&mut self, work: &PieceWork, buf: &mut [u8]) -> Result<(), DownloadError> {
        if !self.am_interested {
            self.send(&Message::Interested).await.map_err(lost)?;
            self.am_interested = true;
        }

        let deadline = Instant::now() + self.config.unchoke_timeout;
        while self.peer_choking {
            if self.next_message(Some(deadline)).await.map_err(lost)?.is_none() {
                debug!(peer = %self.peer, index = work.index, "never unchoked");
                return Err(DownloadError::Timeout);
            }
        }

        self.state = ConnectionState::Requesting;
        let block_size = self.config.block_size as usize;
        let blocks = work.blocks(block_size);
        let mut received = vec![false; blocks.len()];
        let mut downloaded = 0;
        let mut requested = 0;
        let mut backlog = 0;
        // only a new block pushes the idle deadline out
        let mut deadline = Instant::now() + self.config.read_timeout;

        while downloaded < blocks.len() {
            while backlog < self.config.max_backlog && requested < blocks.len() {
                let block = blocks[requested];
                self.send(&Message::Request {
                    index:  work.index as u32,
                    begin:  block.offset as u32,
                    length: block.length as u32,
                })
                .await
                .map_err(lost)?;
                backlog += 1;
                requested += 1;
            }

            let msg = match self.next_message(Some(deadline)).await.map_err(lost)? {
                Some(msg) => msg,
                None => {
                    debug!(peer = %self.peer, index = work.index, "idle while blocks outstanding");
                    return Err(DownloadError::ConnectionLost);
                }
            };

            match msg {
                Message::Choke => {
                    debug!(peer = %self.peer, index = work.index, "choked mid-piece");
                    return Err(DownloadError::Choked);
                }
                Message::Piece { index, begin, block } if index as usize == work.index => {
                    let begin = begin as usize;
                    let slot = begin / block_size;
                    let expected = (begin % block_size == 0)
                        .then(|| blocks.get(slot))
                        .flatten()
                        .filter(|b| b.length == block.len());
                    let Some(expected) = expected else {
                        warn!(peer = %self.peer, index, begin, len = block.len(), "ignoring unexpected block");
                        continue;
                    };
                    if !received[slot] {
                        buf[expected.offset..expected.offset + expected.length].copy_from_slice(&block);
                        received[slot] = true;
                        downloaded += 1;
                        deadline = Instant::now() + self.config.read_timeout;
                    }
                    backlog = backlog.saturating_sub(1);
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Tells the peer we now have `index`.
    pub async fn send_have(&mut self, index: usize) -> Result<(), ApplicationError> {
        self.send(&Message::Have(index as u32)).await
    }

    /// Serves block requests from `source` until the connection is lost.
    pub async fn serve_requests(&mut self, source: &SeedSource) -> Result<(), ApplicationError> {
        let result = self.serve_loop(source).await;
        self.close().await;
        result
    }

    async fn serve_loop(&mut self, source: &SeedSource) -> Result<(), ApplicationError> {
        self.state = ConnectionState::Idle;
        if self.am_interested {
            self.send(&Message::NotInterested).await?;
            self.am_interested = false;
        }
        self.send(&Message::Unchoke).await?;
        self.am_choking = false;
        info!(peer = %self.peer, "seeding");

        loop {
            let Some(msg) = self.next_message(None).await? else {
                continue;
            };

            match msg {
                Message::Request { index, begin, length } => {
                    if length > MAX_REQUEST_LEN {
                        warn!(peer = %self.peer, index, begin, length, "request too large, ignoring");
                        continue;
                    }
                    match source.read_block(index, begin, length).await? {
                        Some(block) => {
                            self.send(&Message::Piece { index, begin, block }).await?;
                            self.uploaded += length as u64;
                            debug!(peer = %self.peer, index, begin, length, uploaded = self.uploaded, "served block");
                        }
                        None => debug!(peer = %self.peer, index, begin, length, "ignoring out-of-range request"),
                    }
                }
                Message::Interested if self.am_choking => {
                    self.send(&Message::Unchoke).await?;
                    self.am_choking = false;
                }
                other => trace!(peer = %self.peer, msg = other.name(), interested = self.peer_interested, "ignored while seeding"),
            }
        }
    }
}

/// Connects to every peer concurrently and keeps the ones that complete the
/// handshake, registering each with the keep-alive coordinator.
///
/// Fails only when no peer could be reached.
pub async fn connect_to_peers(
    torrent:    &Arc<TorrentInfo>,
    peers:      Vec<Peer>,
    keep_alive: &KeepAlive,
    config:     &Config,
) -> Result<Vec<PeerConnection>, ApplicationError> {
    let connections = Arc::new(Mutex::new(Vec::new()));

    let tasks = peers.into_iter().map(|peer| {
        let connections = connections.clone();
        let torrent = torrent.clone();
        let config = *config;
        tokio::spawn(async move {
            match PeerConnection::connect(&peer, &torrent, &config).await {
                Ok(conn) => {
                    info!(%peer, pieces = conn.available_pieces().len(), "completed handshake");
                    connections.lock().await.push(conn);
                }
                Err(e) => warn!(%peer, error = %e, "could not handshake, skipping"),
            }
        })
    });
    futures::future::join_all(tasks).await;

    let connections = std::mem::take(&mut *connections.lock().await);
    for conn in &connections {
        keep_alive.register(conn.handle()).await;
    }

    if connections.is_empty() {
        return Err(ApplicationError::InsufficientPeers {
            remaining: torrent.pieces_count(),
        });
    }
    info!(count = connections.len(), "connected to peers");
    Ok(connections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    const INFO_HASH: [u8; 20] = [0xab; 20];

    /// Four 4-byte pieces; only the hash and piece count matter here.
    fn torrent() -> TorrentInfo {
        TorrentInfo::new(
            String::new(),
            INFO_HASH,
            vec![[0; 20]; 4],
            4,
            16,
            "test".into(),
            [1u8; 20],
        )
        .unwrap()
    }

    fn config() -> Config {
        Config {
            block_size: 2,
            max_backlog: 2,
            bitfield_timeout: Duration::from_millis(200),
            unchoke_timeout: Duration::from_millis(300),
            read_timeout: Duration::from_secs(2),
            ..Config::default()
        }
    }

    /// Accepts one connection and completes the handshake with `reply_hash`.
    async fn fake_peer(reply_hash: [u8; 20]) -> (Peer, tokio::task::JoinHandle<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = Peer::from(listener.local_addr().unwrap());
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; HANDSHAKE_LEN];
            stream.read_exact(&mut buf).await.unwrap();
            stream
                .write_all(&Handshake::new(reply_hash, [9u8; 20]).encode())
                .await
                .unwrap();
            stream
        });
        (peer, task)
    }

    async fn expect(stream: &mut TcpStream) -> Message {
        read_message(stream).await.unwrap()
    }

    async fn connected(bitfield: Option<Vec<u8>>) -> (PeerConnection, TcpStream) {
        connected_with(bitfield, config()).await
    }

    async fn connected_with(bitfield: Option<Vec<u8>>, config: Config) -> (PeerConnection, TcpStream) {
        let (peer, task) = fake_peer(INFO_HASH).await;
        let remote = async {
            let mut stream = task.await.unwrap();
            if let Some(bits) = bitfield {
                write_message(&mut stream, &Message::Bitfield(bits)).await.unwrap();
            }
            stream
        };
        let torrent = torrent();
        let (conn, stream) = tokio::join!(
            PeerConnection::connect(&peer, &torrent, &config),
            remote
        );
        (conn.unwrap(), stream)
    }

    #[tokio::test]
    async fn connect_reads_bitfield() {
        let (conn, _remote) = connected(Some(vec![0b1010_0000])).await;
        assert!(conn.has_piece(0));
        assert!(!conn.has_piece(1));
        assert!(conn.has_piece(2));
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(conn.is_choked());
    }

    #[tokio::test]
    async fn connect_tolerates_missing_bitfield() {
        let (conn, _remote) = connected(None).await;
        assert!(conn.available_pieces().is_empty());
    }

    #[tokio::test]
    async fn connect_rejects_foreign_info_hash() {
        let (peer, task) = fake_peer([0xcd; 20]).await;
        let res = PeerConnection::connect(&peer, &torrent(), &config()).await;
        assert!(matches!(res, Err(ApplicationError::HandshakeError(_))));
        drop(task);
    }

    #[tokio::test]
    async fn download_pipelines_block_requests() {
        let (mut conn, mut remote) = connected(Some(vec![0x80])).await;
        let work = PieceWork { index: 0, hash: [0; 20], length: 5 };

        let peer = async {
            assert_eq!(expect(&mut remote).await, Message::Interested);
            write_message(&mut remote, &Message::Unchoke).await.unwrap();
            // backlog of 2 with 2-byte blocks
            assert_eq!(expect(&mut remote).await, Message::Request { index: 0, begin: 0, length: 2 });
            assert_eq!(expect(&mut remote).await, Message::Request { index: 0, begin: 2, length: 2 });
            for (begin, block) in [(2u32, b"cd".to_vec()), (0, b"ab".to_vec())] {
                write_message(&mut remote, &Message::Piece { index: 0, begin, block }).await.unwrap();
            }
            assert_eq!(expect(&mut remote).await, Message::Request { index: 0, begin: 4, length: 1 });
            write_message(&mut remote, &Message::Piece { index: 0, begin: 4, block: b"e".to_vec() })
                .await
                .unwrap();
            remote
        };

        let mut buf = vec![0u8; 5];
        let (res, _remote) = tokio::join!(conn.download_piece(&work, &mut buf), peer);
        res.unwrap();
        assert_eq!(buf, b"abcde");
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn choke_mid_piece_surfaces_choked() {
        let (mut conn, mut remote) = connected(Some(vec![0x80])).await;
        let work = PieceWork { index: 0, hash: [0; 20], length: 4 };

        let peer = async {
            expect(&mut remote).await;
            write_message(&mut remote, &Message::Unchoke).await.unwrap();
            expect(&mut remote).await;
            write_message(&mut remote, &Message::Choke).await.unwrap();
            remote
        };

        let mut buf = vec![0u8; 4];
        let (res, _remote) = tokio::join!(conn.download_piece(&work, &mut buf), peer);
        assert_eq!(res, Err(DownloadError::Choked));
        assert!(!conn.is_closed());
        assert!(conn.is_choked());
    }

    #[tokio::test]
    async fn never_unchoked_times_out() {
        let (mut conn, _remote) = connected(Some(vec![0x80])).await;
        let work = PieceWork { index: 0, hash: [0; 20], length: 4 };
        let mut buf = vec![0u8; 4];
        assert_eq!(conn.download_piece(&work, &mut buf).await, Err(DownloadError::Timeout));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn peer_hangup_is_connection_lost() {
        let (mut conn, remote) = connected(Some(vec![0x80])).await;
        drop(remote);
        let work = PieceWork { index: 0, hash: [0; 20], length: 4 };
        let mut buf = vec![0u8; 4];
        assert_eq!(
            conn.download_piece(&work, &mut buf).await,
            Err(DownloadError::ConnectionLost)
        );
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(
            conn.download_piece(&work, &mut buf).await,
            Err(DownloadError::ConnectionLost)
        );
    }

    #[tokio::test]
    async fn malformed_frame_closes_connection() {
        let (mut conn, mut remote) = connected(Some(vec![0x80])).await;
        let work = PieceWork { index: 0, hash: [0; 20], length: 4 };

        let peer = async {
            expect(&mut remote).await;
            write_message(&mut remote, &Message::Unchoke).await.unwrap();
            expect(&mut remote).await;
            // request-shaped payload under a 1000-byte length prefix
            let mut frame = 1000u32.to_be_bytes().to_vec();
            frame.push(6);
            frame.extend_from_slice(&[0u8; 999]);
            remote.write_all(&frame).await.unwrap();
            remote
        };

        let mut buf = vec![0u8; 4];
        let (res, _remote) = tokio::join!(conn.download_piece(&work, &mut buf), peer);
        assert_eq!(res, Err(DownloadError::ConnectionLost));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn piece_indices_past_the_torrent_are_ignored() {
        let (mut conn, mut remote) = connected(Some(vec![0xff; 4])).await;
        assert_eq!(conn.available_pieces().len(), 4);
        assert!(!conn.has_piece(4));

        write_message(&mut remote, &Message::Have(1_000_000)).await.unwrap();
        assert_eq!(conn.next_message(None).await.unwrap(), Some(Message::Have(1_000_000)));
        assert!(!conn.has_piece(1_000_000));
        assert_eq!(conn.available_pieces().len(), 4);
    }

    #[tokio::test]
    async fn keep_alives_do_not_extend_a_stalled_piece() {
        let config = Config {
            read_timeout: Duration::from_millis(400),
            ..config()
        };
        let (mut conn, mut remote) = connected_with(Some(vec![0x80]), config).await;
        let work = PieceWork { index: 0, hash: [0; 20], length: 4 };

        // unchokes, then never serves a block but keeps the link chatty
        let chatter = tokio::spawn(async move {
            expect(&mut remote).await;
            write_message(&mut remote, &Message::Unchoke).await.unwrap();
            for _ in 0..50 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if write_message(&mut remote, &Message::KeepAlive).await.is_err() {
                    break;
                }
            }
        });

        let mut buf = vec![0u8; 4];
        let res = tokio::time::timeout(Duration::from_secs(3), conn.download_piece(&work, &mut buf))
            .await
            .expect("download never gave up");
        assert_eq!(res, Err(DownloadError::ConnectionLost));
        assert!(conn.is_closed());
        chatter.abort();
    }

    #[tokio::test]
    async fn failed_write_closes_connection() {
        let (mut conn, _remote) = connected(None).await;
        conn.writer.lock().await.shutdown().await.unwrap();

        assert!(conn.send_have(0).await.is_err());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.send_have(1).await.is_err());
    }

    #[tokio::test]
    async fn send_gives_up_on_a_stuck_writer() {
        let config = Config {
            read_timeout: Duration::from_millis(200),
            ..config()
        };
        let (mut conn, _remote) = connected_with(None, config).await;
        let writer = conn.writer.clone();
        let _held = writer.lock().await;

        let res = tokio::time::timeout(Duration::from_secs(2), conn.send_have(0))
            .await
            .expect("send waited on the writer forever");
        assert!(res.is_err());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn stalled_keep_alive_marks_connection_lost() {
        let config = Config {
            read_timeout: Duration::from_millis(200),
            ..config()
        };
        // the remote never reads, so the socket buffers fill up
        let (conn, _remote) = connected_with(None, config).await;
        {
            let mut writer = conn.writer.lock().await;
            let flood = vec![0u8; 64 << 20];
            let _ = timeout(Duration::from_millis(300), writer.write_all(&flood)).await;
        }

        let handle = conn.handle();
        tokio::time::timeout(Duration::from_secs(2), handle.send_keep_alive())
            .await
            .expect("keep-alive blocked forever");
        assert!(handle.is_closed());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn keep_alive_handle_writes_empty_frame() {
        let (conn, mut remote) = connected(None).await;
        let handle = conn.handle();
        handle.send_keep_alive().await;
        assert_eq!(expect(&mut remote).await, Message::KeepAlive);
        assert!(!handle.is_closed());
    }
}
