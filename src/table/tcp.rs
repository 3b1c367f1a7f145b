//! A full-mesh TCP transport. Each member listens on one address and dials
//! every peer lazily the first time it publishes to it. Outbound connections
//! only carry frames out; everything a member receives arrives on connections
//! its peers dialed.

use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use hashbrown::{hash_map::Entry, HashMap};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    sync::{mpsc, Mutex, OwnedMutexGuard, RwLock},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{
    inbox::Inbox,
    wire::{Frame, MAX_FRAME_LEN},
    Link, ReplicaTable, TableProvider,
};
use crate::{
    error::{ConfigurationError, Error, WireError},
    group::{MemberId, MemberList},
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_DIAL_BACKOFF: Duration = Duration::from_millis(500);

type Writers = Arc<Mutex<HashMap<MemberId, OwnedWriteHalf>>>;

/// One member's TCP attachment to the group.
pub struct TcpEndpoint {
    id: MemberId,
    local_addr: SocketAddr,
    peers: RwLock<HashMap<MemberId, SocketAddr>>,
    writers: Writers,
    inbox: Arc<Mutex<Inbox>>,
    rounds: AtomicU64,
    connect_timeout: Duration,
    acceptor: JoinHandle<()>,
}

impl TcpEndpoint {
    /// Binds the listener for member `id` and starts accepting peers.
    pub async fn bind(id: MemberId, addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let acceptor = tokio::spawn(
            Self::start_acceptor(listener, inbox_tx)
                .instrument(debug_span!("acceptor", member = id)),
        );
        debug!("member {} listening on {}", id, local_addr);
        Ok(Self {
            id,
            local_addr,
            peers: RwLock::new(HashMap::new()),
            writers: Arc::new(Mutex::new(HashMap::new())),
            inbox: Arc::new(Mutex::new(Inbox::new(inbox_rx))),
            rounds: AtomicU64::new(0),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            acceptor,
        })
    }

    /// How long publishing keeps redialing a peer that is not listening yet.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn add_peer(&self, id: MemberId, addr: SocketAddr) {
        self.peers.write().await.insert(id, addr);
    }

    /// Accepts incoming connections and spawns a reader for each. Runs until
    /// the endpoint is dropped.
    async fn start_acceptor(
        listener: TcpListener,
        inbox_tx: mpsc::UnboundedSender<Frame>,
    ) {
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept a connection: {}", e);
                    continue;
                }
            };
            debug!("accepted connection from {}", remote);
            let inbox_tx = inbox_tx.clone();
            tokio::spawn(
                async move {
                    match Self::read_frames(stream, &inbox_tx).await {
                        Ok(()) => debug!("peer closed the connection"),
                        Err(e) => warn!(
                            "Dropping connection after a bad frame: {}",
                            e
                        ),
                    }
                }
                .instrument(debug_span!("reader", remote = %remote)),
            );
        }
    }

    /// Reads length prefixed frames into the inbox until the peer hangs up.
    async fn read_frames(
        mut stream: TcpStream,
        inbox_tx: &mpsc::UnboundedSender<Frame>,
    ) -> Result<(), Error> {
        loop {
            let len = match stream.read_u32_le().await {
                Ok(len) => len as usize,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(())
                }
                Err(e) => Err(e)?,
            };
            if len > MAX_FRAME_LEN {
                Err(WireError::FrameTooLarge(len))?
            }
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await?;
            let frame = Frame::decode(&buf)?;
            trace!("frame from member {} for round {}", frame.from, frame.round);
            if inbox_tx.send(frame).is_err() {
                // endpoint dropped
                return Ok(());
            }
        }
    }
}

impl Drop for TcpEndpoint {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

#[async_trait]
impl TableProvider for TcpEndpoint {
    type Table = ReplicaTable<TcpLink>;

    async fn construct(
        &self,
        members: &MemberList,
        local_index: usize,
        column_count: usize,
    ) -> Result<Self::Table, Error> {
        members.check_local(local_index, self.id)?;
        if column_count == 0 {
            Err(ConfigurationError::NoColumns)?
        }
        let mut peers = Vec::with_capacity(members.len() - 1);
        {
            let known = self.peers.read().await;
            for (index, id) in members.iter().enumerate() {
                if index == local_index {
                    continue;
                }
                let addr = known
                    .get(&id)
                    .ok_or(ConfigurationError::UnknownMember(id))?;
                peers.push((id, *addr));
            }
        }

        let mut inbox = self.inbox.clone().lock_owned().await;
        let round = self.rounds.fetch_add(1, Ordering::SeqCst) + 1;
        inbox.start_round(round);

        let link = TcpLink {
            peers,
            round,
            writers: self.writers.clone(),
            connect_timeout: self.connect_timeout,
            inbox,
        };
        Ok(ReplicaTable::new(
            members.clone(),
            local_index,
            column_count,
            link,
        )?)
    }
}

pub struct TcpLink {
    peers: Vec<(MemberId, SocketAddr)>,
    round: u64,
    writers: Writers,
    connect_timeout: Duration,
    inbox: OwnedMutexGuard<Inbox>,
}

impl TcpLink {
    async fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let deadline = Instant::now() + self.connect_timeout;
        let mut backoff = Duration::from_millis(10);
        loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) if Instant::now() + backoff < deadline => {
                    trace!("dialing {} failed ({}), retrying", addr, e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_DIAL_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_to(
        &self,
        writers: &mut HashMap<MemberId, OwnedWriteHalf>,
        id: MemberId,
        addr: SocketAddr,
        buf: &[u8],
    ) -> io::Result<()> {
        let writer = match writers.entry(id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let stream = self.dial(addr).await?;
                debug!("connected to member {} at {}", id, addr);
                let (_, write_half) = stream.into_split();
                entry.insert(write_half)
            }
        };
        if let Err(e) = writer.write_all(buf).await {
            // redial on the next publish
            writers.remove(&id);
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl Link for TcpLink {
    fn round(&self) -> u64 {
        self.round
    }

    async fn broadcast(&mut self, frame: Frame) -> Result<(), Error> {
        let buf = frame.encode_prefixed();
        let mut writers = self.writers.lock().await;
        let mut first_error = None;
        // an unreachable peer must not keep the frame from the others
        for (id, addr) in &self.peers {
            if let Err(e) = self.send_to(&mut writers, *id, *addr, &buf).await {
                warn!("Could not send to member {} at {}: {}", id, addr, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e)?,
            None => Ok(()),
        }
    }

    async fn recv(&mut self) -> Option<Frame> {
        self.inbox.next_for(self.round).await
    }

    fn try_recv(&mut self) -> Option<Frame> {
        self.inbox.try_next_for(self.round)
    }
}
