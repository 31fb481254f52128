use super::tcp::TcpChannel;
use crate::error::{CohortError, Result};
use crate::types::Rank;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

/// Point-to-point transport engine for one worker process.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    bind: IpAddr,
}

impl TcpTransport {
    pub fn new(bind: IpAddr) -> Self {
        Self { bind }
    }

    /// Bind an ephemeral listener and start accepting peers.
    ///
    /// The result is staged: it has an endpoint to advertise but no rank
    /// until [`StagedTransport::into_mesh`] is called.
    pub async fn listen(&self) -> Result<StagedTransport> {
        let listener = TcpListener::bind(SocketAddr::new(self.bind, 0)).await?;
        let local_addr = listener.local_addr()?;
        let inbound = Arc::new(Inbound::default());
        let task = tokio::spawn(accept_loop(listener, Arc::clone(&inbound)));
        tracing::debug!(%local_addr, "p2p listener bound");
        Ok(StagedTransport {
            local_addr,
            inbound,
            accept: AcceptLoop(task),
        })
    }
}

/// Inbound channels keyed by the rank each peer announced on connect.
#[derive(Default)]
struct Inbound {
    channels: Mutex<HashMap<Rank, Arc<TcpChannel>>>,
    arrived: Notify,
}

impl Inbound {
    fn get(&self, rank: Rank) -> Result<Option<Arc<TcpChannel>>> {
        let channels = self
            .channels
            .lock()
            .map_err(|_| CohortError::LockPoisoned("p2p inbound"))?;
        Ok(channels.get(&rank).cloned())
    }

    async fn wait_for(&self, rank: Rank) -> Result<Arc<TcpChannel>> {
        loop {
            let notified = self.arrived.notified();
            if let Some(ch) = self.get(rank)? {
                return Ok(ch);
            }
            notified.await;
        }
    }
}

struct AcceptLoop(tokio::task::JoinHandle<()>);

impl Drop for AcceptLoop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn accept_loop(listener: TcpListener, inbound: Arc<Inbound>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("p2p accept failed: {e}");
                return;
            }
        };
        let inbound = Arc::clone(&inbound);
        tokio::spawn(async move {
            let mut stream = stream;
            let mut rank = [0u8; 4];
            if let Err(e) = stream.read_exact(&mut rank).await {
                tracing::debug!(%peer, "p2p handshake failed: {e}");
                return;
            }
            let rank = Rank::from_le_bytes(rank);
            let channel = Arc::new(TcpChannel::from_stream(stream));
            if let Ok(mut channels) = inbound.channels.lock() {
                channels.insert(rank, channel);
            }
            inbound.arrived.notify_waiters();
            tracing::trace!(%peer, rank, "p2p peer connected");
        });
    }
}

/// A bound listener waiting for its session's rank table.
pub struct StagedTransport {
    local_addr: SocketAddr,
    inbound: Arc<Inbound>,
    accept: AcceptLoop,
}

impl StagedTransport {
    /// Address peers connect to.
    pub fn endpoint(&self) -> String {
        self.local_addr.to_string()
    }

    /// Attach the rank table. Outbound connections are opened lazily.
    pub fn into_mesh(
        self,
        rank: Rank,
        peers: &[(Rank, String)],
        timeout: Duration,
    ) -> Result<P2pMesh> {
        let mut table = HashMap::with_capacity(peers.len());
        for (peer, endpoint) in peers {
            let addr: SocketAddr = endpoint.parse().map_err(|e| {
                CohortError::transport_with_source(format!("bad endpoint for rank {peer}"), e)
            })?;
            table.insert(*peer, addr);
        }
        Ok(P2pMesh {
            rank,
            endpoints: table,
            inbound: self.inbound,
            outbound: tokio::sync::Mutex::new(HashMap::new()),
            timeout,
            round: AtomicU64::new(0),
            _accept: self.accept,
        })
    }
}

/// Point-to-point context of one rank.
///
/// Each ordered pair of ranks uses its own connection: `send` writes on the
/// connection this rank opened to `dest`, `recv` reads from the one `src`
/// opened to us.
pub struct P2pMesh {
    rank: Rank,
    endpoints: HashMap<Rank, SocketAddr>,
    inbound: Arc<Inbound>,
    outbound: tokio::sync::Mutex<HashMap<Rank, Arc<TcpChannel>>>,
    timeout: Duration,
    round: AtomicU64,
    _accept: AcceptLoop,
}

impl P2pMesh {
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Round for the next exchange, carried in the high 32 bits of its tags.
    /// Advances in lockstep on every rank as long as every rank runs the same
    /// sequence of exchanges.
    pub fn next_round(&self) -> u64 {
        self.round.fetch_add(1, Ordering::Relaxed)
    }

    /// Connect to `dest` unless already connected.
    pub async fn open_endpoint(&self, dest: Rank) -> Result<()> {
        self.outbound_channel(dest).await.map(|_| ())
    }

    pub async fn send(&self, dest: Rank, tag: u64, data: &[u8]) -> Result<()> {
        let channel = self.outbound_channel(dest).await?;
        channel.send_tagged(tag, data).await
    }

    pub async fn recv(&self, src: Rank, tag: u64) -> Result<Vec<u8>> {
        if src == self.rank {
            return Err(CohortError::transport("p2p recv from self"));
        }
        let wait = async {
            let channel = self.inbound.wait_for(src).await?;
            channel.recv_tagged(tag).await
        };
        tokio::time::timeout(self.timeout, wait)
            .await
            .map_err(|_| CohortError::timeout("p2p recv", self.timeout))?
    }

    async fn outbound_channel(&self, dest: Rank) -> Result<Arc<TcpChannel>> {
        if dest == self.rank {
            return Err(CohortError::transport("p2p send to self"));
        }
        let mut outbound = self.outbound.lock().await;
        if let Some(ch) = outbound.get(&dest) {
            return Ok(Arc::clone(ch));
        }
        let addr = self
            .endpoints
            .get(&dest)
            .copied()
            .ok_or_else(|| CohortError::transport(format!("no endpoint for rank {dest}")))?;

        let mut stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| CohortError::timeout("p2p connect", self.timeout))?
            .map_err(|e| CohortError::transport_with_source(format!("p2p connect {addr}"), e))?;
        stream
            .write_all(&self.rank.to_le_bytes())
            .await
            .map_err(|e| CohortError::transport_with_source("p2p handshake", e))?;

        let channel = Arc::new(TcpChannel::from_stream(stream));
        outbound.insert(dest, Arc::clone(&channel));
        Ok(channel)
    }
}

impl std::fmt::Debug for P2pMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2pMesh")
            .field("rank", &self.rank)
            .field("peers", &self.endpoints.len())
            .finish()
    }
}
