use super::reduce::reduce_slice;
use super::{CollectiveContext, CollectiveEngine, split_group};
use crate::error::{CohortError, Result};
use crate::types::{CliqueId, DataType, Rank, ReduceOp};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

type CliqueTable = Mutex<HashMap<CliqueId, Arc<Clique>>>;

struct Envelope {
    src: Rank,
    seq: u64,
    payload: Vec<u8>,
}

/// Rendezvous point for every rank of one clique id.
struct Clique {
    id: CliqueId,
    world_size: u32,
    /// Per-rank mailbox senders, indexed by destination rank.
    senders: Vec<mpsc::UnboundedSender<Envelope>>,
    state: Mutex<CliqueState>,
    /// Number of ranks currently holding a claimed mailbox.
    joined: watch::Sender<u32>,
}

struct CliqueState {
    receivers: Vec<Option<mpsc::UnboundedReceiver<Envelope>>>,
    members: u32,
}

impl Clique {
    fn new(id: CliqueId, world_size: u32) -> Self {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..world_size)
            .map(|_| {
                let (tx, rx) = mpsc::unbounded_channel();
                (tx, Some(rx))
            })
            .unzip();
        let (joined, _) = watch::channel(0);
        Self {
            id,
            world_size,
            senders,
            state: Mutex::new(CliqueState {
                receivers,
                members: 0,
            }),
            joined,
        }
    }

    fn claim(&self, rank: Rank) -> Result<mpsc::UnboundedReceiver<Envelope>> {
        let mut st = self
            .state
            .lock()
            .map_err(|_| CohortError::LockPoisoned("clique state"))?;
        let slot = st.receivers.get_mut(rank as usize).ok_or_else(|| {
            collective_failed(
                "create_context",
                rank,
                format!("rank outside clique of size {}", self.world_size),
            )
        })?;
        let rx = slot
            .take()
            .ok_or_else(|| collective_failed("create_context", rank, "rank already joined"))?;
        st.members += 1;
        drop(st);
        self.joined.send_modify(|n| *n += 1);
        Ok(rx)
    }

    /// Return a mailbox claimed by a rendezvous that never completed.
    /// Returns `true` when no member remains.
    fn release(&self, rank: Rank, rx: mpsc::UnboundedReceiver<Envelope>) -> bool {
        let Ok(mut st) = self.state.lock() else {
            return false;
        };
        st.receivers[rank as usize] = Some(rx);
        st.members = st.members.saturating_sub(1);
        self.joined.send_modify(|n| *n = n.saturating_sub(1));
        st.members == 0
    }

    /// Permanent departure of a formed member. Returns `true` when no member remains.
    fn depart(&self) -> bool {
        let Ok(mut st) = self.state.lock() else {
            return false;
        };
        st.members = st.members.saturating_sub(1);
        st.members == 0
    }
}

/// In-process collective engine.
///
/// Cliques rendezvous through a shared table keyed by `CliqueId`; every rank
/// gets an unbounded mailbox and collectives are flat exchanges folded in
/// rank order, so results are identical on every rank. Clones share the table.
#[derive(Clone)]
pub struct LocalCollectiveEngine {
    table: Arc<CliqueTable>,
    timeout: Duration,
}

impl LocalCollectiveEngine {
    /// `timeout` bounds both the clique rendezvous and each receive.
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Number of cliques with at least one live member.
    pub fn active_cliques(&self) -> usize {
        self.table.lock().map(|t| t.len()).unwrap_or(0)
    }

    fn clique(&self, id: CliqueId, world_size: u32) -> Result<Arc<Clique>> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| CohortError::LockPoisoned("clique table"))?;
        let clique = Arc::clone(
            table
                .entry(id)
                .or_insert_with(|| Arc::new(Clique::new(id, world_size))),
        );
        if clique.world_size != world_size {
            return Err(CohortError::CollectiveFailed {
                operation: "create_context",
                rank: 0,
                reason: format!(
                    "clique {id:?} has size {}, caller expected {world_size}",
                    clique.world_size
                ),
            });
        }
        Ok(clique)
    }

    fn forget(&self, id: CliqueId) {
        if let Ok(mut table) = self.table.lock() {
            table.remove(&id);
        }
    }

    async fn join(&self, clique_id: CliqueId, rank: Rank, world_size: u32) -> Result<Arc<LocalContext>> {
        if world_size == 0 {
            return Err(collective_failed("create_context", rank, "empty clique"));
        }
        let clique = self.clique(clique_id, world_size)?;
        let rx = clique.claim(rank)?;

        let mut joined = clique.joined.subscribe();
        let formed = tokio::time::timeout(self.timeout, joined.wait_for(|n| *n >= world_size))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);

        if !formed {
            let seen = *joined.borrow();
            if clique.release(rank, rx) {
                self.forget(clique_id);
            }
            return Err(collective_failed(
                "create_context",
                rank,
                format!(
                    "only {seen}/{world_size} ranks joined {clique_id:?} within {}ms",
                    self.timeout.as_millis()
                ),
            ));
        }

        tracing::debug!("rank {rank}/{world_size} joined {clique_id:?}");
        Ok(Arc::new(LocalContext {
            rank,
            world_size,
            clique,
            engine: self.clone(),
            inbox: tokio::sync::Mutex::new(Inbox {
                rx,
                pending: HashMap::new(),
            }),
            seq: AtomicU64::new(0),
            splits: AtomicU64::new(0),
            departed: watch::channel(false).0,
        }))
    }
}

impl CollectiveEngine for LocalCollectiveEngine {
    fn create_context<'a>(
        &'a self,
        clique_id: CliqueId,
        rank: Rank,
        world_size: u32,
    ) -> BoxFuture<'a, Result<Arc<dyn CollectiveContext>>> {
        Box::pin(async move {
            let ctx: Arc<dyn CollectiveContext> = self.join(clique_id, rank, world_size).await?;
            Ok(ctx)
        })
    }
}

struct Inbox {
    rx: mpsc::UnboundedReceiver<Envelope>,
    /// Messages that arrived ahead of the call that consumes them,
    /// keyed by `(seq, src)`.
    pending: HashMap<(u64, Rank), Vec<u8>>,
}

struct LocalContext {
    rank: Rank,
    world_size: u32,
    clique: Arc<Clique>,
    engine: LocalCollectiveEngine,
    inbox: tokio::sync::Mutex<Inbox>,
    /// Collective sequence number; advances in lockstep on every rank.
    seq: AtomicU64,
    /// Number of splits taken from this context; names each split's sub-cliques.
    splits: AtomicU64,
    /// Flipped once by `leave()`; wakes a receive in progress.
    departed: watch::Sender<bool>,
}

impl LocalContext {
    fn begin(&self, operation: &'static str) -> Result<u64> {
        if *self.departed.borrow() {
            return Err(collective_failed(operation, self.rank, "context destroyed"));
        }
        Ok(self.seq.fetch_add(1, Ordering::Relaxed))
    }

    fn check_root(&self, root: Rank) -> Result<()> {
        if root >= self.world_size {
            return Err(CohortError::InvalidRoot {
                root,
                world_size: self.world_size,
            });
        }
        Ok(())
    }

    fn peers(&self) -> impl Iterator<Item = Rank> + '_ {
        (0..self.world_size).filter(move |&r| r != self.rank)
    }

    fn send_to(&self, dest: Rank, seq: u64, payload: &[u8], operation: &'static str) -> Result<()> {
        self.clique.senders[dest as usize]
            .send(Envelope {
                src: self.rank,
                seq,
                payload: payload.to_vec(),
            })
            .map_err(|_| collective_failed(operation, dest, "peer left the clique"))
    }

    async fn recv_from(&self, src: Rank, seq: u64, operation: &'static str) -> Result<Vec<u8>> {
        let mut departed = self.departed.subscribe();
        let mut inbox = self.inbox.lock().await;
        // Calls run in sequence order, so anything older belongs to an
        // abandoned call and can never be consumed.
        inbox.pending.retain(|&(s, _), _| s >= seq);
        if let Some(payload) = inbox.pending.remove(&(seq, src)) {
            return Ok(payload);
        }
        let wait = async {
            loop {
                match inbox.rx.recv().await {
                    Some(env) if env.src == src && env.seq == seq => return Ok(env.payload),
                    Some(env) if env.seq < seq => {}
                    Some(env) => {
                        inbox.pending.insert((env.seq, env.src), env.payload);
                    }
                    None => return Err(collective_failed(operation, src, "mailbox closed")),
                }
            }
        };
        let received = tokio::select! {
            r = tokio::time::timeout(self.engine.timeout, wait) => Some(r),
            _ = departed.wait_for(|left| *left) => None,
        };
        match received {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(collective_failed(
                operation,
                src,
                format!("recv timed out after {}ms", self.engine.timeout.as_millis()),
            )),
            None => {
                inbox.rx.close();
                Err(collective_failed(operation, self.rank, "context destroyed"))
            }
        }
    }

    /// Rank `r`'s contribution: our own bytes, or a length-checked receive.
    async fn chunk_from(
        &self,
        r: Rank,
        seq: u64,
        own: &[u8],
        operation: &'static str,
    ) -> Result<Vec<u8>> {
        if r == self.rank {
            return Ok(own.to_vec());
        }
        let chunk = self.recv_from(r, seq, operation).await?;
        if chunk.len() != own.len() {
            return Err(CohortError::BufferSizeMismatch {
                expected: own.len(),
                actual: chunk.len(),
            });
        }
        Ok(chunk)
    }

    async fn fold_all(
        &self,
        seq: u64,
        own: &[u8],
        dtype: DataType,
        op: ReduceOp,
        operation: &'static str,
    ) -> Result<Vec<u8>> {
        let mut acc = self.chunk_from(0, seq, own, operation).await?;
        for r in 1..self.world_size {
            let chunk = self.chunk_from(r, seq, own, operation).await?;
            reduce_slice(&mut acc, &chunk, dtype, op)?;
        }
        Ok(acc)
    }

    async fn allreduce_impl(
        &self,
        send: &[u8],
        recv: &mut [u8],
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        check_len(send.len(), recv.len())?;
        let seq = self.begin("allreduce")?;
        for peer in self.peers() {
            self.send_to(peer, seq, send, "allreduce")?;
        }
        let acc = self.fold_all(seq, send, dtype, op, "allreduce").await?;
        recv.copy_from_slice(&acc);
        Ok(())
    }

    async fn allgather_impl(&self, send: &[u8], recv: &mut [u8]) -> Result<()> {
        let len = send.len();
        check_len(len * self.world_size as usize, recv.len())?;
        let seq = self.begin("allgather")?;
        for peer in self.peers() {
            self.send_to(peer, seq, send, "allgather")?;
        }
        for r in 0..self.world_size {
            let chunk = self.chunk_from(r, seq, send, "allgather").await?;
            let off = r as usize * len;
            recv[off..off + len].copy_from_slice(&chunk);
        }
        Ok(())
    }

    async fn broadcast_impl(&self, send: &[u8], recv: &mut [u8], root: Rank) -> Result<()> {
        self.check_root(root)?;
        if self.rank == root {
            check_len(send.len(), recv.len())?;
        }
        let seq = self.begin("broadcast")?;
        if self.rank == root {
            recv.copy_from_slice(send);
            for peer in self.peers() {
                self.send_to(peer, seq, send, "broadcast")?;
            }
        } else {
            let chunk = self.recv_from(root, seq, "broadcast").await?;
            check_len(recv.len(), chunk.len())?;
            recv.copy_from_slice(&chunk);
        }
        Ok(())
    }

    async fn broadcast_inplace_impl(&self, buf: &mut [u8], root: Rank) -> Result<()> {
        self.check_root(root)?;
        let seq = self.begin("broadcast")?;
        if self.rank == root {
            for peer in self.peers() {
                self.send_to(peer, seq, buf, "broadcast")?;
            }
        } else {
            let chunk = self.recv_from(root, seq, "broadcast").await?;
            check_len(buf.len(), chunk.len())?;
            buf.copy_from_slice(&chunk);
        }
        Ok(())
    }

    async fn reduce_impl(
        &self,
        send: &[u8],
        recv: &mut [u8],
        dtype: DataType,
        op: ReduceOp,
        root: Rank,
    ) -> Result<()> {
        self.check_root(root)?;
        if self.rank == root {
            check_len(send.len(), recv.len())?;
        }
        let seq = self.begin("reduce")?;
        if self.rank == root {
            let acc = self.fold_all(seq, send, dtype, op, "reduce").await?;
            recv.copy_from_slice(&acc);
        } else {
            self.send_to(root, seq, send, "reduce")?;
        }
        Ok(())
    }

    async fn reduce_scatter_impl(
        &self,
        send: &[u8],
        recv: &mut [u8],
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        let world = self.world_size as usize;
        let len = recv.len();
        if send.len() != len * world {
            return Err(CohortError::IndivisibleCount {
                count: send.len(),
                world_size: world,
                operation: "reduce_scatter",
            });
        }
        let seq = self.begin("reduce_scatter")?;
        for peer in self.peers() {
            let off = peer as usize * len;
            self.send_to(peer, seq, &send[off..off + len], "reduce_scatter")?;
        }
        let own_off = self.rank as usize * len;
        let own = &send[own_off..own_off + len];
        let acc = self.fold_all(seq, own, dtype, op, "reduce_scatter").await?;
        recv.copy_from_slice(&acc);
        Ok(())
    }

    async fn split_impl(&self, color: u32, key: u32) -> Result<Arc<dyn CollectiveContext>> {
        let mut mine = [0u8; 8];
        mine[..4].copy_from_slice(&color.to_le_bytes());
        mine[4..].copy_from_slice(&key.to_le_bytes());
        let mut all = vec![0u8; mine.len() * self.world_size as usize];
        self.allgather_impl(&mine, &mut all).await?;

        let entries: Vec<(u32, u32)> = all
            .chunks_exact(8)
            .map(|c| {
                (
                    u32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                    u32::from_le_bytes([c[4], c[5], c[6], c[7]]),
                )
            })
            .collect();
        let group = split_group(&entries, self.rank)?;
        let new_rank = group
            .iter()
            .position(|&r| r == self.rank)
            .ok_or_else(|| collective_failed("split", self.rank, "rank missing from its color group"))?
            as Rank;

        // Splits are collective, so the counter advances in lockstep.
        let generation = self.splits.fetch_add(1, Ordering::Relaxed);
        let id = self.clique.id.derive(generation, color);
        tracing::debug!(
            rank = self.rank,
            color,
            new_rank,
            size = group.len(),
            "splitting {:?} into {id:?}",
            self.clique.id
        );
        let sub: Arc<dyn CollectiveContext> = self.engine.join(id, new_rank, group.len() as u32).await?;
        Ok(sub)
    }

    fn leave(&self) {
        if self.departed.send_replace(true) {
            return;
        }
        // Closing the mailbox makes later sends from peers fail fast. A
        // receive in progress holds the inbox and closes it on wake-up.
        if let Ok(mut inbox) = self.inbox.try_lock() {
            inbox.rx.close();
        }
        if self.clique.depart() {
            self.engine.forget(self.clique.id);
        }
    }
}

impl CollectiveContext for LocalContext {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.world_size
    }

    fn allreduce<'a>(
        &'a self,
        send: &'a [u8],
        recv: &'a mut [u8],
        dtype: DataType,
        op: ReduceOp,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.allreduce_impl(send, recv, dtype, op))
    }

    fn allgather<'a>(&'a self, send: &'a [u8], recv: &'a mut [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.allgather_impl(send, recv))
    }

    fn broadcast<'a>(
        &'a self,
        send: &'a [u8],
        recv: &'a mut [u8],
        root: Rank,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.broadcast_impl(send, recv, root))
    }

    fn broadcast_inplace<'a>(&'a self, buf: &'a mut [u8], root: Rank) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.broadcast_inplace_impl(buf, root))
    }

    fn reduce<'a>(
        &'a self,
        send: &'a [u8],
        recv: &'a mut [u8],
        dtype: DataType,
        op: ReduceOp,
        root: Rank,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.reduce_impl(send, recv, dtype, op, root))
    }

    fn reduce_scatter<'a>(
        &'a self,
        send: &'a [u8],
        recv: &'a mut [u8],
        dtype: DataType,
        op: ReduceOp,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.reduce_scatter_impl(send, recv, dtype, op))
    }

    fn split<'a>(&'a self, color: u32, key: u32) -> BoxFuture<'a, Result<Arc<dyn CollectiveContext>>> {
        Box::pin(self.split_impl(color, key))
    }

    fn destroy(&self) {
        self.leave();
    }
}

impl Drop for LocalContext {
    fn drop(&mut self) {
        self.leave();
    }
}

fn check_len(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(CohortError::BufferSizeMismatch { expected, actual });
    }
    Ok(())
}

fn collective_failed(operation: &'static str, rank: Rank, reason: impl Into<String>) -> CohortError {
    CohortError::CollectiveFailed {
        operation,
        rank,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i32s(v: &[i32]) -> Vec<u8> {
        v.iter().flat_map(|x| x.to_le_bytes()).collect()
    }

    async fn form(engine: &LocalCollectiveEngine, n: u32) -> Vec<Arc<dyn CollectiveContext>> {
        let clique = CliqueId::generate();
        let futs = (0..n).map(|r| engine.create_context(clique, r, n));
        futures::future::try_join_all(futs).await.unwrap()
    }

    #[tokio::test]
    async fn test_rendezvous_assigns_ranks() {
        let engine = LocalCollectiveEngine::new(Duration::from_secs(2));
        let ctxs = form(&engine, 3).await;
        for (i, c) in ctxs.iter().enumerate() {
            assert_eq!(c.rank() as usize, i);
            assert_eq!(c.world_size(), 3);
        }
        assert_eq!(engine.active_cliques(), 1);
        drop(ctxs);
        assert_eq!(engine.active_cliques(), 0);
    }

    #[tokio::test]
    async fn test_rendezvous_times_out_when_rank_missing() {
        let engine = LocalCollectiveEngine::new(Duration::from_millis(100));
        let err = match engine.create_context(CliqueId::generate(), 0, 2).await {
            Ok(_) => panic!("rendezvous should not complete with one of two ranks"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("1/2"), "got: {err}");
        assert_eq!(engine.active_cliques(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_rank_rejected() {
        let engine = LocalCollectiveEngine::new(Duration::from_millis(100));
        let clique = CliqueId::generate();
        let (a, b) = tokio::join!(
            engine.create_context(clique, 0, 2),
            engine.create_context(clique, 0, 2)
        );
        assert!(a.is_err() || b.is_err());
    }

    #[tokio::test]
    async fn test_allreduce_and_allgather() {
        let engine = LocalCollectiveEngine::new(Duration::from_secs(2));
        let ctxs = form(&engine, 4).await;

        let futs = ctxs.iter().map(|c| async move {
            let send = i32s(&[c.rank() as i32, 1]);
            let mut sum = vec![0u8; 8];
            c.allreduce(&send, &mut sum, DataType::I32, ReduceOp::Sum)
                .await?;
            let mut gathered = vec![0u8; 32];
            c.allgather(&send, &mut gathered).await?;
            Ok::<_, CohortError>((sum, gathered))
        });
        for (sum, gathered) in futures::future::try_join_all(futs).await.unwrap() {
            assert_eq!(sum, i32s(&[6, 4]));
            assert_eq!(gathered, i32s(&[0, 1, 1, 1, 2, 1, 3, 1]));
        }
    }

    #[tokio::test]
    async fn test_reduce_scatter_chunks() {
        let engine = LocalCollectiveEngine::new(Duration::from_secs(2));
        let ctxs = form(&engine, 2).await;

        let futs = ctxs.iter().map(|c| async move {
            // Rank r contributes [r, r + 10].
            let r = c.rank() as i32;
            let send = i32s(&[r, r + 10]);
            let mut recv = vec![0u8; 4];
            c.reduce_scatter(&send, &mut recv, DataType::I32, ReduceOp::Sum)
                .await?;
            Ok::<_, CohortError>((c.rank(), recv))
        });
        for (rank, recv) in futures::future::try_join_all(futs).await.unwrap() {
            let expected = if rank == 0 { 1 } else { 21 };
            assert_eq!(recv, i32s(&[expected]));
        }
    }

    #[tokio::test]
    async fn test_broadcast_rejects_out_of_range_root() {
        let engine = LocalCollectiveEngine::new(Duration::from_secs(2));
        let ctxs = form(&engine, 1).await;
        let mut buf = [0u8; 4];
        let err = ctxs[0].broadcast_inplace(&mut buf, 1).await.unwrap_err();
        assert!(matches!(err, CohortError::InvalidRoot { root: 1, .. }));
    }

    #[tokio::test]
    async fn test_destroy_interrupts_pending_recv() {
        let engine = LocalCollectiveEngine::new(Duration::from_secs(10));
        let ctxs = form(&engine, 2).await;

        // Rank 1 never joins the barrier, so rank 0 sits in its receive.
        let waiting = {
            let ctx = Arc::clone(&ctxs[0]);
            tokio::spawn(async move { ctx.barrier().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctxs[0].destroy();

        let outcome = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("destroy should wake the pending receive")
            .unwrap();
        let err = outcome.unwrap_err();
        assert!(err.to_string().contains("context destroyed"), "got: {err}");

        // The mailbox is closed, so rank 1 fails on send instead of timing out.
        let err = tokio::time::timeout(Duration::from_secs(1), ctxs[1].barrier())
            .await
            .expect("send into a departed rank should fail fast")
            .unwrap_err();
        assert!(err.to_string().contains("peer left"), "got: {err}");
    }

    #[tokio::test]
    async fn test_abandoned_call_leaves_nothing_parked() {
        let engine = LocalCollectiveEngine::new(Duration::from_millis(100));
        let clique = CliqueId::generate();
        let (a, b) = tokio::join!(engine.join(clique, 0, 2), engine.join(clique, 1, 2));
        let (a, b) = (a.unwrap(), b.unwrap());

        // Rank 0 gives up on a broadcast before rank 1 sends its share.
        let mut buf = i32s(&[0]);
        assert!(a.broadcast_inplace(&mut buf, 1).await.is_err());
        let mut late = i32s(&[7]);
        b.broadcast_inplace(&mut late, 1).await.unwrap();

        let send = i32s(&[1]);
        let (ra, rb) = tokio::join!(
            async {
                let mut recv = vec![0u8; 4];
                a.allreduce(&send, &mut recv, DataType::I32, ReduceOp::Sum)
                    .await
                    .map(|_| recv)
            },
            async {
                let mut recv = vec![0u8; 4];
                b.allreduce(&send, &mut recv, DataType::I32, ReduceOp::Sum)
                    .await
                    .map(|_| recv)
            }
        );
        assert_eq!(ra.unwrap(), i32s(&[2]));
        assert_eq!(rb.unwrap(), i32s(&[2]));
        assert!(a.inbox.lock().await.pending.is_empty());
    }

    #[tokio::test]
    async fn test_split_by_color_ordered_by_key() {
        let engine = LocalCollectiveEngine::new(Duration::from_secs(2));
        let ctxs = form(&engine, 4).await;

        // Even and odd ranks split apart; a descending key reverses each group.
        let futs = ctxs.iter().map(|c| async move {
            let r = c.rank();
            let sub = c.split(r % 2, 10 - r).await?;
            let mut gathered = vec![0u8; 8];
            sub.allgather(&i32s(&[r as i32]), &mut gathered).await?;
            Ok::<_, CohortError>((r, sub, gathered))
        });
        let subs = futures::future::try_join_all(futs).await.unwrap();
        for (r, sub, gathered) in &subs {
            assert_eq!(sub.world_size(), 2);
            let expected = if r % 2 == 0 { [2, 0] } else { [3, 1] };
            assert_eq!(*gathered, i32s(&expected), "rank {r}");
            assert_eq!(sub.rank(), if *r < 2 { 1 } else { 0 });
        }
        assert_eq!(engine.active_cliques(), 3);

        drop(subs);
        assert_eq!(engine.active_cliques(), 1);

        // The parent clique keeps working after the split.
        let futs = ctxs.iter().map(|c| c.barrier());
        futures::future::try_join_all(futs).await.unwrap();
    }

    #[tokio::test]
    async fn test_destroyed_context_fails() {
        let engine = LocalCollectiveEngine::new(Duration::from_millis(200));
        let ctxs = form(&engine, 2).await;
        ctxs[1].destroy();
        let err = ctxs[0].barrier().await.unwrap_err();
        assert!(matches!(err, CohortError::CollectiveFailed { .. }));
        assert!(ctxs[1].barrier().await.is_err());
    }
}
