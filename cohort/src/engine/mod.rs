//! Boundary to the collective-communication engine.
//!
//! The controller and dispatcher only ever talk to these traits. The engine
//! owns the data plane (buffers, reductions, wire transfers); cohort owns
//! who joins which clique under which rank.

mod local;
pub(crate) mod reduce;

pub use local::LocalCollectiveEngine;

use crate::error::{CohortError, Result};
use crate::types::{CliqueId, DataType, Rank, ReduceOp};
use futures::future::BoxFuture;
use std::sync::Arc;

/// Factory for per-rank collective contexts.
pub trait CollectiveEngine: Send + Sync {
    /// Join the clique identified by `clique` as `rank` of `world_size`.
    ///
    /// Blocking and all-or-nothing: resolves only once every rank has joined,
    /// or fails when the rendezvous does not complete.
    fn create_context<'a>(
        &'a self,
        clique: CliqueId,
        rank: Rank,
        world_size: u32,
    ) -> BoxFuture<'a, Result<Arc<dyn CollectiveContext>>>;
}

/// One rank's membership in a formed clique.
///
/// Every member must issue the same sequence of collective calls with
/// matching buffer sizes; a member that never calls makes the others fail
/// once their receive timeout fires.
pub trait CollectiveContext: Send + Sync {
    fn rank(&self) -> Rank;

    fn world_size(&self) -> u32;

    /// `recv` receives the element-wise reduction of every rank's `send`.
    fn allreduce<'a>(
        &'a self,
        send: &'a [u8],
        recv: &'a mut [u8],
        dtype: DataType,
        op: ReduceOp,
    ) -> BoxFuture<'a, Result<()>>;

    /// `recv` (world_size × `send.len()` bytes) receives every rank's `send`
    /// in rank order.
    fn allgather<'a>(&'a self, send: &'a [u8], recv: &'a mut [u8]) -> BoxFuture<'a, Result<()>>;

    /// `recv` on every rank receives `send` of `root`. Non-root `send` is ignored.
    fn broadcast<'a>(
        &'a self,
        send: &'a [u8],
        recv: &'a mut [u8],
        root: Rank,
    ) -> BoxFuture<'a, Result<()>>;

    fn broadcast_inplace<'a>(&'a self, buf: &'a mut [u8], root: Rank) -> BoxFuture<'a, Result<()>>;

    /// Only `root`'s `recv` is written.
    fn reduce<'a>(
        &'a self,
        send: &'a [u8],
        recv: &'a mut [u8],
        dtype: DataType,
        op: ReduceOp,
        root: Rank,
    ) -> BoxFuture<'a, Result<()>>;

    /// `send` holds world_size chunks of `recv.len()` bytes; rank `r`
    /// receives the reduction of chunk `r` across all ranks.
    fn reduce_scatter<'a>(
        &'a self,
        send: &'a [u8],
        recv: &'a mut [u8],
        dtype: DataType,
        op: ReduceOp,
    ) -> BoxFuture<'a, Result<()>>;

    /// Split into sub-cliques. Every member must call it; members passing
    /// the same `color` form one sub-clique, ranked by `key` with ties broken
    /// by rank in this clique. The returned context is independent of this
    /// one and must be destroyed on its own.
    fn split<'a>(&'a self, color: u32, key: u32) -> BoxFuture<'a, Result<Arc<dyn CollectiveContext>>>;

    /// Leave the clique. Later calls on this context fail.
    fn destroy(&self);

    fn barrier<'a>(&'a self) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let send = 1i32.to_le_bytes();
            let mut recv = [0u8; 4];
            self.allreduce(&send, &mut recv, DataType::I32, ReduceOp::Sum)
                .await
        })
    }

    /// Variable-count allgather: rank `r` contributes `counts[r]` elements,
    /// placed at element offset `displs[r]` of `recv`.
    ///
    /// Built from one broadcast per root.
    fn allgatherv<'a>(
        &'a self,
        send: &'a [u8],
        recv: &'a mut [u8],
        counts: &'a [usize],
        displs: &'a [usize],
        dtype: DataType,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let world = self.world_size() as usize;
            if counts.len() != world || displs.len() != world {
                return Err(CohortError::BufferSizeMismatch {
                    expected: world,
                    actual: counts.len().min(displs.len()),
                });
            }
            let elem = dtype.size_in_bytes();
            for root in 0..world {
                let start = displs[root] * elem;
                let end = start + counts[root] * elem;
                if end > recv.len() {
                    return Err(CohortError::BufferSizeMismatch {
                        expected: end,
                        actual: recv.len(),
                    });
                }
                self.broadcast(send, &mut recv[start..end], root as Rank)
                    .await?;
            }
            Ok(())
        })
    }
}

/// Members of `rank`'s color group in their new rank order, given every
/// rank's `(color, key)`.
pub(crate) fn split_group(entries: &[(u32, u32)], rank: Rank) -> Result<Vec<Rank>> {
    let (color, _) = *entries.get(rank as usize).ok_or_else(|| CohortError::CollectiveFailed {
        operation: "split",
        rank,
        reason: format!("rank outside clique of size {}", entries.len()),
    })?;
    let mut group: Vec<(u32, Rank)> = entries
        .iter()
        .zip(0..)
        .filter(|&(&(c, _), _)| c == color)
        .map(|(&(_, k), r)| (k, r))
        .collect();
    group.sort_unstable();
    Ok(group.into_iter().map(|(_, r)| r).collect())
}
