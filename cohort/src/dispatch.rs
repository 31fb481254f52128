//! Worker-side operation dispatcher.
//!
//! Every operation is a self-verifying exchange: each rank contributes values
//! derived from its rank, runs the primitive, and checks what it received.
//! `Ok(false)` means the primitive completed but produced wrong data.

use crate::engine::CollectiveContext;
use crate::error::{CohortError, Result};
use crate::transport::P2pMesh;
use crate::types::{DataType, Rank, ReduceOp};
use crate::worker::Handle;

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectiveKind {
    Allreduce,
    Allgather,
    Allgatherv,
    Broadcast,
    InplaceBroadcast,
    Reduce,
    ReduceScatter,
}

impl CollectiveKind {
    pub const ALL: [CollectiveKind; 7] = [
        CollectiveKind::Allreduce,
        CollectiveKind::Allgather,
        CollectiveKind::Allgatherv,
        CollectiveKind::Broadcast,
        CollectiveKind::InplaceBroadcast,
        CollectiveKind::Reduce,
        CollectiveKind::ReduceScatter,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CollectiveKind::Allreduce => "allreduce",
            CollectiveKind::Allgather => "allgather",
            CollectiveKind::Allgatherv => "allgatherv",
            CollectiveKind::Broadcast => "broadcast",
            CollectiveKind::InplaceBroadcast => "inplace_broadcast",
            CollectiveKind::Reduce => "reduce",
            CollectiveKind::ReduceScatter => "reduce_scatter",
        }
    }
}

impl std::fmt::Display for CollectiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything a worker can be asked to run against its handle.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub enum Operation {
    /// `root` is validated for every kind, including those that ignore it.
    Collective { kind: CollectiveKind, root: Rank },
    Barrier,
    /// Requires the handle's point-to-point mesh.
    SendRecv { n_trials: u32 },
    /// Split the clique by `rank % color_mod` and run an exchange on each
    /// sub-clique.
    Split { color_mod: u32 },
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Collective { kind, root } => write!(f, "{kind}(root={root})"),
            Operation::Barrier => f.write_str("barrier"),
            Operation::SendRecv { n_trials } => write!(f, "send_recv(n_trials={n_trials})"),
            Operation::Split { color_mod } => write!(f, "split(color_mod={color_mod})"),
        }
    }
}

/// Run `op` on this worker's share of the clique.
pub async fn dispatch(handle: &Handle, op: &Operation) -> Result<bool> {
    let ctx = handle.collective();
    match op {
        Operation::Collective { kind, root } => {
            let root = *root;
            if root >= handle.world_size() {
                return Err(CohortError::InvalidRoot {
                    root,
                    world_size: handle.world_size(),
                });
            }
            match kind {
                CollectiveKind::Allreduce => test_allreduce(ctx).await,
                CollectiveKind::Allgather => test_allgather(ctx).await,
                CollectiveKind::Allgatherv => test_allgatherv(ctx).await,
                CollectiveKind::Broadcast => test_broadcast(ctx, root).await,
                CollectiveKind::InplaceBroadcast => test_inplace_broadcast(ctx, root).await,
                CollectiveKind::Reduce => test_reduce(ctx, root).await,
                CollectiveKind::ReduceScatter => test_reduce_scatter(ctx).await,
            }
        }
        Operation::Barrier => {
            ctx.barrier().await?;
            Ok(true)
        }
        Operation::SendRecv { n_trials } => {
            let mesh = handle.p2p().ok_or(CohortError::P2PNotEnabled)?;
            test_send_recv(mesh, handle.world_size(), *n_trials).await
        }
        Operation::Split { color_mod } => {
            if *color_mod == 0 {
                return Err(CohortError::NoSplitColors);
            }
            test_split(ctx, *color_mod).await
        }
    }
}

fn encode(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

async fn test_allreduce(ctx: &dyn CollectiveContext) -> Result<bool> {
    let send = encode(&[1]);
    let mut recv = vec![0u8; send.len()];
    ctx.allreduce(&send, &mut recv, DataType::I32, ReduceOp::Sum)
        .await?;
    Ok(decode(&recv) == [ctx.world_size() as i32])
}

async fn test_allgather(ctx: &dyn CollectiveContext) -> Result<bool> {
    let send = encode(&[ctx.rank() as i32]);
    let mut recv = vec![0u8; send.len() * ctx.world_size() as usize];
    ctx.allgather(&send, &mut recv).await?;
    let expected: Vec<i32> = (0..ctx.world_size() as i32).collect();
    Ok(decode(&recv) == expected)
}

/// Rank `r` contributes `r + 1` copies of `r`.
async fn test_allgatherv(ctx: &dyn CollectiveContext) -> Result<bool> {
    let world = ctx.world_size() as usize;
    let rank = ctx.rank() as i32;
    let counts: Vec<usize> = (1..=world).collect();
    let displs: Vec<usize> = counts
        .iter()
        .scan(0, |acc, &c| {
            let d = *acc;
            *acc += c;
            Some(d)
        })
        .collect();
    let total: usize = counts.iter().sum();

    let send = encode(&vec![rank; rank as usize + 1]);
    let mut recv = vec![0u8; total * DataType::I32.size_in_bytes()];
    ctx.allgatherv(&send, &mut recv, &counts, &displs, DataType::I32)
        .await?;

    let expected: Vec<i32> = (0..world as i32)
        .flat_map(|r| std::iter::repeat_n(r, r as usize + 1))
        .collect();
    Ok(decode(&recv) == expected)
}

async fn test_broadcast(ctx: &dyn CollectiveContext, root: Rank) -> Result<bool> {
    let send = encode(&[ctx.rank() as i32]);
    let mut recv = encode(&[-1]);
    ctx.broadcast(&send, &mut recv, root).await?;
    Ok(decode(&recv) == [root as i32])
}

async fn test_inplace_broadcast(ctx: &dyn CollectiveContext, root: Rank) -> Result<bool> {
    let mut buf = if ctx.rank() == root {
        encode(&[root as i32])
    } else {
        encode(&[-1])
    };
    ctx.broadcast_inplace(&mut buf, root).await?;
    Ok(decode(&buf) == [root as i32])
}

/// Only the root's result is checked.
async fn test_reduce(ctx: &dyn CollectiveContext, root: Rank) -> Result<bool> {
    let send = encode(&[1]);
    let mut recv = encode(&[-1]);
    ctx.reduce(&send, &mut recv, DataType::I32, ReduceOp::Sum, root)
        .await?;
    if ctx.rank() != root {
        return Ok(true);
    }
    Ok(decode(&recv) == [ctx.world_size() as i32])
}

async fn test_reduce_scatter(ctx: &dyn CollectiveContext) -> Result<bool> {
    let world = ctx.world_size() as usize;
    let send = encode(&vec![1; world]);
    let mut recv = encode(&[-1]);
    ctx.reduce_scatter(&send, &mut recv, DataType::I32, ReduceOp::Sum)
        .await?;
    Ok(decode(&recv) == [world as i32])
}

/// Ranks split by `rank % color_mod` with descending keys, so each
/// sub-clique lists its members in reverse parent-rank order.
async fn test_split(ctx: &dyn CollectiveContext, color_mod: u32) -> Result<bool> {
    let rank = ctx.rank();
    let world = ctx.world_size();
    let color = rank % color_mod;
    let sub = ctx.split(color, world - rank).await?;

    let members: Vec<i32> = (0..world)
        .rev()
        .filter(|r| r % color_mod == color)
        .map(|r| r as i32)
        .collect();
    let outcome = async {
        let send = encode(&[rank as i32]);
        let mut sum = vec![0u8; send.len()];
        sub.allreduce(&send, &mut sum, DataType::I32, ReduceOp::Sum)
            .await?;
        let mut gathered = vec![0u8; send.len() * sub.world_size() as usize];
        sub.allgather(&send, &mut gathered).await?;
        Ok::<_, CohortError>(
            sub.world_size() as usize == members.len()
                && decode(&sum) == [members.iter().sum::<i32>()]
                && decode(&gathered) == members,
        )
    }
    .await;
    sub.destroy();
    outcome
}

/// Trial `t` shifts every rank by `1 + t mod (N - 1)`, so successive trials
/// walk through different peers.
async fn test_send_recv(mesh: &P2pMesh, world_size: u32, n_trials: u32) -> Result<bool> {
    if world_size < 2 {
        return Ok(true);
    }
    let rank = mesh.rank();
    let round = mesh.next_round();
    for trial in 0..n_trials {
        let shift = 1 + trial % (world_size - 1);
        let dest = (rank + shift) % world_size;
        let src = (rank + world_size - shift) % world_size;
        let tag = (round << 32) | u64::from(trial);

        mesh.send(dest, tag, &rank.to_le_bytes()).await?;
        let got = mesh.recv(src, tag).await?;
        if got != src.to_le_bytes() {
            tracing::debug!(rank, src, trial, "send_recv received wrong payload");
            return Ok(false);
        }
    }
    Ok(true)
}
