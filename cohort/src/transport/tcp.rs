use crate::error::{CohortError, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot};

/// Largest payload accepted on a point-to-point channel (1 GiB).
const MAX_FRAME_SIZE: u64 = 1 << 30;

/// Receive-side routing shared with the read loop.
///
/// A frame whose tag nobody is waiting for yet is parked in `pending`;
/// `recv_tagged` drains it before registering a waiter.
#[derive(Default)]
struct RecvState {
    waiting: HashMap<u64, oneshot::Sender<Vec<u8>>>,
    pending: HashMap<u64, VecDeque<Vec<u8>>>,
    /// Highest round a receive has asked for.
    floor: u64,
    closed: bool,
}

impl RecvState {
    /// Move to `round`, dropping frames and abandoned waiters of earlier rounds.
    fn advance(&mut self, round: u64) {
        if round <= self.floor {
            return;
        }
        self.floor = round;
        self.pending.retain(|&tag, _| round_of(tag) >= round);
        self.waiting.retain(|_, tx| !tx.is_closed());
    }
}

fn round_of(tag: u64) -> u64 {
    tag >> 32
}

/// One TCP connection carrying `[tag: u64 LE][len: u64 LE][payload]` frames.
///
/// The high 32 bits of a tag are its round. Receives are issued in round
/// order, so once a receive for round `r` starts, frames from earlier rounds
/// are discarded.
pub(crate) struct TcpChannel {
    writer: Mutex<tokio::io::WriteHalf<TcpStream>>,
    state: Arc<Mutex<RecvState>>,
    read_task: tokio::task::JoinHandle<()>,
}

impl TcpChannel {
    pub(crate) fn from_stream(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = tokio::io::split(stream);
        let state = Arc::new(Mutex::new(RecvState::default()));
        let read_task = tokio::spawn(read_loop(reader, Arc::clone(&state)));
        Self {
            writer: Mutex::new(writer),
            state,
            read_task,
        }
    }

    pub(crate) async fn send_tagged(&self, tag: u64, data: &[u8]) -> Result<()> {
        let mut header = [0u8; 16];
        header[..8].copy_from_slice(&tag.to_le_bytes());
        header[8..].copy_from_slice(&(data.len() as u64).to_le_bytes());

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&header)
            .await
            .map_err(|e| CohortError::transport_with_source("p2p write header", e))?;
        writer
            .write_all(data)
            .await
            .map_err(|e| CohortError::transport_with_source("p2p write payload", e))?;
        writer
            .flush()
            .await
            .map_err(|e| CohortError::transport_with_source("p2p flush", e))?;
        Ok(())
    }

    pub(crate) async fn recv_tagged(&self, tag: u64) -> Result<Vec<u8>> {
        let rx = {
            let mut st = self.state.lock().await;
            st.advance(round_of(tag));
            if let Some(payload) = st.pending.get_mut(&tag).and_then(|q| q.pop_front()) {
                return Ok(payload);
            }
            if st.closed {
                return Err(CohortError::transport("p2p channel closed"));
            }
            let (tx, rx) = oneshot::channel();
            st.waiting.insert(tag, tx);
            rx
        };
        rx.await
            .map_err(|_| CohortError::transport("p2p channel closed"))
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

async fn read_loop(mut reader: tokio::io::ReadHalf<TcpStream>, state: Arc<Mutex<RecvState>>) {
    let mut header = [0u8; 16];
    loop {
        if let Err(e) = reader.read_exact(&mut header).await {
            tracing::debug!("p2p read loop ended: {e}");
            break;
        }
        let mut tag = [0u8; 8];
        let mut len = [0u8; 8];
        tag.copy_from_slice(&header[..8]);
        len.copy_from_slice(&header[8..]);
        let tag = u64::from_le_bytes(tag);
        let len = u64::from_le_bytes(len);

        if len > MAX_FRAME_SIZE {
            tracing::warn!(len, "p2p frame too large, closing channel");
            break;
        }

        let mut payload = vec![0u8; len as usize];
        if let Err(e) = reader.read_exact(&mut payload).await {
            tracing::debug!("p2p read loop ended mid-frame: {e}");
            break;
        }

        let mut st = state.lock().await;
        if round_of(tag) < st.floor {
            tracing::trace!(tag, "dropping frame from an abandoned round");
            continue;
        }
        let payload = match st.waiting.remove(&tag) {
            Some(tx) => match tx.send(payload) {
                Ok(()) => continue,
                // Waiter gave up (timeout); keep the frame for a retry.
                Err(payload) => payload,
            },
            None => payload,
        };
        st.pending.entry(tag).or_default().push_back(payload);
    }

    let mut st = state.lock().await;
    st.closed = true;
    st.waiting.clear();
}
