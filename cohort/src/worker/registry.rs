use crate::engine::CollectiveContext;
use crate::error::{CohortError, Result};
use crate::transport::{P2pMesh, StagedTransport};
use crate::types::{Rank, SessionId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// One worker's state for one session.
pub struct Handle {
    session: SessionId,
    rank: Rank,
    world_size: u32,
    collective: Arc<dyn CollectiveContext>,
    p2p: Option<Arc<P2pMesh>>,
}

impl Handle {
    pub fn new(
        session: SessionId,
        rank: Rank,
        world_size: u32,
        collective: Arc<dyn CollectiveContext>,
        p2p: Option<P2pMesh>,
    ) -> Self {
        Self {
            session,
            rank,
            world_size,
            collective,
            p2p: p2p.map(Arc::new),
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    pub fn collective(&self) -> &dyn CollectiveContext {
        self.collective.as_ref()
    }

    pub fn p2p(&self) -> Option<&P2pMesh> {
        self.p2p.as_deref()
    }

    /// Leave the clique. Dispatches still holding this handle fail.
    pub(crate) fn close(&self) {
        self.collective.destroy();
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("session", &self.session)
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("p2p", &self.p2p.is_some())
            .finish()
    }
}

#[derive(Default)]
struct RegistryState {
    handles: HashMap<SessionId, Arc<Handle>>,
    /// Listeners bound by the transport bootstrap, waiting for the rank table.
    staged: HashMap<SessionId, StagedTransport>,
    /// Sessions already torn down. A build that finishes after its teardown
    /// must not register.
    retired: HashSet<SessionId>,
}

/// Session id → handle table owned by one worker.
///
/// Only the build-context and teardown tasks mutate it; everything else
/// goes through [`WorkerRegistry::local_handle`]. Once a session id has been
/// torn down it is retired for good: nothing can be registered or staged
/// under it again.
#[derive(Default)]
pub struct WorkerRegistry {
    state: Mutex<RegistryState>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the handle registered for `session`.
    pub fn local_handle(&self, session: &SessionId) -> Option<Arc<Handle>> {
        self.state.lock().ok()?.handles.get(session).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().map(|st| st.handles.len()).unwrap_or(0)
    }

    /// Number of bound listeners still waiting for a rank table.
    pub fn staged_count(&self) -> usize {
        self.state.lock().map(|st| st.staged.len()).unwrap_or(0)
    }

    /// Fails with `SessionRetired` once `session` has been torn down here.
    pub(crate) fn ensure_live(&self, session: &SessionId) -> Result<()> {
        if self.lock()?.retired.contains(session) {
            return Err(CohortError::SessionRetired(*session));
        }
        Ok(())
    }

    pub(crate) fn register(&self, handle: Handle) -> Result<Arc<Handle>> {
        let mut st = self.lock()?;
        if st.retired.contains(&handle.session) {
            return Err(CohortError::SessionRetired(handle.session));
        }
        if st.handles.contains_key(&handle.session) {
            return Err(CohortError::AlreadyInitialized);
        }
        let handle = Arc::new(handle);
        st.handles.insert(handle.session, Arc::clone(&handle));
        Ok(handle)
    }

    /// Drop everything held for `session` and retire the id, returning the
    /// handle if one was registered.
    pub(crate) fn remove(&self, session: &SessionId) -> Result<Option<Arc<Handle>>> {
        let mut st = self.lock()?;
        st.retired.insert(*session);
        st.staged.remove(session);
        Ok(st.handles.remove(session))
    }

    pub(crate) fn stage_transport(&self, session: SessionId, staged: StagedTransport) -> Result<()> {
        let mut st = self.lock()?;
        if st.retired.contains(&session) {
            return Err(CohortError::SessionRetired(session));
        }
        if st.staged.contains_key(&session) || st.handles.contains_key(&session) {
            return Err(CohortError::AlreadyInitialized);
        }
        st.staged.insert(session, staged);
        Ok(())
    }

    pub(crate) fn take_staged(&self, session: &SessionId) -> Result<Option<StagedTransport>> {
        Ok(self.lock()?.staged.remove(session))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, RegistryState>> {
        self.state
            .lock()
            .map_err(|_| CohortError::LockPoisoned("worker registry"))
    }
}
