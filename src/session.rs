use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tonic::metadata::MetadataMap;

use crate::connection::SessionService;
use crate::pool::PoolCore;
use crate::retry::run_retryable;
use crate::Error;

/// Liveness pings are cheap and answer fast; anything slower is as good as
/// dead.
const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Best-effort budget for the delete RPC. The server garbage-collects
/// abandoned sessions on its own, so this never blocks callers for long.
const DESTROY_TIMEOUT: Duration = Duration::from_secs(15);

/// Which of the pool's idle lists currently links the session, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdleKind {
    Read,
    Write,
}

/// A server-side session plus the bookkeeping the pool and health checker
/// hang off it.
///
/// A session is exclusively owned by exactly one of: a handle held by a
/// caller, the read-idle list, the write-idle list, or nothing (destroyed).
pub(crate) struct Session {
    /// Server-assigned name; fixed at creation.
    pub(crate) id: String,
    /// Channel the session was created on. All of its RPCs stay on it.
    pub(crate) service: Arc<dyn SessionService>,
    /// Home pool. Non-owning: the pool owns its sessions, sessions point
    /// back.
    pub(crate) pool: Weak<PoolCore>,
    /// Metadata forwarded on every RPC made with this session.
    pub(crate) md: MetadataMap,
    pub(crate) create_time: Instant,
    state: Mutex<SessionState>,
}

struct SessionState {
    /// Once cleared, never set again.
    valid: bool,
    /// Position in the health-check heap; `None` once unregistered.
    hc_index: Option<usize>,
    idle: Option<IdleKind>,
    /// Deadline of the next scheduled health check.
    next_check: Instant,
    /// Set while a health-check worker owns the session. Mutated only with
    /// the checker lock held.
    checking_health: bool,
    /// Pre-begun read-write transaction id waiting to be claimed.
    tx: Option<Vec<u8>>,
}

impl Session {
    pub(crate) fn new(
        id: String,
        service: Arc<dyn SessionService>,
        pool: Weak<PoolCore>,
        md: MetadataMap,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            id,
            service,
            pool,
            md,
            create_time: now,
            state: Mutex::new(SessionState {
                valid: true,
                hc_index: None,
                idle: None,
                next_check: now,
                checking_health: false,
                tx: None,
            }),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.state().valid
    }

    /// Clears the validity flag and returns the previous value.
    pub(crate) fn invalidate(&self) -> bool {
        let mut state = self.state();
        let was_valid = state.valid;
        state.valid = false;
        was_valid
    }

    pub(crate) fn is_write_prepared(&self) -> bool {
        self.state().tx.is_some()
    }

    pub(crate) fn transaction_id(&self) -> Option<Vec<u8>> {
        self.state().tx.clone()
    }

    pub(crate) fn set_transaction(&self, tx: Option<Vec<u8>>) {
        self.state().tx = tx;
    }

    /// Swaps the heap index and returns the old one.
    pub(crate) fn set_hc_index(&self, index: Option<usize>) -> Option<usize> {
        let mut state = self.state();
        std::mem::replace(&mut state.hc_index, index)
    }

    pub(crate) fn hc_index(&self) -> Option<usize> {
        self.state().hc_index
    }

    /// Swaps the idle-list link and returns the old one.
    pub(crate) fn set_idle(&self, idle: Option<IdleKind>) -> Option<IdleKind> {
        let mut state = self.state();
        std::mem::replace(&mut state.idle, idle)
    }

    pub(crate) fn idle(&self) -> Option<IdleKind> {
        self.state().idle
    }

    pub(crate) fn next_check(&self) -> Instant {
        self.state().next_check
    }

    pub(crate) fn set_next_check(&self, at: Instant) {
        self.state().next_check = at;
    }

    pub(crate) fn is_checking(&self) -> bool {
        self.state().checking_health
    }

    /// Callers must hold the health-checker lock.
    pub(crate) fn set_checking(&self, checking: bool) {
        self.state().checking_health = checking;
    }

    /// Verifies the session is still alive on the server.
    pub(crate) async fn ping(&self) -> Result<(), Error> {
        let deadline = Instant::now() + PING_TIMEOUT;
        run_retryable(Some(deadline), || {
            self.service.get_session(&self.id, &self.md)
        })
        .await
    }

    /// Opens a read-write transaction on the session if it does not already
    /// hold one, so the first write skips a round trip.
    pub(crate) async fn prepare_for_write(&self, deadline: Instant) -> Result<(), Error> {
        if self.is_write_prepared() {
            return Ok(());
        }
        let tx = run_retryable(Some(deadline), || {
            self.service.begin_transaction(&self.id, &self.md)
        })
        .await?;
        self.set_transaction(Some(tx));
        Ok(())
    }

    /// Hands the session back to its home pool; sessions the pool refuses
    /// (closed pool, invalidated session) are destroyed instead.
    pub(crate) async fn recycle(self: &Arc<Self>) {
        self.set_transaction(None);
        let recycled = match self.pool.upgrade() {
            Some(pool) => pool.recycle(self),
            None => false,
        };
        if !recycled {
            self.destroy(false).await;
        }
    }

    /// Removes the session from the pool and the health-check queue, then
    /// deletes it on the server. Returns false if the pool refused the
    /// removal (see [`PoolCore::remove`]).
    pub(crate) async fn destroy(self: &Arc<Self>, from_expiry: bool) -> bool {
        let Some(pool) = self.pool.upgrade() else {
            return false;
        };
        if !pool.remove(self, from_expiry) {
            return false;
        }
        if let Some(hc) = pool.health_checker() {
            hc.unregister(self);
        }
        let deadline = Instant::now() + DESTROY_TIMEOUT;
        if let Err(err) = run_retryable(Some(deadline), || {
            self.service.delete_session(&self.id, &self.md)
        })
        .await
        {
            log::warn!("failed to delete session {}: {err}", self.id);
        }
        true
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("create_time", &self.create_time)
            .field("valid", &state.valid)
            .field("hc_index", &state.hc_index)
            .field("idle", &state.idle)
            .field("next_check", &state.next_check)
            .field("write_prepared", &state.tx.is_some())
            .finish()
    }
}

/// One-shot proxy through which a caller uses a pooled session.
///
/// The first completed [`release`](Self::release) or
/// [`destroy`](Self::destroy) consumes the inner session; later calls are
/// no-ops. Dropping an unconsumed handle returns the session on a best-effort
/// basis.
pub struct SessionHandle {
    session: Mutex<Option<Arc<Session>>>,
}

impl SessionHandle {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self {
            session: Mutex::new(Some(session)),
        }
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().unwrap().clone()
    }

    /// Server-assigned session name; empty once the handle was consumed.
    pub fn id(&self) -> String {
        self.session().map(|s| s.id.clone()).unwrap_or_default()
    }

    /// Metadata to forward on every RPC made with this session.
    pub fn metadata(&self) -> MetadataMap {
        self.session().map(|s| s.md.clone()).unwrap_or_default()
    }

    /// Pre-begun read-write transaction id, when the session is
    /// write-prepared.
    pub fn transaction_id(&self) -> Option<Vec<u8>> {
        self.session().and_then(|s| s.transaction_id())
    }

    /// Returns the session to the pool. If the pool rejects it, the session
    /// is destroyed instead.
    pub async fn release(&self) {
        let session = self.session.lock().unwrap().take();
        if let Some(session) = session {
            session.recycle().await;
        }
    }

    /// Unconditionally destroys the session.
    pub async fn destroy(&self) {
        let session = self.session.lock().unwrap().take();
        if let Some(session) = session {
            session.destroy(false).await;
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let Some(session) = self.session.get_mut().unwrap().take() else {
            return;
        };
        session.set_transaction(None);
        let recycled = match session.pool.upgrade() {
            Some(pool) => pool.recycle(&session),
            None => false,
        };
        if !recycled {
            // The delete RPC needs a runtime; outside one the server's own
            // session GC picks up the slack.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    session.destroy(false).await;
                });
            }
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session", &self.session())
            .finish()
    }
}
