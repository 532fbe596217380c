use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tonic::metadata::{AsciiMetadataValue, MetadataMap};

use crate::config::SessionPoolConfig;
use crate::connection::RpcClientFactory;
use crate::health::HealthChecker;
use crate::resource::DatabaseId;
use crate::retry::run_retryable;
use crate::session::{IdleKind, Session, SessionHandle};
use crate::Error;

/// Gauge tracking how many sessions the pool currently has open.
pub const OPEN_SESSION_COUNT: &str = "spanner.session_pool.open_sessions";

/// Routing header the backend uses to locate the database.
const RESOURCE_PREFIX_HEADER: &str = "google-cloud-resource-prefix";

/// Point-in-time pool counters.
///
/// At any moment, `num_opened` equals the number of outstanding handles plus
/// `num_idle` plus `num_idle_write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Sessions known to the pool, idle or checked out.
    pub num_opened: u64,
    /// Sessions in the read-idle list.
    pub num_idle: u64,
    /// Write-prepared sessions in the write-idle list.
    pub num_idle_write: u64,
    /// In-flight session creation RPCs.
    pub create_reqs: u64,
    /// In-flight write-preparation RPCs.
    pub prepare_reqs: u64,
}

/// Numeric limits resolved from the configuration at construction.
#[derive(Debug, Clone)]
pub(crate) struct PoolSettings {
    /// Hard cap on open sessions; `0` means unlimited.
    pub(crate) max_opened: u64,
    /// Floor the pool tries to maintain.
    pub(crate) min_opened: u64,
    /// Idle headroom kept above the running maximum of sessions in use.
    pub(crate) max_idle: u64,
    /// Cap on simultaneous creation RPCs; `0` means unlimited.
    pub(crate) max_burst: u64,
    /// Fraction of sessions kept write-prepared, in `[0, 1]`.
    pub(crate) write_fraction: f64,
    pub(crate) health_check_interval: Duration,
}

pub(crate) struct PoolState {
    pub(crate) valid: bool,
    /// Idle sessions without a pre-begun transaction. Taken from the front,
    /// returned to the back, so load round-robins across channels.
    pub(crate) idle_list: VecDeque<Arc<Session>>,
    /// Idle sessions already prepared for write.
    pub(crate) idle_write_list: VecDeque<Arc<Session>>,
    pub(crate) num_opened: u64,
    pub(crate) create_reqs: u64,
    pub(crate) prepare_reqs: u64,
}

pub(crate) struct PoolCore {
    pub(crate) database: String,
    pub(crate) labels: HashMap<String, String>,
    /// Metadata stamped on every RPC issued for this pool.
    pub(crate) md: MetadataMap,
    factory: RpcClientFactory,
    settings: PoolSettings,
    state: Mutex<PoolState>,
    /// Generation counter bumped whenever observable pool state changes.
    /// Blocked acquirers subscribe under the pool lock and wait for a bump;
    /// a woken waiter re-checks state and is not entitled to a free slot.
    wake: watch::Sender<u64>,
    hc: OnceLock<Arc<HealthChecker>>,
}

/// Restores creation budget when a creation attempt ends or is abandoned
/// mid-flight, and wakes waiters either way.
struct CreateGuard<'a> {
    pool: &'a PoolCore,
    success: bool,
}

impl Drop for CreateGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.pool.state();
        if !self.success {
            state.num_opened -= 1;
            self.pool.record_open_sessions(state.num_opened);
        }
        state.create_reqs -= 1;
        drop(state);
        self.pool.broadcast();
    }
}

impl PoolCore {
    pub(crate) fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub(crate) fn health_checker(&self) -> Option<&Arc<HealthChecker>> {
        self.hc.get()
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.state().valid
    }

    fn broadcast(&self) {
        self.wake.send_modify(|generation| *generation += 1);
    }

    pub(crate) fn record_open_sessions(&self, num_opened: u64) {
        metrics::gauge!(OPEN_SESSION_COUNT).set(num_opened as f64);
    }

    /// True while the share of write-prepared (or in-preparation) sessions is
    /// below the configured fraction of the pool.
    pub(crate) fn should_prepare_write(&self, state: &PoolState) -> bool {
        state.num_opened as f64 * self.settings.write_fraction
            > (state.idle_write_list.len() as u64 + state.prepare_reqs) as f64
    }

    /// Returns the session to the back of the idle list matching its
    /// readiness. Rejects sessions once the pool or the session is invalid.
    pub(crate) fn recycle(&self, session: &Arc<Session>) -> bool {
        let mut state = self.state();
        if !session.is_valid() || !state.valid {
            return false;
        }
        if session.is_write_prepared() {
            session.set_idle(Some(IdleKind::Write));
            state.idle_write_list.push_back(session.clone());
        } else {
            session.set_idle(Some(IdleKind::Read));
            state.idle_list.push_back(session.clone());
        }
        drop(state);
        self.broadcast();
        true
    }

    /// Unlinks the session from the pool and invalidates it. Expiry-driven
    /// removals are refused when they would shrink the pool below its floor
    /// or touch a checked-out session.
    pub(crate) fn remove(&self, session: &Arc<Session>, from_expiry: bool) -> bool {
        let mut state = self.state();
        if from_expiry && (state.num_opened <= self.settings.min_opened || session.idle().is_none())
        {
            return false;
        }
        match session.set_idle(None) {
            Some(IdleKind::Read) => state.idle_list.retain(|s| !Arc::ptr_eq(s, session)),
            Some(IdleKind::Write) => state.idle_write_list.retain(|s| !Arc::ptr_eq(s, session)),
            None => {}
        }
        if session.invalidate() {
            state.num_opened -= 1;
            self.record_open_sessions(state.num_opened);
            drop(state);
            self.broadcast();
            return true;
        }
        false
    }

    /// Decrements the in-flight write-preparation counter.
    pub(crate) fn prepare_done(&self) {
        self.state().prepare_reqs -= 1;
    }

    /// Issues the creation RPC and registers the new session. Creation budget
    /// (`num_opened`, `create_reqs`) must already be taken by the caller; it
    /// is restored here on failure, including when the future is dropped
    /// mid-RPC.
    pub(crate) async fn create_session(
        self: &Arc<Self>,
        deadline: Instant,
    ) -> Result<Arc<Session>, Error> {
        log::trace!("creating a new session on {}", self.database);
        let mut guard = CreateGuard {
            pool: self,
            success: false,
        };
        let service = self.factory.get()?;
        let id = run_retryable(Some(deadline), || {
            service.create_session(&self.database, &self.labels, &self.md)
        })
        .await?;
        let session = Session::new(id, service, Arc::downgrade(self), self.md.clone());
        if let Some(hc) = self.health_checker() {
            hc.register(&session);
        }
        guard.success = true;
        Ok(session)
    }

    /// Sessions idle long past their check deadline are pinged before being
    /// handed out; a failed ping destroys the session.
    async fn ensure_healthy(self: &Arc<Self>, session: &Arc<Session>) -> bool {
        let interval = self.settings.health_check_interval;
        if session.next_check() + interval * 2 < Instant::now() {
            if let Err(err) = session.ping().await {
                log::debug!("destroying unhealthy session {}: {err}", session.id);
                session.destroy(false).await;
                return false;
            }
            if let Some(hc) = self.health_checker() {
                hc.schedule_check(session);
            }
        }
        true
    }

    fn pop_front(list: &mut VecDeque<Arc<Session>>) -> Option<Arc<Session>> {
        let session = list.pop_front()?;
        session.set_idle(None);
        Some(session)
    }

    /// The acquisition loop shared by read and write takes; only the idle
    /// list preference and the write-preparation step differ.
    async fn acquire(
        self: &Arc<Self>,
        deadline: Instant,
        for_write: bool,
    ) -> Result<SessionHandle, Error> {
        // The `MutexGuard` for the pool lock must never be live across an
        // `.await`. Computing each iteration's next step inside this nested
        // block (rather than a `let` binding spanning the loop body) keeps
        // the guard's lexical scope, and hence the async state machine's
        // liveness analysis, confined to the synchronous section below.
        enum Step {
            UseSession(Arc<Session>),
            Wait(watch::Receiver<u64>),
            Create,
        }

        loop {
            let step = {
                let mut state = self.state();
                if !state.valid {
                    return Err(Error::PoolClosed);
                }

                let popped = if for_write {
                    match Self::pop_front(&mut state.idle_write_list) {
                        Some(session) => Some(session),
                        None => Self::pop_front(&mut state.idle_list),
                    }
                } else {
                    match Self::pop_front(&mut state.idle_list) {
                        Some(session) => Some(session),
                        None => Self::pop_front(&mut state.idle_write_list),
                    }
                };

                if let Some(session) = popped {
                    Step::UseSession(session)
                } else {
                    let at_capacity = (self.settings.max_opened > 0
                        && state.num_opened >= self.settings.max_opened)
                        || (self.settings.max_burst > 0
                            && state.create_reqs >= self.settings.max_burst);
                    if at_capacity {
                        // Subscribing under the lock pairs with broadcasts
                        // that happen only after state changes, so a wake
                        // cannot be lost.
                        Step::Wait(self.wake.subscribe())
                    } else {
                        // Take budget before the actual creation.
                        state.num_opened += 1;
                        self.record_open_sessions(state.num_opened);
                        state.create_reqs += 1;
                        Step::Create
                    }
                }
            };

            match step {
                Step::UseSession(session) => {
                    // Off the idle list, health workers can no longer expire
                    // it. A check here is still much cheaper than a fresh
                    // creation.
                    if !self.ensure_healthy(&session).await {
                        continue;
                    }
                    if for_write && !session.is_write_prepared() {
                        if let Err(err) = session.prepare_for_write(deadline).await {
                            session.recycle().await;
                            return Err(err);
                        }
                    }
                    log::trace!("acquired session {}", session.id);
                    return Ok(SessionHandle::new(session));
                }
                Step::Wait(mut wake) => match timeout_at(deadline, wake.changed()).await {
                    Ok(_) => continue,
                    Err(_) => return Err(Error::Timeout { last: None }),
                },
                Step::Create => {
                    let session = self.create_session(deadline).await?;
                    if for_write && !session.is_write_prepared() {
                        if let Err(err) = session.prepare_for_write(deadline).await {
                            session.recycle().await;
                            return Err(err);
                        }
                    }
                    log::trace!("created session {}", session.id);
                    return Ok(SessionHandle::new(session));
                }
            }
        }
    }
}

/// Creates and caches Cloud Spanner sessions.
///
/// An unbounded population of callers is multiplexed onto a bounded, lazily
/// grown set of server-side sessions. Idle sessions are kept warm by a health
/// checker, stale ones are expired, and a configurable fraction is kept
/// write-prepared so the first write on them skips a round trip.
///
/// Must be constructed inside a Tokio runtime; the health-check workers and
/// the maintainer are spawned on it.
#[derive(Clone)]
pub struct SessionPool {
    core: Arc<PoolCore>,
}

impl SessionPool {
    pub fn new(database: DatabaseId, config: SessionPoolConfig) -> Result<Self, Error> {
        let database = database.to_string();
        let mut md = MetadataMap::new();
        let prefix = AsciiMetadataValue::try_from(database.as_str()).map_err(|_| {
            Error::InvalidConfig(format!("database name is not a valid header value: {database}"))
        })?;
        md.insert(RESOURCE_PREFIX_HEADER, prefix);

        let settings = PoolSettings {
            max_opened: config.resolved_max_opened(),
            min_opened: config.min_opened(),
            max_idle: config.max_idle(),
            max_burst: config.max_burst(),
            write_fraction: config.write_sessions(),
            health_check_interval: config.resolved_health_check_interval(),
        };
        let (wake, _) = watch::channel(0);
        let core = Arc::new(PoolCore {
            database,
            labels: config.session_labels().clone(),
            md,
            factory: config.rpc_client().clone(),
            settings,
            state: Mutex::new(PoolState {
                valid: true,
                idle_list: VecDeque::new(),
                idle_write_list: VecDeque::new(),
                num_opened: 0,
                create_reqs: 0,
                prepare_reqs: 0,
            }),
            wake,
            hc: OnceLock::new(),
        });

        let hc = HealthChecker::start(
            core.settings.health_check_interval,
            config.resolved_health_check_workers(),
            config.resolved_sample_interval(),
            core.clone(),
        );
        let _ = core.hc.set(hc);
        if let Some(hc) = core.health_checker() {
            hc.mark_ready();
        }
        Ok(Self { core })
    }

    /// Returns a handle to a healthy session for read use. Blocks while the
    /// pool is at its open or burst limit, until `deadline`.
    pub async fn acquire_read(&self, deadline: Instant) -> Result<SessionHandle, Error> {
        self.core.acquire(deadline, false).await
    }

    /// Returns a handle whose session holds a pre-begun write transaction,
    /// preparing one inline when only a read session is available.
    pub async fn acquire_write(&self, deadline: Instant) -> Result<SessionHandle, Error> {
        self.core.acquire(deadline, true).await
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.core.state();
        PoolStats {
            num_opened: state.num_opened,
            num_idle: state.idle_list.len() as u64,
            num_idle_write: state.idle_write_list.len() as u64,
            create_reqs: state.create_reqs,
            prepare_reqs: state.prepare_reqs,
        }
    }

    /// Marks the pool invalid, stops the health checker, and destroys every
    /// session the pool knows about. Idempotent; acquires in progress fail
    /// with [`Error::PoolClosed`].
    pub async fn close(&self) {
        {
            let mut state = self.core.state();
            if !state.valid {
                return;
            }
            state.valid = false;
        }
        // Blocked acquirers wake up and observe the closed pool.
        self.core.broadcast();

        if let Some(hc) = self.core.health_checker() {
            hc.close().await;
            for session in hc.tracked_sessions() {
                session.destroy(false).await;
            }
        }
    }
}
