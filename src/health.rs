use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};

use crate::pool::PoolCore;
use crate::retry::should_drop_session;
use crate::session::Session;

/// Workers preparing write transactions give up quickly; a session skipped in
/// one cycle is prepared in the next.
const WORKER_PREPARE_TIMEOUT: Duration = Duration::from_secs(1);

/// Budget for each creation or preparation RPC issued while replenishing.
const REPLENISH_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on the idle nap between worker scans.
const WORKER_PAUSE_CAP: Duration = Duration::from_millis(100);

/// Number of in-use samples the maintainer remembers when estimating demand.
const MAINTAINER_WINDOW: usize = 10;

/// Min-heap of sessions keyed by next-check deadline.
///
/// Every swap rewrites the affected sessions' stored indices, so removal and
/// reordering at an arbitrary known position stay O(log n).
pub(crate) struct HealthQueue {
    sessions: Vec<Arc<Session>>,
}

impl HealthQueue {
    fn new() -> Self {
        Self { sessions: Vec::new() }
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }

    fn peek(&self) -> Option<&Arc<Session>> {
        self.sessions.first()
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.clone()
    }

    fn push(&mut self, session: Arc<Session>) {
        let index = self.sessions.len();
        session.set_hc_index(Some(index));
        self.sessions.push(session);
        self.sift_up(index);
    }

    fn remove(&mut self, index: usize) -> Option<Arc<Session>> {
        if index >= self.sessions.len() {
            return None;
        }
        let last = self.sessions.len() - 1;
        if index != last {
            self.swap(index, last);
        }
        let removed = self.sessions.pop()?;
        removed.set_hc_index(None);
        if index < self.sessions.len() {
            self.reorder(index);
        }
        Some(removed)
    }

    /// Restores the heap property around a session whose deadline changed.
    fn reorder(&mut self, index: usize) {
        let index = self.sift_up(index);
        self.sift_down(index);
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.sessions.swap(a, b);
        self.sessions[a].set_hc_index(Some(a));
        self.sessions[b].set_hc_index(Some(b));
    }

    fn sift_up(&mut self, mut index: usize) -> usize {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.sessions[index].next_check() >= self.sessions[parent].next_check() {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
        index
    }

    fn sift_down(&mut self, mut index: usize) -> usize {
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut smallest = index;
            if left < self.sessions.len()
                && self.sessions[left].next_check() < self.sessions[smallest].next_check()
            {
                smallest = left;
            }
            if right < self.sessions.len()
                && self.sessions[right].next_check() < self.sessions[smallest].next_check()
            {
                smallest = right;
            }
            if smallest == index {
                return index;
            }
            self.swap(index, smallest);
            index = smallest;
        }
    }
}

/// Periodically pings pooled sessions and keeps the pool sized to demand.
///
/// A fixed set of workers pops sessions whose check deadline elapsed, pings
/// them, and pre-begins write transactions when the pool runs below its
/// configured write-prepared fraction. A singleton maintainer samples usage
/// and replenishes or shrinks the pool once per sample interval.
pub(crate) struct HealthChecker {
    /// Guards the heap and every session's checking flag. Lock order:
    /// checker, then pool, then session.
    queue: Mutex<HealthQueue>,
    interval: Duration,
    sample_interval: Duration,
    pool: Arc<PoolCore>,
    ready: watch::Sender<bool>,
    done: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HealthChecker {
    pub(crate) fn start(
        interval: Duration,
        workers: usize,
        sample_interval: Duration,
        pool: Arc<PoolCore>,
    ) -> Arc<Self> {
        let workers = workers.max(1);
        let (ready, _) = watch::channel(false);
        let (done, _) = watch::channel(false);
        let hc = Arc::new(Self {
            queue: Mutex::new(HealthQueue::new()),
            interval,
            sample_interval,
            pool,
            ready,
            done,
            tasks: Mutex::new(Vec::new()),
        });
        let mut tasks = Vec::with_capacity(workers + 1);
        tasks.push(tokio::spawn({
            let hc = hc.clone();
            async move { hc.maintainer().await }
        }));
        for _ in 0..workers {
            tasks.push(tokio::spawn({
                let hc = hc.clone();
                async move { hc.worker().await }
            }));
        }
        *hc.tasks.lock().unwrap() = tasks;
        hc
    }

    /// Lets the maintainer start running; called once the pool constructor
    /// has finished wiring.
    pub(crate) fn mark_ready(&self) {
        let _ = self.ready.send(true);
    }

    /// Signals every worker and the maintainer to exit, then waits for them.
    pub(crate) async fn close(&self) {
        let _ = self.done.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
    }

    fn is_closing(&self) -> bool {
        *self.done.borrow()
    }

    /// Every session the checker still tracks, for teardown.
    pub(crate) fn tracked_sessions(&self) -> Vec<Arc<Session>> {
        self.queue.lock().unwrap().snapshot()
    }

    /// Schedules the session's next check `uniform(0.5, 1.5) · interval` from
    /// now. Jitter keeps pings from synchronising across a large pool.
    fn schedule_locked(queue: &mut HealthQueue, interval: Duration, session: &Arc<Session>) {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        session.set_next_check(Instant::now() + interval.mul_f64(jitter));
        if let Some(index) = session.hc_index() {
            queue.reorder(index);
        }
    }

    pub(crate) fn schedule_check(&self, session: &Arc<Session>) {
        let mut queue = self.queue.lock().unwrap();
        Self::schedule_locked(&mut queue, self.interval, session);
    }

    /// Starts tracking a freshly created session.
    pub(crate) fn register(&self, session: &Arc<Session>) {
        let mut queue = self.queue.lock().unwrap();
        Self::schedule_locked(&mut queue, self.interval, session);
        queue.push(session.clone());
    }

    pub(crate) fn unregister(&self, session: &Arc<Session>) {
        let mut queue = self.queue.lock().unwrap();
        if let Some(index) = session.set_hc_index(None) {
            queue.remove(index);
        }
    }

    fn mark_done(&self, session: &Arc<Session>) {
        let _queue = self.queue.lock().unwrap();
        session.set_checking(false);
    }

    /// Pulls the front of the read-idle list for write preparation when the
    /// write-prepared share is below the configured fraction.
    fn next_for_prepare(&self) -> Option<Arc<Session>> {
        let _queue = self.queue.lock().unwrap();
        let mut state = self.pool.state();
        if !state.valid || !self.pool.should_prepare_write(&state) {
            return None;
        }
        let front = state.idle_list.front()?.clone();
        if front.is_checking() {
            return None;
        }
        state.idle_list.pop_front();
        front.set_idle(None);
        front.set_checking(true);
        state.prepare_reqs += 1;
        Some(front)
    }

    /// Pops the heap root for a ping if its deadline elapsed, rescheduling it
    /// in place.
    fn next_for_ping(&self) -> Option<Arc<Session>> {
        let mut queue = self.queue.lock().unwrap();
        let front = queue.peek()?.clone();
        if front.next_check() > Instant::now() && self.pool.is_valid() {
            return None;
        }
        Self::schedule_locked(&mut queue, self.interval, &front);
        if front.is_checking() {
            return None;
        }
        front.set_checking(true);
        Some(front)
    }

    /// Pings a session picked by [`next_for_ping`]; sessions the server
    /// dropped are destroyed. Runs with no locks held.
    async fn check(&self, session: &Arc<Session>) {
        if !self.pool.is_valid() {
            session.destroy(false).await;
            self.mark_done(session);
            return;
        }
        if let Err(err) = session.ping().await {
            if should_drop_session(&err) {
                log::debug!("dropping session {}: {err}", session.id);
                session.destroy(false).await;
            }
        }
        self.mark_done(session);
    }

    async fn worker(self: Arc<Self>) {
        let mut done = self.done.subscribe();
        loop {
            if self.is_closing() {
                return;
            }

            let write_candidate = self.next_for_prepare();
            if let Some(session) = &write_candidate {
                let deadline = Instant::now() + WORKER_PREPARE_TIMEOUT;
                if let Err(err) = session.prepare_for_write(deadline).await {
                    // The next cycle gets another shot.
                    log::warn!("failed to prepare session {} for write: {err}", session.id);
                }
                self.pool.recycle(session);
                self.pool.prepare_done();
                self.mark_done(session);
            }

            match self.next_for_ping() {
                Some(session) => self.check(&session).await,
                None => {
                    if write_candidate.is_none() {
                        let pause = WORKER_PAUSE_CAP.min(self.interval);
                        let nap = pause.mul_f64(rand::thread_rng().gen_range(0.5..1.5));
                        tokio::select! {
                            _ = sleep(nap) => {}
                            _ = done.changed() => {}
                        }
                    }
                }
            }
        }
    }

    /// Resizes the pool once per sample interval toward
    /// `max(min_opened, min(num_opened, max_idle + running max in use))`.
    async fn maintainer(self: Arc<Self>) {
        let mut ready = self.ready.subscribe();
        let mut done = self.done.subscribe();
        if !*ready.borrow_and_update() {
            tokio::select! {
                _ = ready.changed() => {}
                _ = done.changed() => return,
            }
        }

        let mut window: VecDeque<u64> = VecDeque::with_capacity(MAINTAINER_WINDOW);
        loop {
            if self.is_closing() {
                return;
            }

            let (num_opened, in_use) = {
                let state = self.pool.state();
                let idle = (state.idle_list.len() + state.idle_write_list.len()) as u64;
                (state.num_opened, state.num_opened.saturating_sub(idle))
            };
            if window.len() == MAINTAINER_WINDOW {
                window.pop_front();
            }
            window.push_back(in_use);
            let max_in_use = window.iter().copied().max().unwrap_or(0);

            let settings = self.pool.settings();
            let to_keep = settings
                .min_opened
                .max(num_opened.min(settings.max_idle + max_in_use));

            let deadline = Instant::now() + self.sample_interval;
            if to_keep > num_opened {
                self.replenish(deadline, to_keep).await;
            } else {
                self.shrink(deadline, to_keep).await;
            }

            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = done.changed() => return,
            }
        }
    }

    /// Grows the pool toward `target`, bounded by `deadline`. Failures are
    /// logged and the loop moves on.
    async fn replenish(&self, deadline: Instant, target: u64) {
        let mut done = self.done.subscribe();
        loop {
            if Instant::now() >= deadline || self.is_closing() {
                return;
            }
            // Take creation budget under the pool lock.
            let should_prepare = {
                let mut state = self.pool.state();
                if target <= state.num_opened {
                    return;
                }
                state.num_opened += 1;
                self.pool.record_open_sessions(state.num_opened);
                state.create_reqs += 1;
                self.pool.should_prepare_write(&state)
            };
            let create_deadline = Instant::now() + REPLENISH_TIMEOUT;
            let created = tokio::select! {
                result = self.pool.create_session(create_deadline) => result,
                _ = done.changed() => return,
            };
            let session = match created {
                Ok(session) => session,
                Err(err) => {
                    log::warn!("failed to create session: {err}");
                    continue;
                }
            };
            if should_prepare {
                let prepare_deadline = Instant::now() + REPLENISH_TIMEOUT;
                let prepared = tokio::select! {
                    result = session.prepare_for_write(prepare_deadline) => result,
                    _ = done.changed() => {
                        self.pool.recycle(&session);
                        return;
                    }
                };
                if let Err(err) = prepared {
                    self.pool.recycle(&session);
                    log::warn!("failed to prepare session {} for write: {err}", session.id);
                    continue;
                }
            }
            self.pool.recycle(&session);
        }
    }

    /// Scales the pool down toward `target` by expiring idle sessions, read
    /// list first. The pool's expiry guard enforces the floor and skips
    /// checked-out sessions.
    async fn shrink(&self, deadline: Instant, target: u64) {
        loop {
            if Instant::now() >= deadline || self.is_closing() {
                return;
            }
            let victim = {
                let state = self.pool.state();
                if target >= state.num_opened {
                    return;
                }
                state
                    .idle_list
                    .front()
                    .cloned()
                    .or_else(|| state.idle_write_list.front().cloned())
            };
            match victim {
                Some(session) => {
                    if !session.destroy(true).await {
                        return;
                    }
                }
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::sync::Weak;
    use std::time::Duration;

    use async_trait::async_trait;
    use proptest::prelude::*;
    use tonic::metadata::MetadataMap;

    use super::*;
    use crate::connection::SessionService;
    use crate::Error;

    struct NoopService;

    #[async_trait]
    impl SessionService for NoopService {
        async fn create_session(
            &self,
            _database: &str,
            _labels: &HashMap<String, String>,
            _md: &MetadataMap,
        ) -> Result<String, Error> {
            Ok("noop".to_string())
        }

        async fn get_session(&self, _name: &str, _md: &MetadataMap) -> Result<(), Error> {
            Ok(())
        }

        async fn delete_session(&self, _name: &str, _md: &MetadataMap) -> Result<(), Error> {
            Ok(())
        }

        async fn begin_transaction(
            &self,
            _session: &str,
            _md: &MetadataMap,
        ) -> Result<Vec<u8>, Error> {
            Ok(vec![])
        }
    }

    fn session_with_deadline(id: &str, offset_ms: u64) -> Arc<Session> {
        let session = Session::new(
            id.to_string(),
            Arc::new(NoopService),
            Weak::new(),
            MetadataMap::new(),
        );
        session.set_next_check(Instant::now() + Duration::from_millis(offset_ms));
        session
    }

    fn indices_consistent(queue: &HealthQueue) -> bool {
        queue
            .sessions
            .iter()
            .enumerate()
            .all(|(i, s)| s.hc_index() == Some(i))
    }

    #[test]
    fn test_push_orders_by_deadline() {
        let mut queue = HealthQueue::new();
        for (id, offset) in [("a", 300), ("b", 100), ("c", 200)] {
            queue.push(session_with_deadline(id, offset));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.peek().unwrap().id, "b");
        assert!(indices_consistent(&queue));
    }

    #[test]
    fn test_remove_clears_index_and_reheaps() {
        let mut queue = HealthQueue::new();
        let sessions: Vec<_> = [500u64, 100, 400, 200, 300]
            .iter()
            .enumerate()
            .map(|(i, offset)| {
                let s = session_with_deadline(&format!("s{i}"), *offset);
                queue.push(s.clone());
                s
            })
            .collect();

        let target = &sessions[0];
        let index = target.hc_index().unwrap();
        let removed = queue.remove(index).unwrap();
        assert_eq!(removed.id, target.id);
        assert_eq!(target.hc_index(), None);
        assert_eq!(queue.len(), 4);
        assert!(indices_consistent(&queue));
        assert_eq!(queue.peek().unwrap().id, "s1");
    }

    #[test]
    fn test_reorder_after_deadline_change() {
        let mut queue = HealthQueue::new();
        let sessions: Vec<_> = [100u64, 200, 300]
            .iter()
            .enumerate()
            .map(|(i, offset)| {
                let s = session_with_deadline(&format!("s{i}"), *offset);
                queue.push(s.clone());
                s
            })
            .collect();

        sessions[2].set_next_check(Instant::now() + Duration::from_millis(10));
        queue.reorder(sessions[2].hc_index().unwrap());
        assert_eq!(queue.peek().unwrap().id, "s2");
        assert!(indices_consistent(&queue));
    }

    proptest! {
        #[test]
        fn prop_root_always_has_earliest_deadline(offsets in prop::collection::vec(0u64..10_000, 1..64)) {
            let mut queue = HealthQueue::new();
            for (i, offset) in offsets.iter().enumerate() {
                queue.push(session_with_deadline(&format!("s{i}"), *offset));
            }
            prop_assert!(indices_consistent(&queue));

            let mut drained = Vec::new();
            while let Some(front) = queue.peek().cloned() {
                prop_assert!(indices_consistent(&queue));
                queue.remove(front.hc_index().unwrap());
                drained.push(front.next_check());
            }
            let mut sorted = drained.clone();
            sorted.sort();
            prop_assert_eq!(drained, sorted);
        }
    }
}
