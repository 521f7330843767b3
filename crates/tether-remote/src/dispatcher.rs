use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use hashbrown::HashMap;

use tracing::{debug, error, warn};

use crate::{lock, panic_message};

/// Default time an idle worker waits for new work before exiting.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3);

/// The outcome of a work item.
pub type WorkResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type Work = Box<dyn FnOnce() -> WorkResult + Send>;

/// The owner of a work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    /// The network object, receiving the notifications of a link.
    Network,
    /// A device object, identified by its id.
    Object(u64),
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network => f.write_str("network"),
            Self::Object(id) => write!(f, "object {id}"),
        }
    }
}

struct WorkItem {
    work: Work,
    location: &'static Location<'static>,
}

struct OwnerQueue {
    items: VecDeque<WorkItem>,
    live: bool,
    wake: Arc<Condvar>,
}

impl OwnerQueue {
    fn new() -> Self {
        Self {
            items: VecDeque::new(),
            live: false,
            wake: Arc::new(Condvar::new()),
        }
    }
}

struct State {
    owners: HashMap<Owner, OwnerQueue>,
    closing: bool,
}

struct Inner {
    state: Mutex<State>,
    idle_timeout: Duration,
    workers_started: AtomicU64,
}

/// Runs work items in order, with at most one item running at a time for
/// each [`Owner`].
///
/// Every owner has its own first-in first-out queue, drained by a worker
/// thread started when work arrives. A worker that stays idle for the idle
/// timeout exits and frees its queue, so only the owners with recent work
/// hold a thread.
///
/// Cloning a [`Dispatcher`] returns a handle to the same instance.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("idle_timeout", &self.inner.idle_timeout)
            .field("live_workers", &self.live_workers())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a [`Dispatcher`] with the default idle timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_idle_timeout(DEFAULT_IDLE_TIMEOUT)
    }

    /// Creates a [`Dispatcher`] whose workers exit after being idle for
    /// `idle_timeout`.
    #[must_use]
    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    owners: HashMap::new(),
                    closing: false,
                }),
                idle_timeout,
                workers_started: AtomicU64::new(0),
            }),
        }
    }

    /// Appends a work item to the queue of an owner.
    ///
    /// The item runs after all the items previously enqueued for the same
    /// owner. Errors and panics raised by the item are logged along with the
    /// location of this call.
    ///
    /// Returns `false` when the dispatcher has been shut down and the item
    /// has been dropped.
    #[track_caller]
    pub fn enqueue<F>(&self, owner: Owner, work: F) -> bool
    where
        F: FnOnce() -> WorkResult + Send + 'static,
    {
        let location = Location::caller();

        let mut state = lock(&self.inner.state);
        if state.closing {
            warn!("Dropping work for {owner} enqueued at {location}: dispatcher shut down");
            return false;
        }

        let queue = state.owners.entry(owner).or_insert_with(OwnerQueue::new);
        queue.items.push_back(WorkItem {
            work: Box::new(work),
            location,
        });

        if queue.live {
            queue.wake.notify_one();
        } else {
            start_worker(&self.inner, owner, queue);
        }
        true
    }

    /// Whether a worker thread is currently running for an owner.
    #[must_use]
    pub fn is_worker_alive(&self, owner: Owner) -> bool {
        lock(&self.inner.state)
            .owners
            .get(&owner)
            .is_some_and(|queue| queue.live)
    }

    /// Returns the number of running worker threads.
    #[must_use]
    pub fn live_workers(&self) -> usize {
        lock(&self.inner.state)
            .owners
            .values()
            .filter(|queue| queue.live)
            .count()
    }

    /// Returns the number of worker threads started so far.
    #[must_use]
    pub fn workers_started(&self) -> u64 {
        self.inner.workers_started.load(Ordering::Relaxed)
    }

    /// Returns the number of work items waiting in the queue of an owner.
    #[must_use]
    pub fn pending(&self, owner: Owner) -> usize {
        lock(&self.inner.state)
            .owners
            .get(&owner)
            .map_or(0, |queue| queue.items.len())
    }

    /// Shuts the dispatcher down.
    ///
    /// New work items are rejected, while running workers drain their
    /// queues and exit.
    pub fn shutdown(&self) {
        let mut state = lock(&self.inner.state);
        if state.closing {
            return;
        }
        state.closing = true;
        for queue in state.owners.values() {
            queue.wake.notify_all();
        }
        debug!("Dispatcher shut down");
    }
}

fn start_worker(inner: &Arc<Inner>, owner: Owner, queue: &mut OwnerQueue) {
    let worker = Arc::clone(inner);
    match thread::Builder::new()
        .name(format!("dispatch-{owner}"))
        .spawn(move || run_worker(&worker, owner))
    {
        Ok(_) => {
            queue.live = true;
            let _ = inner.workers_started.fetch_add(1, Ordering::Relaxed);
            debug!("Started worker for {owner}");
        }
        Err(e) => error!("Impossible to start the worker for {owner}: {e}"),
    }
}

// Starts the workers of the object owners with pending items and no thread.
fn start_stalled_workers(inner: &Arc<Inner>, state: &mut State) {
    for (owner, queue) in &mut state.owners {
        if !queue.live && !queue.items.is_empty() {
            warn!("Found pending work for {owner} without a worker");
            start_worker(inner, *owner, queue);
        }
    }
}

fn run_worker(inner: &Arc<Inner>, owner: Owner) {
    let mut state = lock(&inner.state);
    loop {
        let next = match state.owners.get_mut(&owner) {
            Some(queue) => queue.items.pop_front(),
            None => return,
        };

        if let Some(item) = next {
            drop(state);
            execute(owner, item);
            state = lock(&inner.state);
            continue;
        }

        if owner == Owner::Network {
            start_stalled_workers(inner, &mut state);
        }

        if state.closing {
            break;
        }

        let Some(wake) = state.owners.get(&owner).map(|queue| Arc::clone(&queue.wake)) else {
            return;
        };
        let (guard, timeout) = wake
            .wait_timeout_while(state, inner.idle_timeout, |state| {
                !state.closing
                    && state
                        .owners
                        .get(&owner)
                        .is_some_and(|queue| queue.items.is_empty())
            })
            .unwrap_or_else(PoisonError::into_inner);
        state = guard;

        if timeout.timed_out() {
            break;
        }
    }

    retire(&mut state, owner);
}

// Called with an empty queue: removes the owner entry.
fn retire(state: &mut MutexGuard<'_, State>, owner: Owner) {
    let _ = state.owners.remove(&owner);
    debug!("Worker for {owner} exited");
}

fn execute(owner: Owner, item: WorkItem) {
    let WorkItem { work, location } = item;
    match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Work for {owner} enqueued at {location} failed: {e}"),
        Err(panic) => error!(
            "Work for {owner} enqueued at {location} panicked: {}",
            panic_message(panic.as_ref())
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use serial_test::serial;

    use super::{Dispatcher, Owner};

    fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn fifo_order_per_owner() {
        let dispatcher = Dispatcher::with_idle_timeout(Duration::from_millis(200));
        let order = Arc::new(Mutex::new(Vec::new()));

        for index in 0..100 {
            let order = Arc::clone(&order);
            assert!(dispatcher.enqueue(Owner::Object(1), move || {
                order.lock().unwrap().push(index);
                Ok(())
            }));
        }

        assert!(wait_until(Duration::from_secs(5), || order.lock().unwrap().len() == 100));
        assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn items_of_an_owner_never_overlap() {
        const PRODUCERS: usize = 4;
        const ITEMS: usize = 50;

        let dispatcher = Dispatcher::with_idle_timeout(Duration::from_millis(200));
        let running = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let records = Arc::new(Mutex::new(Vec::new()));
        let barrier = Arc::new(Barrier::new(PRODUCERS));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let dispatcher = dispatcher.clone();
                let running = Arc::clone(&running);
                let overlaps = Arc::clone(&overlaps);
                let records = Arc::clone(&records);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let _ = barrier.wait();
                    for item in 0..ITEMS {
                        let running = Arc::clone(&running);
                        let overlaps = Arc::clone(&overlaps);
                        let records = Arc::clone(&records);
                        assert!(dispatcher.enqueue(Owner::Object(9), move || {
                            if running.swap(true, Ordering::SeqCst) {
                                let _ = overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            thread::sleep(Duration::from_micros(100));
                            records.lock().unwrap().push((producer, item));
                            running.store(false, Ordering::SeqCst);
                            Ok(())
                        }));
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }

        assert!(wait_until(Duration::from_secs(10), || {
            records.lock().unwrap().len() == PRODUCERS * ITEMS
        }));
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);

        // Items of each producer keep their enqueue order.
        let records = records.lock().unwrap();
        for producer in 0..PRODUCERS {
            let items: Vec<usize> = records
                .iter()
                .filter(|(from, _)| *from == producer)
                .map(|(_, item)| *item)
                .collect();
            assert_eq!(items, (0..ITEMS).collect::<Vec<_>>());
        }
    }

    #[test]
    fn owners_run_independently() {
        let dispatcher = Dispatcher::with_idle_timeout(Duration::from_millis(500));
        let (release_tx, release_rx) = flume::bounded::<()>(1);
        let (done_tx, done_rx) = flume::unbounded();

        // A blocked owner does not delay another one.
        let _ = dispatcher.enqueue(Owner::Object(1), move || {
            release_rx.recv()?;
            Ok(())
        });
        let done = done_tx.clone();
        let _ = dispatcher.enqueue(Owner::Object(2), move || {
            done.send(2)?;
            Ok(())
        });

        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)), Ok(2));
        assert_eq!(dispatcher.live_workers(), 2);

        release_tx.send(()).unwrap();
    }

    #[test]
    #[serial]
    fn idle_worker_exits_and_restarts() {
        let dispatcher = Dispatcher::with_idle_timeout(Duration::from_millis(100));
        let (done_tx, done_rx) = flume::unbounded();

        let done = done_tx.clone();
        let _ = dispatcher.enqueue(Owner::Object(3), move || {
            done.send(1)?;
            Ok(())
        });
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)), Ok(1));
        assert!(dispatcher.is_worker_alive(Owner::Object(3)));

        assert!(wait_until(Duration::from_secs(2), || {
            !dispatcher.is_worker_alive(Owner::Object(3))
        }));
        assert_eq!(dispatcher.live_workers(), 0);
        assert_eq!(dispatcher.pending(Owner::Object(3)), 0);
        assert_eq!(dispatcher.workers_started(), 1);

        // The next item starts a fresh worker.
        let _ = dispatcher.enqueue(Owner::Object(3), move || {
            done_tx.send(2)?;
            Ok(())
        });
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)), Ok(2));
        assert_eq!(dispatcher.workers_started(), 2);
    }

    #[test]
    fn failures_do_not_stop_the_worker() {
        let dispatcher = Dispatcher::with_idle_timeout(Duration::from_millis(200));
        let (done_tx, done_rx) = flume::unbounded();

        let _ = dispatcher.enqueue(Owner::Network, || Err("broken notification".into()));
        let _ = dispatcher.enqueue(Owner::Network, || panic!("broken handler"));
        let _ = dispatcher.enqueue(Owner::Network, move || {
            done_tx.send(())?;
            Ok(())
        });

        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)), Ok(()));
        assert_eq!(dispatcher.workers_started(), 1);
    }

    #[test]
    fn shutdown_drains_and_rejects() {
        let dispatcher = Dispatcher::with_idle_timeout(Duration::from_secs(10));
        let (done_tx, done_rx) = flume::unbounded();

        for index in 0..5 {
            let done = done_tx.clone();
            let _ = dispatcher.enqueue(Owner::Object(4), move || {
                thread::sleep(Duration::from_millis(5));
                done.send(index)?;
                Ok(())
            });
        }
        dispatcher.shutdown();

        assert!(!dispatcher.enqueue(Owner::Object(4), || Ok(())));

        let drained: Vec<i32> = (0..5)
            .map(|_| done_rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);

        assert!(wait_until(Duration::from_secs(2), || dispatcher.live_workers() == 0));
    }
}
