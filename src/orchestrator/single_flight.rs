//! At-most-one in-flight operation per resource.
//!
//! Timer ticks use [`SingleFlight::try_begin`] and are dropped while a run
//! is in progress. Forced requests use [`SingleFlight::begin_or_join`],
//! which waits for the in-flight run and reports that it was joined
//! instead of issuing a duplicate. Requests that follow a write use
//! [`SingleFlight::begin_after`], which waits its turn but never joins: a
//! run that started before the write cannot have observed it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Mutex, MutexGuard};

/// Guard for one resource.
#[derive(Debug, Default)]
pub struct SingleFlight {
    lock: Mutex<()>,
    busy: AtomicBool,
    generation: AtomicU64,
}

/// Held while a run is in progress; completing it bumps the generation.
#[derive(Debug)]
pub struct FlightGuard<'a> {
    _held: MutexGuard<'a, ()>,
    owner: &'a SingleFlight,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.owner.generation.fetch_add(1, Ordering::AcqRel);
        self.owner.busy.store(false, Ordering::Release);
    }
}

/// What asked for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Scheduled tick; dropped if a run is in flight.
    Timer,
    /// Explicit request; joins an in-flight run instead of duplicating it.
    Forced,
    /// Follows a write; queues behind an in-flight run and then runs fresh.
    AfterWrite,
}

/// Outcome of [`SingleFlight::enter`].
#[derive(Debug)]
pub enum Entry<'a> {
    /// The caller performs the run.
    Leader(FlightGuard<'a>),
    /// Timer tick dropped because a run was in flight.
    Skipped,
    /// Forced request waited for an in-flight run and reuses its result.
    Joined,
}

/// Outcome of [`SingleFlight::begin_or_join`].
#[derive(Debug)]
pub enum Flight<'a> {
    /// No run was in progress; the caller performs the work.
    Leader(FlightGuard<'a>),
    /// A run completed while the caller waited; its result stands.
    Joined,
}

impl SingleFlight {
    /// Create an idle guard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn guard<'a>(&'a self, held: MutexGuard<'a, ()>) -> FlightGuard<'a> {
        self.busy.store(true, Ordering::Release);
        FlightGuard {
            _held: held,
            owner: self,
        }
    }

    /// Start a run only if none is in progress.
    pub fn try_begin(&self) -> Option<FlightGuard<'_>> {
        self.lock.try_lock().ok().map(|held| self.guard(held))
    }

    /// Start a run, or wait for the one in progress and join it.
    pub async fn begin_or_join(&self) -> Flight<'_> {
        let seen = self.generation.load(Ordering::Acquire);
        let held = self.lock.lock().await;
        if self.generation.load(Ordering::Acquire) == seen {
            Flight::Leader(self.guard(held))
        } else {
            Flight::Joined
        }
    }

    /// Wait for any run in progress, then always lead a new one.
    pub async fn begin_after(&self) -> FlightGuard<'_> {
        let held = self.lock.lock().await;
        self.guard(held)
    }

    /// Enter according to what triggered the run.
    pub async fn enter(&self, trigger: Trigger) -> Entry<'_> {
        match trigger {
            Trigger::Timer => self.try_begin().map_or(Entry::Skipped, Entry::Leader),
            Trigger::Forced => match self.begin_or_join().await {
                Flight::Leader(guard) => Entry::Leader(guard),
                Flight::Joined => Entry::Joined,
            },
            Trigger::AfterWrite => Entry::Leader(self.begin_after().await),
        }
    }

    /// Whether a run is currently in progress.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Number of completed runs.
    #[must_use]
    pub fn completed_runs(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}
