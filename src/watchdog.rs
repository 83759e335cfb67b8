//! This module contains the type definitions necessary to support the
//! monitoring functionality for the generator.
//!
//! # Best-Effort Monitoring
//!
//! Note that the monitoring provided by the watchdog is a best-effort approach.
//! It is polled between exploration steps and before each candidate is run in
//! the sandbox, so a single long-running step cannot be interrupted by it. Concrete execution
//! is bounded separately by the sandbox's own timeout, which terminates the
//! child process.

use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::constant::DEFAULT_WATCHDOG_POLL_LOOP_ITERATIONS;

/// A dynamically dispatched [`Watchdog`] instance, shareable between the
/// worker threads of [`crate::generate_all`].
pub type DynWatchdog = Arc<dyn Watchdog>;

/// The interface to an object that can be polled to see if the generator needs
/// to abort processing.
///
/// The interface is simple, but it can encapsulate arbitrary logic as far as
/// the generator is concerned, allowing the client to implement complex stop
/// logic.
pub trait Watchdog
where
    Self: Debug + Send + Sync,
{
    /// Checks if the generator should halt its analysis.
    #[must_use]
    fn should_stop(&self) -> bool;

    /// Gets the number of loop iterations the generator should wait before
    /// polling the watchdog.
    #[must_use]
    fn poll_every(&self) -> usize;
}

/// An implementation of the [`Watchdog`] trait that does not place any
/// restrictions on the execution of the generator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LazyWatchdog;

impl LazyWatchdog {
    /// Wraps `self` into an [`Arc`].
    #[must_use]
    pub fn in_arc(self) -> DynWatchdog {
        Arc::new(self)
    }
}

impl Watchdog for LazyWatchdog {
    fn should_stop(&self) -> bool {
        false
    }

    fn poll_every(&self) -> usize {
        // Something ridiculously huge so it basically never gets checked.
        1_000_000_000_000
    }
}

/// A watchdog that tells the generator when to stop based on a flag in the
/// form of an atomic boolean.
///
/// By default, it requests that the generator poll for watchdog status every
/// [`DEFAULT_WATCHDOG_POLL_LOOP_ITERATIONS`]. This is configurable by calling
/// [`Self::polling_every`].
#[derive(Clone, Debug)]
pub struct FlagWatchdog {
    /// The flag that should be mutated externally to stop the generator by
    /// this watchdog.
    flag: Arc<AtomicBool>,

    /// The number of loop iterations the generator should wait before polling
    /// the watchdog.
    poll_loop_iterations: usize,
}

impl FlagWatchdog {
    /// Constructs a new `FlagWatchdog` wrapping the provided `flag`.
    #[must_use]
    pub fn new(flag: Arc<AtomicBool>) -> Self {
        let poll_loop_iterations = DEFAULT_WATCHDOG_POLL_LOOP_ITERATIONS;
        Self {
            flag,
            poll_loop_iterations,
        }
    }

    /// Specifies the number of loop iterations that the generator should wait
    /// before polling the watchdog for status.
    #[must_use]
    pub fn polling_every(mut self, iterations: usize) -> Self {
        self.poll_loop_iterations = iterations;
        self
    }

    /// Wraps the watchdog into an [`Arc`].
    #[must_use]
    pub fn in_arc(self) -> DynWatchdog {
        Arc::new(self)
    }
}

impl Watchdog for FlagWatchdog {
    fn should_stop(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    fn poll_every(&self) -> usize {
        self.poll_loop_iterations
    }
}

/// A watchdog that tells the generator to stop once a wall-clock deadline has
/// passed, or earlier if the watchdog it wraps says so.
#[derive(Clone, Debug)]
pub struct DeadlineWatchdog {
    deadline:             Instant,
    inner:                Option<DynWatchdog>,
    poll_loop_iterations: usize,
}

impl DeadlineWatchdog {
    /// Constructs a watchdog that expires `budget` from now.
    #[must_use]
    pub fn new(budget: Duration) -> Self {
        Self::until(Instant::now() + budget)
    }

    /// Constructs a watchdog that expires at `deadline`.
    #[must_use]
    pub fn until(deadline: Instant) -> Self {
        let poll_loop_iterations = DEFAULT_WATCHDOG_POLL_LOOP_ITERATIONS;
        Self {
            deadline,
            inner: None,
            poll_loop_iterations,
        }
    }

    /// Makes the watchdog also stop when `inner` does, polling at least as
    /// often as `inner` asks to be polled.
    #[must_use]
    pub fn wrapping(mut self, inner: DynWatchdog) -> Self {
        self.poll_loop_iterations = self.poll_loop_iterations.min(inner.poll_every());
        self.inner = Some(inner);
        self
    }

    /// Specifies the number of loop iterations that the generator should wait
    /// before polling the watchdog for status.
    #[must_use]
    pub fn polling_every(mut self, iterations: usize) -> Self {
        self.poll_loop_iterations = iterations;
        self
    }

    /// Wraps the watchdog into an [`Arc`].
    #[must_use]
    pub fn in_arc(self) -> DynWatchdog {
        Arc::new(self)
    }
}

impl Watchdog for DeadlineWatchdog {
    fn should_stop(&self) -> bool {
        Instant::now() >= self.deadline || self.inner.as_ref().is_some_and(|w| w.should_stop())
    }

    fn poll_every(&self) -> usize {
        self.poll_loop_iterations
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };

    use crate::watchdog::{DeadlineWatchdog, FlagWatchdog, LazyWatchdog, Watchdog};

    #[test]
    fn lazy_watchdog_never_stops() {
        assert!(!LazyWatchdog.in_arc().should_stop());
    }

    #[test]
    fn flag_watchdog_follows_its_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let watchdog = FlagWatchdog::new(flag.clone()).polling_every(1).in_arc();
        assert!(!watchdog.should_stop());
        flag.store(true, Ordering::Relaxed);
        assert!(watchdog.should_stop());
        assert_eq!(watchdog.poll_every(), 1);
    }

    #[test]
    fn deadline_watchdog_expires() {
        assert!(DeadlineWatchdog::new(Duration::ZERO).should_stop());
        assert!(!DeadlineWatchdog::new(Duration::from_secs(3600)).should_stop());
    }

    #[test]
    fn deadline_watchdog_follows_the_watchdog_it_wraps() {
        let flag = Arc::new(AtomicBool::new(false));
        let inner = FlagWatchdog::new(flag.clone()).polling_every(7).in_arc();
        let watchdog = DeadlineWatchdog::new(Duration::from_secs(3600)).wrapping(inner);
        assert_eq!(watchdog.poll_every(), 7);
        assert!(!watchdog.should_stop());
        flag.store(true, Ordering::Relaxed);
        assert!(watchdog.should_stop());

        let lazy = DeadlineWatchdog::new(Duration::ZERO).wrapping(LazyWatchdog.in_arc());
        assert!(lazy.should_stop());
    }
}
