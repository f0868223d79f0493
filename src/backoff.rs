//! Backoff policies for failed crawl jobs and in-flight fetch attempts.
//!
//! The queue's [`crate::queue::JobStore::fail`] takes a [`Strategy`] to
//! compute how long a retrying job stays invisible, and the fetch engine uses
//! a linear strategy between attempts. Strategies can be modified with a
//! random [`Jitter`] so that a burst of failures does not retry in lockstep.
//!
//! All of the constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! use crawlq::backoff::{BackoffStrategy, Jitter, Strategy};
//! use chrono::TimeDelta;
//!
//! let strategy = BackoffStrategy::linear(TimeDelta::seconds(20))
//!     .with_max(TimeDelta::seconds(60))
//!     .with_jitter(Jitter::Absolute(TimeDelta::seconds(10)));
//!
//! assert!(strategy.backoff(1) >= TimeDelta::seconds(10));
//! assert!(strategy.backoff(1) <= TimeDelta::seconds(30));
//! assert!(strategy.backoff(3) >= TimeDelta::seconds(50));
//! assert!(strategy.backoff(3) <= TimeDelta::seconds(70));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// Type that can be used to implement a backoff policy.
///
/// Given the number of failed attempts so far, returns the [`TimeDelta`] to
/// wait before the work should be retried.
pub trait Strategy {
    fn backoff(&self, attempt: u16) -> TimeDelta;
}

/// Constant backoff: the same delay no matter the attempt.
///
/// Constructed via [`BackoffStrategy::constant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: TimeDelta,
}

impl Strategy for Constant {
    fn backoff(&self, _attempt: u16) -> TimeDelta {
        self.delay
    }
}

/// Linear backoff: `factor * attempt`, optionally capped.
///
/// Constructed via [`BackoffStrategy::linear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linear {
    factor: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Linear {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let mut backoff = self.factor * attempt.into();
        if let Some(max) = self.max {
            backoff = backoff.min(max);
        }
        backoff
    }
}

/// Exponential backoff: `base ^ attempt` seconds, optionally capped.
///
/// Constructed via [`BackoffStrategy::exponential`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let mut seconds = self
            .base
            .num_seconds()
            .checked_pow(attempt.into())
            .unwrap_or(i64::MAX);
        if let Some(max) = self.max {
            seconds = seconds.min(max.num_seconds());
        }
        TimeDelta::seconds(seconds)
    }
}

/// A random jitter applied on top of a computed backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Added jitter in the range `-delta..=delta`.
    Absolute(TimeDelta),
    /// Added jitter as a proportion of the computed backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        };
        if milliseconds == 0 {
            return value;
        }
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value + TimeDelta::milliseconds(jitter)
    }
}

/// A backoff policy: a base [`Strategy`] plus optional jitter and bounds.
///
/// # Example
///
/// ```
/// use crawlq::backoff::{BackoffStrategy, Strategy};
/// use chrono::TimeDelta;
///
/// let strategy =
///     BackoffStrategy::exponential(TimeDelta::seconds(2)).with_max(TimeDelta::seconds(30));
///
/// assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
/// assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
/// assert_eq!(strategy.backoff(3), TimeDelta::seconds(8));
/// assert_eq!(strategy.backoff(5), TimeDelta::seconds(30));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl BackoffStrategy<Constant> {
    /// Creates a [`BackoffStrategy`] that always waits `delay`.
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Linear> {
    /// Creates a [`BackoffStrategy`] growing linearly with each attempt.
    pub const fn linear(factor: TimeDelta) -> Self {
        Self::new(Linear { factor, max: None })
    }

    /// Clamps the maximum value returned by [`Strategy::backoff`].
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl BackoffStrategy<Exponential> {
    /// Creates a [`BackoffStrategy`] growing exponentially with each attempt.
    ///
    /// Setting a maximum via [`BackoffStrategy::with_max`] is advisable.
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Exponential { base, max: None })
    }

    /// Clamps the maximum value returned by [`Strategy::backoff`].
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl<T> BackoffStrategy<T>
where
    T: Strategy,
{
    /// Creates a [`BackoffStrategy`] from a custom [`Strategy`].
    ///
    /// More commonly constructed via [`BackoffStrategy::constant`],
    /// [`BackoffStrategy::linear`], or [`BackoffStrategy::exponential`].
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    /// Adds a random [`Jitter`] to every computed backoff.
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Sets a floor, useful with a large jitter to avoid near-zero delays.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }
}

impl<T> Strategy for BackoffStrategy<T>
where
    T: Strategy,
{
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let mut backoff = self.strategy.backoff(attempt);

        if let Some(jitter) = self.jitter {
            backoff = jitter.apply_jitter(backoff);
        }

        backoff.max(self.min)
    }
}
