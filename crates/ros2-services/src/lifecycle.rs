// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Start-once / close-once state machine shared by both engines.
//!
//! ```text
//! NotStarted --start--> Started --close--> Closed
//!      |                                     ^
//!      +----------------close----------------+
//! ```
//!
//! `Closed` is terminal. Transition hooks run under the state lock, so a
//! concurrent `start` observes either the fully started engine or the error.

use crate::error::{ServiceError, ServiceResult};
use parking_lot::Mutex;

/// Engine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Started,
    Closed,
}

/// Guarded lifecycle state.
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<LifecycleState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::NotStarted),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn is_started(&self) -> bool {
        self.state() == LifecycleState::Started
    }

    pub fn is_closed(&self) -> bool {
        self.state() == LifecycleState::Closed
    }

    /// Transition `NotStarted -> Started`, running `on_start` first.
    ///
    /// Returns `Ok(true)` when this call started the engine, `Ok(false)` when
    /// it was already started, and [`ServiceError::AlreadyClosed`] after
    /// close. If `on_start` fails the state stays `NotStarted`.
    pub fn start_with<F>(&self, on_start: F) -> ServiceResult<bool>
    where
        F: FnOnce() -> ServiceResult<()>,
    {
        let mut state = self.state.lock();
        match *state {
            LifecycleState::Started => Ok(false),
            LifecycleState::Closed => Err(ServiceError::AlreadyClosed),
            LifecycleState::NotStarted => {
                on_start()?;
                *state = LifecycleState::Started;
                Ok(true)
            }
        }
    }

    /// Transition to `Closed`.
    ///
    /// `on_close` runs only when leaving `Started`. Returns the state the
    /// engine was in; closing twice is a no-op.
    pub fn close_with<F>(&self, on_close: F) -> LifecycleState
    where
        F: FnOnce(),
    {
        let mut state = self.state.lock();
        let previous = *state;
        if previous == LifecycleState::Started {
            on_close();
        }
        *state = LifecycleState::Closed;
        previous
    }

    /// Fail fast unless started.
    pub fn ensure_started(&self) -> ServiceResult<()> {
        match self.state() {
            LifecycleState::Started => Ok(()),
            LifecycleState::NotStarted => Err(ServiceError::NotStarted),
            LifecycleState::Closed => Err(ServiceError::AlreadyClosed),
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn start_is_idempotent() {
        let lifecycle = Lifecycle::new();
        let starts = Cell::new(0);

        assert_eq!(
            lifecycle.start_with(|| {
                starts.set(starts.get() + 1);
                Ok(())
            }),
            Ok(true)
        );
        assert_eq!(
            lifecycle.start_with(|| {
                starts.set(starts.get() + 1);
                Ok(())
            }),
            Ok(false)
        );
        assert_eq!(starts.get(), 1);
        assert!(lifecycle.is_started());
    }

    #[test]
    fn failed_start_stays_not_started() {
        let lifecycle = Lifecycle::new();
        let result = lifecycle.start_with(|| Err(ServiceError::NoRuntime));
        assert_eq!(result, Err(ServiceError::NoRuntime));
        assert_eq!(lifecycle.state(), LifecycleState::NotStarted);
        assert_eq!(lifecycle.ensure_started(), Err(ServiceError::NotStarted));
    }

    #[test]
    fn start_after_close_fails() {
        let lifecycle = Lifecycle::new();
        lifecycle.close_with(|| {});
        assert_eq!(
            lifecycle.start_with(|| Ok(())),
            Err(ServiceError::AlreadyClosed)
        );
        assert_eq!(lifecycle.ensure_started(), Err(ServiceError::AlreadyClosed));
    }

    #[test]
    fn close_runs_teardown_once() {
        let lifecycle = Lifecycle::new();
        let teardowns = Cell::new(0);
        lifecycle.start_with(|| Ok(())).unwrap();

        let previous = lifecycle.close_with(|| teardowns.set(teardowns.get() + 1));
        assert_eq!(previous, LifecycleState::Started);
        let previous = lifecycle.close_with(|| teardowns.set(teardowns.get() + 1));
        assert_eq!(previous, LifecycleState::Closed);

        assert_eq!(teardowns.get(), 1);
        assert!(lifecycle.is_closed());
    }

    #[test]
    fn close_without_start_skips_teardown() {
        let lifecycle = Lifecycle::new();
        let teardowns = Cell::new(0);
        let previous = lifecycle.close_with(|| teardowns.set(teardowns.get() + 1));
        assert_eq!(previous, LifecycleState::NotStarted);
        assert_eq!(teardowns.get(), 0);
        assert!(lifecycle.is_closed());
    }
}
