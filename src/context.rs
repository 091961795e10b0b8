//! Cancellation and deadlines for blocking operations.
//!
//! A [`Context`] is cheap to clone and is passed to every operation that may
//! wait on the pool or on the server.

use std::future::{pending, Future};
use std::pin::Pin;
use std::time::Duration;

use smallvec::SmallVec;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{Error, Result};

type Signal = watch::Receiver<bool>;

/// Deadline and cancellation signals for one logical operation.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    /// Own signal last, after every ancestor's
    cancel: SmallVec<[Signal; 2]>,
}

/// Fires the cancellation signal of the contexts derived from it.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Context {
    /// A context that never expires and cannot be cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().timeout(timeout)
    }

    /// Tighten the deadline to at most `timeout` from now.
    pub fn timeout(self, timeout: Duration) -> Self {
        self.deadline(Instant::now() + timeout)
    }

    /// Tighten the deadline; a later deadline than the current one is ignored.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    /// Derive a cancellable context. It is also cancelled when any context
    /// it was derived from is.
    pub fn cancellable(mut self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        self.cancel.push(rx);
        (self, CancelHandle { tx })
    }

    pub fn get_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.iter().any(|rx| *rx.borrow())
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail fast if the context is already done.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else if self.is_expired() {
            Err(Error::DeadlineExceeded)
        } else {
            Ok(())
        }
    }

    /// Resolves once any cancel handle fires. Never resolves otherwise.
    pub(crate) async fn cancelled(&self) {
        any_fired(&self.cancel).await
    }

    /// Resolves at the deadline. Never resolves without one.
    pub(crate) async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => pending().await,
        }
    }

    /// Drive `fut` to completion unless the context ends first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(Error::Cancelled),
            _ = self.expired() => Err(Error::DeadlineExceeded),
            res = fut => res,
        }
    }
}

fn any_fired(signals: &[Signal]) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
    Box::pin(async move {
        match signals {
            [] => pending().await,
            [only] => fired(only.clone()).await,
            [first, rest @ ..] => tokio::select! {
                _ = fired(first.clone()) => {}
                _ = any_fired(rest) => {}
            },
        }
    })
}

async fn fired(mut rx: Signal) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        // Sender dropped without cancelling
        if rx.changed().await.is_err() {
            return pending().await;
        }
    }
}
