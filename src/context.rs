//! Caller-supplied cancellation and deadlines.
//!
//! Every network or I/O call of the store and membership layers runs under a [`Ctx`]. Dropping
//! the returned future also cancels the call; `Ctx` exists so a caller can cancel a whole tree of
//! operations at once and so that deadline expiry surfaces as a typed error instead of a hang.

use std::{fmt, future::Future, time::Duration};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Cancelled,
    DeadlineExceeded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancelled {
    pub op: &'static str,
    pub reason: CancelReason,
}

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            CancelReason::Cancelled => write!(f, "{}: cancelled", self.op),
            CancelReason::DeadlineExceeded => write!(f, "{}: deadline exceeded", self.op),
        }
    }
}

impl std::error::Error for Cancelled {}

#[derive(Debug, Clone, Default)]
pub struct Ctx {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Ctx {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Child context whose deadline is at most `timeout` from now.
    ///
    /// Cancelling the parent cancels the child; cancelling the child leaves the parent alone.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(match self.deadline {
                Some(existing) => existing.min(deadline),
                None => deadline,
            }),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Check the context without running anything.
    pub fn check(&self, op: &'static str) -> Result<(), Cancelled> {
        if self.token.is_cancelled() {
            return Err(Cancelled {
                op,
                reason: CancelReason::Cancelled,
            });
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Cancelled {
                op,
                reason: CancelReason::DeadlineExceeded,
            });
        }
        Ok(())
    }

    /// Drive `fut` until it completes, the context is cancelled, or the deadline passes.
    pub async fn run<T, E, F>(&self, op: &'static str, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<Cancelled>,
    {
        self.check(op)?;
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            res = fut => res,
            _ = self.token.cancelled() => Err(Cancelled { op, reason: CancelReason::Cancelled }.into()),
            _ = deadline => Err(Cancelled { op, reason: CancelReason::DeadlineExceeded }.into()),
        }
    }
}
