//! Drive Member Control to a voting membership, retrying with jittered exponential backoff.
//!
//! Member Control itself never retries; this loop is the caller-side scheduler the `member join`
//! command runs.

use std::time::Duration;

use rand::{RngCore, SeedableRng, rngs::StdRng};
use tracing::{debug, info, warn};

use crate::{
    context::Ctx,
    member::{MemberControl, MemberError, MemberState},
};

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
    pub jitter_max_divisor: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter_max_divisor: 4,
        }
    }
}

#[derive(Debug)]
struct BackoffState<R> {
    cfg: BackoffConfig,
    attempt: u32,
    rng: R,
}

impl<R: RngCore> BackoffState<R> {
    fn new(cfg: BackoffConfig, rng: R) -> Self {
        Self {
            cfg,
            attempt: 0,
            rng,
        }
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_delay(&mut self) -> Duration {
        let base = base_delay_for_attempt(self.cfg.base, self.cfg.cap, self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let base_ms = saturating_millis(base);
        let jitter_max_ms = if self.cfg.jitter_max_divisor == 0 {
            0
        } else {
            base_ms / u64::from(self.cfg.jitter_max_divisor)
        };
        let jitter_ms = if jitter_max_ms == 0 {
            0
        } else {
            self.rng.next_u64() % (jitter_max_ms + 1)
        };

        let total_ms = base_ms.saturating_add(jitter_ms);
        std::cmp::min(self.cfg.cap, Duration::from_millis(total_ms))
    }
}

fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn base_delay_for_attempt(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let mut delay = base;
    for _ in 0..attempt {
        delay = match delay.checked_mul(2) {
            Some(v) => v,
            None => return cap,
        };
        if delay >= cap {
            return cap;
        }
    }
    std::cmp::min(delay, cap)
}

#[derive(Debug)]
pub struct JoinOptions<R> {
    /// Overall budget; expiry surfaces as `MemberError::Cancelled`.
    pub timeout: Duration,
    pub backoff: BackoffConfig,
    pub rng: R,
}

impl JoinOptions<StdRng> {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            backoff: BackoffConfig::default(),
            rng: StdRng::from_entropy(),
        }
    }
}

/// Reconcile until this member is voting.
///
/// Retryable failures are logged and retried; anything else (configuration, cancellation,
/// timeout) is returned. Backoff restarts whenever the member advances a state.
pub async fn join_cluster<R: RngCore>(
    control: &MemberControl,
    ctx: &Ctx,
    options: JoinOptions<R>,
) -> Result<MemberState, MemberError> {
    let ctx = ctx.with_timeout(options.timeout);
    let mut backoff = BackoffState::new(options.backoff, options.rng);
    let mut last_state = None;
    let member = control.identity().name.clone();

    loop {
        match control.reconcile(&ctx).await {
            Ok(state @ MemberState::Voting { .. }) => {
                info!(member = %member, state = ?state, "join: member is voting");
                return Ok(state);
            }
            Ok(state) => {
                if last_state != Some(state) {
                    info!(member = %member, state = ?state, "join: membership advanced");
                    backoff.reset();
                }
                last_state = Some(state);
            }
            Err(err) if err.is_retryable() => {
                warn!(member = %member, error = %err, "join: step failed; will retry");
            }
            Err(err) => return Err(err),
        }

        let delay = backoff.next_delay();
        debug!(
            member = %member,
            delay_ms = saturating_millis(delay),
            "join: backing off"
        );
        ctx.run("member_join", async {
            tokio::time::sleep(delay).await;
            Ok::<_, MemberError>(())
        })
        .await?;
    }
}
