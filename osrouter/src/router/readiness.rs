//! Waiting for a freshly created tun interface to come up.
//!
//! BSD tun devices can report the administrative `UP` flag before they are
//! readable. Reads issued too early fail with "host is down", so after
//! `ifconfig <iface> up` we poll the interface status for a bounded time.
//! Running out of attempts is only logged: assigning an address later kicks
//! the device anyway.

use crate::command::{argv, CommandRunner};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Marker `ifconfig` prints for a tun device nobody has opened yet.
pub const DOWN_MARKER: &str = "status: down";

/// How often and how long to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 80;
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(50);

    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Upper bound on the time spent waiting.
    pub fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }

    /// Runs `attempt` until it returns true or attempts run out.
    ///
    /// `attempt` receives the 1-based attempt number. There is no sleep
    /// after the final attempt.
    pub async fn run<F, Fut>(&self, mut attempt: F) -> bool
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = bool>,
    {
        for n in 1..=self.max_attempts {
            if attempt(n).await {
                return true;
            }
            if n < self.max_attempts {
                tokio::time::sleep(self.interval).await;
            }
        }
        false
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_ATTEMPTS, Self::DEFAULT_INTERVAL)
    }
}

/// True when `ifconfig <iface>` output describes a usable interface.
pub fn reports_up(output: &str) -> bool {
    !output.trim().is_empty() && !output.contains(DOWN_MARKER)
}

/// Polls `<ifconfig> <iface>` until the interface reports up.
///
/// Never fails. Returns whether the interface was seen up.
pub async fn wait_until_up<R>(runner: &R, ifconfig: &str, iface: &str, policy: &RetryPolicy) -> bool
where
    R: CommandRunner + ?Sized,
{
    let check = argv(&[ifconfig, iface]);
    let check = &check;
    let up = policy
        .run(move |attempt| {
            async move {
                match runner.run(check).await {
                    Ok(out) => reports_up(&String::from_utf8_lossy(&out)),
                    Err(err) => {
                        debug!(iface, attempt, "status query failed: {err}");
                        false
                    }
                }
            }
        })
        .await;

    if up {
        info!(iface, "interface verified as up");
    } else {
        warn!(
            iface,
            waited = ?policy.budget(),
            "could not verify interface is up, continuing anyway"
        );
    }
    up
}
