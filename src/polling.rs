use crate::error::Error;
use log::info;
use std::future::Future;
use std::time::Duration;

/// How long to wait for an asynchronous report: `max_attempts` polls,
/// each preceded by a sleep of `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

pub enum PollStatus<T> {
    Ready(T),
    Pending,
}

/// Repeatedly sleeps and calls `attempt` until it reports [`PollStatus::Ready`].
///
/// # Arguments
/// * `policy` - Interval and maximum number of polls
/// * `what` - Name of the awaited resource, used in log lines
/// * `attempt` - Called with the 1-based attempt number
///
/// # Returns
/// The ready value, the first error returned by `attempt`, or
/// [`Error::PollTimeout`] once every attempt came back pending.
pub async fn poll_until_ready<T, F, Fut>(
    policy: &PollPolicy,
    what: &str,
    mut attempt: F,
) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PollStatus<T>, Error>>,
{
    for n in 1..=policy.max_attempts {
        tokio::time::sleep(policy.interval).await;

        match attempt(n).await? {
            PollStatus::Ready(value) => return Ok(value),
            PollStatus::Pending => {
                info!("{} is not ready yet ({}/{})", what, n, policy.max_attempts)
            }
        }
    }

    Err(Error::PollTimeout {
        attempts: policy.max_attempts,
    })
}
