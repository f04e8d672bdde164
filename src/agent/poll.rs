use std::future::Future;
use std::time::Duration;

/// Verdict of one polling attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep<T, E> {
    Ready(T),
    /// Try again after the fixed delay.
    Pending,
    Failed(E),
}

/// Runs `attempt` until it is ready or failed, sleeping `delay` between tries.
///
/// There is no retry budget: an agent that keeps answering "not yet" is polled
/// until the caller drops the future.
pub async fn poll_with_fixed_delay<T, E, F, Fut>(delay: Duration, mut attempt: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollStep<T, E>>,
{
    loop {
        match attempt().await {
            PollStep::Ready(value) => return Ok(value),
            PollStep::Failed(error) => return Err(error),
            PollStep::Pending => tokio::time::sleep(delay).await,
        }
    }
}
