use failsafe::{backoff, failure_policy, Config, StateMachine};
use std::time::Duration;

/// Circuit breaker guarding one HTTP collaborator.
pub type CollaboratorBreaker =
    StateMachine<failure_policy::ConsecutiveFailures<backoff::Exponential>, ()>;

/// Consecutive failures before a crawl or scrape provider is cut off.
const FAILURE_THRESHOLD: u32 = 5;

/// Breaker for crawl and scrape calls.
///
/// Opens after [`FAILURE_THRESHOLD`] consecutive failures and probes again
/// after an exponential wait of 10s growing to 60s. While open, calls fail
/// fast with `failsafe::Error::Rejected`, which the clients flatten into
/// `ExternalApiError` so retry policies treat it as transient.
pub fn create_collaborator_circuit_breaker() -> CollaboratorBreaker {
    let wait = backoff::exponential(Duration::from_secs(10), Duration::from_secs(60));
    let failure_policy = failure_policy::consecutive_failures(FAILURE_THRESHOLD, wait);

    Config::new().failure_policy(failure_policy).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use failsafe::Error;

    #[test]
    fn test_circuit_breaker_opens_after_failures() {
        use failsafe::CircuitBreaker;

        let cb = create_collaborator_circuit_breaker();

        for _ in 0..FAILURE_THRESHOLD {
            let result: Result<(), Error<&str>> = cb.call(|| Err::<(), &str>("scrape 503"));
            assert!(result.is_err());
        }

        let result: Result<(), Error<&str>> = cb.call(|| Ok::<(), &str>(()));
        assert!(matches!(result, Err(Error::Rejected)));
    }

    #[tokio::test]
    async fn async_calls_pass_through_when_closed() {
        use failsafe::futures::CircuitBreaker;

        let cb = create_collaborator_circuit_breaker();
        let result = cb.call(async { Ok::<u16, &str>(200) }).await;
        assert!(matches!(result, Ok(200)));
    }
}
