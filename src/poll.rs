//! Generic "wait until a remote resource reaches a state" primitive.
//!
//! Cloud-side transitions are slow (minutes-scale) and cheap to query, so the
//! poller sleeps a fixed interval between attempts and applies no backoff.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::error::Ec2Error;

/// Outcome of a single remote state query.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Observation {
    /// The resource exists and reports the contained state discriminator.
    State(String),
    /// The resource was not found. Immediately after creation this is normal
    /// eventual-consistency lag and is retried indefinitely; once the
    /// resource has been observed, a missing result is surfaced instead.
    Missing,
}

/// Repeatedly invokes `observe` until it reports `desired`.
///
/// Cancellation is checked before every query. A `timeout`, when supplied,
/// bounds the whole wait and produces [`Ec2Error::Timeout`], which is distinct
/// from [`Ec2Error::Cancelled`] so callers can apply different recovery.
///
/// # Errors
///
/// Returns [`Ec2Error::Cancelled`] when the token is cancelled,
/// [`Ec2Error::Timeout`] when the deadline elapses first,
/// [`Ec2Error::Vanished`] when a previously seen resource disappears, and any
/// error produced by `observe` itself.
pub async fn poll_until<F, Fut>(
    action: &str,
    mut observe: F,
    desired: &str,
    cancel: &CancellationToken,
    interval: Duration,
    timeout: Option<Duration>,
) -> Result<(), Ec2Error>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<Observation, Ec2Error>> + Send,
{
    let deadline = timeout.map(|limit| Instant::now() + limit);
    let mut seen = false;

    loop {
        if cancel.is_cancelled() {
            return Err(Ec2Error::Cancelled {
                action: action.to_owned(),
            });
        }
        if let Some(limit) = deadline
            && Instant::now() > limit
        {
            return Err(Ec2Error::Timeout {
                action: action.to_owned(),
            });
        }

        match observe().await? {
            Observation::State(state) => {
                if state == desired {
                    return Ok(());
                }
                seen = true;
            }
            Observation::Missing if seen => {
                return Err(Ec2Error::Vanished {
                    action: action.to_owned(),
                });
            }
            Observation::Missing => {}
        }

        tokio::select! {
            () = cancel.cancelled() => {
                return Err(Ec2Error::Cancelled {
                    action: action.to_owned(),
                });
            }
            () = sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn scripted(states: Vec<Observation>) -> (Arc<AtomicUsize>, impl FnMut() -> ScriptedFuture) {
        let queries = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&queries);
        let observe = move || {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            let observation = states
                .get(index)
                .cloned()
                .unwrap_or_else(|| states.last().cloned().expect("non-empty script"));
            Box::pin(async move { Ok(observation) }) as ScriptedFuture
        };
        (queries, observe)
    }

    type ScriptedFuture =
        std::pin::Pin<Box<dyn Future<Output = Result<Observation, Ec2Error>> + Send>>;

    #[tokio::test]
    async fn completes_on_third_query_for_pending_pending_running() {
        let (queries, observe) = scripted(vec![
            Observation::State(String::from("pending")),
            Observation::State(String::from("pending")),
            Observation::State(String::from("running")),
        ]);
        let cancel = CancellationToken::new();
        poll_until(
            "instance running",
            observe,
            "running",
            &cancel,
            Duration::from_millis(1),
            None,
        )
        .await
        .expect("should reach running");
        assert_eq!(queries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fails_with_timeout_when_state_never_reached() {
        let (_queries, observe) = scripted(vec![Observation::State(String::from("pending"))]);
        let cancel = CancellationToken::new();
        let err = poll_until(
            "instance running",
            observe,
            "running",
            &cancel,
            Duration::from_millis(1),
            Some(Duration::from_millis(10)),
        )
        .await
        .expect_err("should time out");
        assert!(matches!(err, Ec2Error::Timeout { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn cancellation_before_second_query_never_issues_it() {
        let queries = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&queries);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let observe = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            trigger.cancel();
            Box::pin(async move { Ok(Observation::State(String::from("pending"))) })
                as ScriptedFuture
        };
        let err = poll_until(
            "instance running",
            observe,
            "running",
            &cancel,
            Duration::from_millis(1),
            None,
        )
        .await
        .expect_err("should be cancelled");
        assert!(matches!(err, Ec2Error::Cancelled { .. }), "got {err:?}");
        assert_eq!(queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_is_retried_until_first_sighting() {
        let (queries, observe) = scripted(vec![
            Observation::Missing,
            Observation::Missing,
            Observation::State(String::from("available")),
        ]);
        let cancel = CancellationToken::new();
        poll_until(
            "volume available",
            observe,
            "available",
            &cancel,
            Duration::from_millis(1),
            None,
        )
        .await
        .expect("eventual consistency lag should be retried");
        assert_eq!(queries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn missing_after_sighting_is_surfaced() {
        let (_queries, observe) = scripted(vec![
            Observation::State(String::from("pending")),
            Observation::Missing,
        ]);
        let cancel = CancellationToken::new();
        let err = poll_until(
            "instance running",
            observe,
            "running",
            &cancel,
            Duration::from_millis(1),
            None,
        )
        .await
        .expect_err("vanished resource should be surfaced");
        assert!(matches!(err, Ec2Error::Vanished { .. }), "got {err:?}");
    }
}
