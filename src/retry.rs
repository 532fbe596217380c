use std::future::Future;
use std::time::Duration;

use prost::Message;
use rand::Rng;
use tokio::time::{sleep, timeout_at, Instant};

use crate::proto::google::rpc::RetryInfo;
use crate::Error;

/// Trailer key under which the server serializes a `google.rpc.RetryInfo`.
const RETRY_INFO_KEY: &str = "google.rpc.retryinfo-bin";

/// Bounded exponential backoff schedule for retryable RPC failures.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(60),
            multiplier: 1.3,
        }
    }
}

impl Backoff {
    /// Delay for the given attempt, jittered into `[d/2, d)` so concurrent
    /// retries do not line up.
    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        let exp = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = exp.min(self.max.as_secs_f64());
        Duration::from_secs_f64(capped * rand::thread_rng().gen_range(0.5..1.0))
    }
}

/// Reports whether the error is transient at the transport layer.
///
/// Beyond the declared `Unavailable` code, a handful of `Internal` (and, on
/// older transports, `Unknown`) statuses are recognized by message substring.
/// That fragility is a compatibility surface inherited from the server
/// behavior, not something to extend.
pub(crate) fn is_retryable(err: &Error) -> bool {
    let Some(code) = err.code() else {
        return false;
    };
    match code {
        tonic::Code::Unavailable => true,
        tonic::Code::Internal => {
            let msg = err.message();
            msg.contains("transport is closing")
                || msg.contains("stream terminated by RST_STREAM")
                || msg.contains("unexpected EOF")
        }
        tonic::Code::Unknown => err.message().contains("unexpected EOF"),
        _ => false,
    }
}

/// Reports whether the server no longer knows the session, e.g. because it
/// was garbage collected. Such sessions must not go back into the pool.
pub(crate) fn should_drop_session(err: &Error) -> bool {
    err.code() == Some(tonic::Code::NotFound) && err.message().contains("Session not found")
}

/// Server-suggested backoff from the `RetryInfo` trailer, if present.
fn retry_delay(err: &Error) -> Option<Duration> {
    let Error::Status(status) = err else {
        return None;
    };
    let value = status.metadata().get_bin(RETRY_INFO_KEY)?;
    let bytes = value.to_bytes().ok()?;
    let info = RetryInfo::decode(bytes.as_ref()).ok()?;
    Duration::try_from(info.retry_delay?).ok()
}

/// Runs `f` until it succeeds, fails with a non-retryable error, or the
/// deadline elapses.
///
/// Retryable failures back off either by the server-suggested delay or by the
/// default exponential schedule. A fired deadline surfaces as
/// [`Error::Timeout`] carrying the last inner error seen, and is never masked
/// by a retry in progress.
pub(crate) async fn run_retryable<T, F, Fut>(deadline: Option<Instant>, mut f: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let backoff = Backoff::default();
    let mut last: Option<Error> = None;
    let mut attempt: u32 = 0;
    loop {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Error::Timeout {
                last: last.map(Box::new),
            });
        }
        let result = match deadline {
            Some(d) => match timeout_at(d, f()).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(Error::Timeout {
                        last: last.map(Box::new),
                    })
                }
            },
            None => f().await,
        };
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !is_retryable(&err) {
            return Err(err);
        }
        let pause = retry_delay(&err).unwrap_or_else(|| backoff.delay(attempt));
        log::trace!("retryable error, backing off for {pause:?}: {err}");
        last = Some(err);
        match deadline {
            Some(d) => {
                if timeout_at(d, sleep(pause)).await.is_err() {
                    return Err(Error::Timeout {
                        last: last.map(Box::new),
                    });
                }
            }
            None => sleep(pause).await,
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tonic::metadata::MetadataValue;
    use tonic::{Code, Status};

    use super::*;

    fn status_err(code: Code, message: &str) -> Error {
        Error::from(Status::new(code, message))
    }

    #[test]
    fn test_unavailable_is_retryable() {
        assert!(is_retryable(&status_err(Code::Unavailable, "try again")));
    }

    #[test]
    fn test_internal_is_retryable_only_for_known_messages() {
        for msg in [
            "transport is closing",
            "stream terminated by RST_STREAM",
            "unexpected EOF",
        ] {
            assert!(is_retryable(&status_err(Code::Internal, msg)), "{msg}");
        }
        assert!(!is_retryable(&status_err(Code::Internal, "corrupt state")));
    }

    #[test]
    fn test_unknown_code_retries_unexpected_eof_only() {
        assert!(is_retryable(&status_err(Code::Unknown, "unexpected EOF")));
        assert!(!is_retryable(&status_err(Code::Unknown, "who knows")));
    }

    #[test]
    fn test_non_status_errors_are_not_retryable() {
        assert!(!is_retryable(&Error::PoolClosed));
        assert!(!is_retryable(&status_err(Code::PermissionDenied, "no")));
    }

    #[test]
    fn test_should_drop_session() {
        assert!(should_drop_session(&status_err(
            Code::NotFound,
            "Session not found: projects/p/instances/i/databases/d/sessions/s1"
        )));
        assert!(!should_drop_session(&status_err(Code::NotFound, "Database not found")));
        assert!(!should_drop_session(&status_err(Code::Unavailable, "Session not found")));
    }

    #[test]
    fn test_retry_delay_from_trailer() {
        let mut status = Status::new(Code::Unavailable, "busy");
        let info = RetryInfo {
            retry_delay: Some(prost_types::Duration {
                seconds: 1,
                nanos: 500_000_000,
            }),
        };
        status
            .metadata_mut()
            .insert_bin(RETRY_INFO_KEY, MetadataValue::from_bytes(&info.encode_to_vec()));
        assert_eq!(
            retry_delay(&Error::from(status)),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_retry_delay_absent() {
        assert_eq!(retry_delay(&status_err(Code::Unavailable, "busy")), None);
        assert_eq!(retry_delay(&Error::PoolClosed), None);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = Backoff::default();
        let first = backoff.delay(0);
        assert!(first >= Duration::from_millis(50) && first < Duration::from_millis(100));
        let capped = backoff.delay(60);
        assert!(capped >= Duration::from_secs(30) && capped < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retryable_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = run_retryable(None, || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(status_err(Code::Unavailable, "busy"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retryable_stops_on_unretryable() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Error> = run_retryable(None, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(status_err(Code::PermissionDenied, "no")) }
        })
        .await;
        assert!(matches!(result, Err(Error::Status(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retryable_deadline_keeps_last_error() {
        let deadline = Instant::now() + Duration::from_secs(1);
        let result: Result<(), Error> = run_retryable(Some(deadline), || async {
            Err(status_err(Code::Unavailable, "busy"))
        })
        .await;
        match result {
            Err(Error::Timeout { last: Some(inner) }) => {
                assert_eq!(inner.code(), Some(Code::Unavailable));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
