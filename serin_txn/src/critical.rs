//! Critical-section escalation (Design Notes §9, spec §7 `fatal`).
//!
//! A critical section either completes or the process dies; there is
//! no partial-rollback alternative, because once the WAL view and the
//! on-disk view have been allowed to diverge, only restart + WAL replay
//! can reconcile them (spec §4.3).

use std::fmt::Debug;
use std::future::Future;

/// Run `body` inside a critical section. Any error returned by `body`
/// is logged at `tracing::error!` and then escalates to a process
/// abort — there is no way to return an error from this function.
///
/// Callers are expected to already be holding
/// `checkpoint_start_shared_lock` (the guard type returned by
/// [`crate::wal::CheckpointCoordinator`]) for the duration of `body`;
/// this function only owns the panic-on-error contract. `body` is a
/// future rather than a plain closure because both PREPARE's and
/// FINISH's critical sections insert and flush a WAL record.
pub async fn critical_section<T, E, F>(what: &'static str, body: F) -> T
where
    F: Future<Output = Result<T, E>>,
    E: Debug,
{
    match body.await {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(section = what, error = ?err, "fatal error inside two-phase commit critical section");
            panic!("fatal: {what} failed inside a two-phase commit critical section: {err:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_ok_value_unchanged() {
        let value = critical_section::<_, std::io::Error, _>("test", async { Ok(42) }).await;
        assert_eq!(value, 42);
    }

    #[tokio::test]
    #[should_panic(expected = "fatal: test-section failed")]
    async fn escalates_on_error() {
        critical_section::<(), _, _>("test-section", async {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
        })
        .await;
    }
}
