//! TCP port liberation probes.
//!
//! Child exit does not imply port release: the OS may hold the socket in
//! `TIME_WAIT`, or the child may have spawned descendants that inherited it.
//! Port liberation, not process exit, is the authoritative "stopped" signal
//! for supervision decisions.

use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::{Instant, sleep};

/// Poll cadence for [`wait_until_free`].
pub const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Returns `true` if a listener can currently be bound on `0.0.0.0:port`.
///
/// The probe listener is closed before returning on either outcome.
pub async fn is_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).await.is_ok()
}

/// Polls [`is_free`] every [`PROBE_INTERVAL`] until the port becomes free or
/// `timeout` elapses. Returns whether the port became free within budget.
pub async fn wait_until_free(port: u16, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if is_free(port).await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(PROBE_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_is_free_detects_bound_port() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(!is_free(port).await);
        drop(listener);
        assert!(is_free(port).await);
    }

    #[tokio::test]
    async fn test_wait_until_free_times_out() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(!wait_until_free(port, Duration::from_millis(250)).await);
    }

    #[tokio::test]
    async fn test_wait_until_free_observes_release() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            sleep(Duration::from_millis(200)).await;
            drop(listener);
        });

        assert!(wait_until_free(port, Duration::from_secs(2)).await);
    }
}
