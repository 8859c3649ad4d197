//! Readiness gate - wait for the engine's local proxy port
//!
//! The system proxy is only switched on once sing-box actually listens on
//! the mixed inbound. The gate dials the port until it opens, while
//! watching for the child dying first or the deadline expiring.

use super::{VpnError, VpnResult};
use log::debug;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Delay between connect attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Per-attempt connect timeout.
const DIAL_TIMEOUT: Duration = Duration::from_millis(400);

/// Observation of the child (and of a preempting disconnect) while the
/// gate polls. Implemented by the supervisor; stubbed in tests.
pub trait ChildWatch: Sync {
    /// `Some(stderr tail)` once the child has exited.
    fn exited(&self) -> Option<String>;

    /// True when a disconnect preempted the in-flight connect.
    fn cancelled(&self) -> bool {
        false
    }
}

/// Wait until `host:port` accepts a TCP connection.
///
/// Resolves to `Ok` on the first successful dial, `ChildExitedEarly` with
/// the collected stderr if the watch reports the child gone first, and
/// `ReadinessDeadline` when the deadline passes.
pub async fn await_proxy_port(
    host: &str,
    port: u16,
    deadline: Duration,
    watch: &dyn ChildWatch,
) -> VpnResult<()> {
    let addr = format!("{host}:{port}");
    let end = Instant::now() + deadline;

    loop {
        if watch.cancelled() {
            return Err(VpnError::ConnectAborted);
        }
        if let Some(stderr) = watch.exited() {
            return Err(VpnError::ChildExitedEarly(stderr));
        }

        match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => {
                debug!("proxy port {addr} is up");
                return Ok(());
            }
            Ok(Err(_)) | Err(_) => {}
        }

        if Instant::now() >= end {
            return Err(VpnError::ReadinessDeadline {
                addr,
                secs: deadline.as_secs(),
            });
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Idle;
    impl ChildWatch for Idle {
        fn exited(&self) -> Option<String> {
            None
        }
    }

    struct Exited(&'static str);
    impl ChildWatch for Exited {
        fn exited(&self) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    struct Cancelled(AtomicBool);
    impl ChildWatch for Cancelled {
        fn exited(&self) -> Option<String> {
            None
        }
        fn cancelled(&self) -> bool {
            self.0.load(Ordering::Relaxed)
        }
    }

    #[tokio::test]
    async fn test_ready_when_port_open() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let result =
            await_proxy_port("127.0.0.1", port, Duration::from_secs(5), &Idle).await;
        assert!(result.is_ok());
        drop(listener);
    }

    #[tokio::test]
    async fn test_deadline_when_port_closed() {
        // Reserve a port, then close it so nothing is listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result =
            await_proxy_port("127.0.0.1", port, Duration::from_millis(100), &Idle).await;
        assert!(matches!(result, Err(VpnError::ReadinessDeadline { .. })));
    }

    #[tokio::test]
    async fn test_child_exit_surfaces_stderr() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = await_proxy_port(
            "127.0.0.1",
            port,
            Duration::from_secs(5),
            &Exited("port already in use"),
        )
        .await;
        match result {
            Err(VpnError::ChildExitedEarly(stderr)) => {
                assert!(stderr.contains("port already in use"))
            }
            other => panic!("expected ChildExitedEarly, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_preempts() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let watch = Cancelled(AtomicBool::new(true));
        let result =
            await_proxy_port("127.0.0.1", port, Duration::from_secs(5), &watch).await;
        assert!(matches!(result, Err(VpnError::ConnectAborted)));
    }
}
