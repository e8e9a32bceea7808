//! Port Probe (C1): is a port bound, is a target reachable. Never throws —
//! failure of the probe itself collapses to the conservative boolean (§4.1).

use std::net::{SocketAddr, TcpListener};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

/// Upper bound on how long [`is_bound`] will wait before assuming the port
/// is in use (§4.1).
pub const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on how long [`is_reachable`] will wait (§4.1).
pub const TARGET_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// `true` if `port` is already bound on this host. A bind error is treated
/// as "in use"; a timed-out attempt is treated the same way, since we'd
/// rather lose a race against another binder than double-bind.
pub async fn is_bound(port: u16) -> bool {
    let probe = tokio::task::spawn_blocking(move || {
        TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).is_err()
    });

    match timeout(PORT_PROBE_TIMEOUT, probe).await {
        Ok(Ok(already_bound)) => already_bound,
        Ok(Err(_join_error)) => true,
        Err(_elapsed) => true,
    }
}

/// `true` if a TCP connection to `(host, port)` succeeds within
/// [`TARGET_PROBE_TIMEOUT`]. Any error or timeout is "unreachable".
pub async fn is_reachable(host: &str, port: u16) -> bool {
    matches!(
        timeout(TARGET_PROBE_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_stream))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn free_port_is_not_bound() {
        // Port 0 asks the OS for an ephemeral port; bind it ourselves first
        // to get a concrete, almost-certainly-free number to probe.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!is_bound(port).await);
    }

    #[tokio::test]
    async fn held_port_is_bound() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(is_bound(port).await);
        drop(listener);
    }

    #[tokio::test]
    async fn reachable_target_detected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        assert!(is_reachable("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn unreachable_target_is_false() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!is_reachable("127.0.0.1", port).await);
    }
}
