use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::monitoring::metrics::{log_metrics_snapshot, METRICS};
use crate::types::MonitoringConfig;

/// Spawn a background task that periodically logs a compact metrics snapshot
/// until `shutdown` flips to `true`.
pub fn spawn_dashboard_task(period: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let mut ticker = interval(period);
    tokio::spawn(async move {
        loop {
            select! {
                _ = ticker.tick() => {
                    log_metrics_snapshot(&METRICS.snapshot());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log_metrics_snapshot(&METRICS.snapshot());
    })
}

fn health_response(request: &str, max_staleness: Duration) -> String {
    let (status, body) = if request.starts_with("GET /health") {
        if METRICS.is_healthy(max_staleness) {
            ("200 OK", "OK")
        } else {
            ("503 Service Unavailable", "STALE")
        }
    } else {
        ("404 Not Found", "NOT FOUND")
    };
    format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
}

async fn answer(mut socket: TcpStream, max_staleness: Duration) -> std::io::Result<()> {
    let mut buf = [0u8; 1024];
    socket.readable().await?;
    let read = socket.try_read(&mut buf).unwrap_or(0);
    let request = String::from_utf8_lossy(&buf[..read]);

    socket
        .write_all(health_response(&request, max_staleness).as_bytes())
        .await?;
    socket.shutdown().await
}

/// Minimal HTTP-style `/health` listener: `OK` while the pipeline has shown
/// activity within `max_staleness`, `STALE` otherwise.
pub async fn serve_health(addr: &str, max_staleness: Duration) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(target: "bot", addr = %addr, "health endpoint listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        debug!(target: "bot", peer = %peer, "health probe");
        if let Err(err) = answer(socket, max_staleness).await {
            warn!(target: "bot", peer = %peer, error = %err, "health probe failed");
        }
    }
}

/// Runs the dashboard logger and, when configured, the health server until
/// `shutdown` flips.
pub async fn run_monitoring(cfg: MonitoringConfig, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let dashboard = spawn_dashboard_task(
        Duration::from_secs(cfg.dashboard_period_secs.max(1)),
        shutdown.clone(),
    );

    let mut shutdown = shutdown;
    let result = match cfg.health_addr.as_deref() {
        Some(addr) => {
            let max_staleness = Duration::from_secs(cfg.max_staleness_secs);
            select! {
                res = serve_health(addr, max_staleness) => res,
                _ = wait_for_shutdown(&mut shutdown) => Ok(()),
            }
        }
        None => {
            wait_for_shutdown(&mut shutdown).await;
            Ok(())
        }
    };

    let _ = dashboard.await;
    result
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_route_reports_status() {
        let ok = health_response("GET /health HTTP/1.1\r\n\r\n", Duration::from_secs(3600));
        assert!(ok.starts_with("HTTP/1.1 200 OK"));
        assert!(ok.ends_with("OK"));

        let missing = health_response("GET /metrics HTTP/1.1\r\n\r\n", Duration::from_secs(3600));
        assert!(missing.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn dashboard_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let handle = spawn_dashboard_task(Duration::from_millis(5), rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
