//! ---
//! shem_section: "01-core-functionality"
//! shem_subsection: "module"
//! shem_type: "source"
//! shem_scope: "code"
//! shem_description: "Watchdog heartbeat towards the host supervisor."
//! shem_version: "v0.1.0"
//! shem_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::net::UnixDatagram;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";
const WATCHDOG_USEC_ENV: &str = "WATCHDOG_USEC";
const HEARTBEAT_MESSAGE: &[u8] = b"WATCHDOG=1";

/// Periodic liveness datagram to the host supervisor's notification socket.
pub struct Heartbeat {
    socket_path: String,
    interval: Duration,
}

impl Heartbeat {
    /// Discover the notification socket and watchdog timeout from the
    /// environment. Errors when the host supervisor does not advertise a
    /// watchdog; the caller treats that as non-fatal.
    pub fn from_env() -> Result<Self> {
        let socket_path = std::env::var(NOTIFY_SOCKET_ENV)
            .ok()
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow!("watchdog not enabled ({NOTIFY_SOCKET_ENV} not set)"))?;

        let usec = std::env::var(WATCHDOG_USEC_ENV)
            .ok()
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow!("watchdog not configured ({WATCHDOG_USEC_ENV} not set)"))?;
        let usec: u64 = usec
            .parse()
            .map_err(|_| anyhow!("invalid {WATCHDOG_USEC_ENV} value: {usec}"))?;

        // Half the advertised timeout leaves slack for scheduling delays.
        Ok(Self {
            socket_path,
            interval: Duration::from_micros(usec / 2),
        })
    }

    /// Send heartbeats until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(interval = ?self.interval, "starting watchdog heartbeat");

        let socket = match UnixDatagram::unbound() {
            Ok(socket) => socket,
            Err(err) => {
                error!(error = %err, "failed to create heartbeat socket");
                return;
            }
        };

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("stopping watchdog heartbeat");
                    return;
                }
                _ = ticker.tick() => {
                    match socket.send_to(HEARTBEAT_MESSAGE, &self.socket_path).await {
                        Ok(_) => debug!("sent watchdog heartbeat"),
                        Err(err) => error!(error = %err, "failed to send heartbeat"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn heartbeat_reaches_notification_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("notify.sock");
        let receiver = UnixDatagram::bind(&socket_path).unwrap();

        let heartbeat = Heartbeat {
            socket_path: socket_path.to_string_lossy().into_owned(),
            interval: Duration::from_millis(10),
        };

        let (shutdown_tx, _) = broadcast::channel(1);
        let task = tokio::spawn(heartbeat.run(shutdown_tx.subscribe()));

        let mut buf = [0u8; 32];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), receiver.recv_from(&mut buf))
            .await
            .expect("heartbeat within a second")
            .unwrap();
        assert_eq!(&buf[..len], HEARTBEAT_MESSAGE);

        let _ = shutdown_tx.send(());
        task.await.unwrap();
    }
}
