use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, bail};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use crate::config::AppConfig;
use crate::supervisor::{ConnectionState, LinkEvent, LinkState};

/// The network layer beneath the broker session.
pub trait NetworkLink: Send + Sync + 'static {
    /// Brings the link up and returns the node's local address.
    fn connect(&self) -> impl Future<Output = anyhow::Result<IpAddr>> + Send;
    /// Checks that the link is still usable.
    fn probe(&self) -> impl Future<Output = anyhow::Result<IpAddr>> + Send;
}

/// Host network: optionally joins a Wi-Fi network through NetworkManager and
/// treats the broker being reachable as the link being up.
#[derive(Debug, Clone)]
pub struct HostNetwork {
    ssid: Option<String>,
    password: Option<String>,
    broker_host: String,
    broker_port: u16,
    timeout: Duration,
}

impl HostNetwork {
    pub fn new(config: &AppConfig) -> Self {
        HostNetwork {
            ssid: config.network.ssid.clone(),
            password: config.network.password.clone(),
            broker_host: config.mqtt.host.clone(),
            broker_port: config.mqtt.port.unwrap_or(1883),
            timeout: config.network.connect_timeout(),
        }
    }

    async fn join_wifi(&self, ssid: &str) -> anyhow::Result<()> {
        info!("Connecting to WiFi network {}", ssid);
        let mut command = Command::new("nmcli");
        command.args(["device", "wifi", "connect", ssid]);
        if let Some(password) = &self.password {
            command.args(["password", password.as_str()]);
        }

        let status = tokio::time::timeout(self.timeout, command.status())
            .await
            .context("nmcli timed out")?
            .context("failed to run nmcli")?;
        if !status.success() {
            bail!("nmcli exited with {}", status);
        }
        Ok(())
    }
}

impl NetworkLink for HostNetwork {
    async fn connect(&self) -> anyhow::Result<IpAddr> {
        if let Some(ssid) = &self.ssid {
            self.join_wifi(ssid).await?;
        }
        self.probe().await
    }

    async fn probe(&self) -> anyhow::Result<IpAddr> {
        let address = (self.broker_host.as_str(), self.broker_port);
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(address))
            .await
            .with_context(|| format!("timed out reaching {}", self.broker_host))?
            .with_context(|| format!("cannot reach {}", self.broker_host))?;
        Ok(stream.local_addr()?.ip())
    }
}

/// Periodically probes an established link and reports when it is lost.
pub async fn watch_link<N: NetworkLink>(
    network: Arc<N>,
    mut connection: watch::Receiver<ConnectionState>,
    events: mpsc::Sender<LinkEvent>,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        if connection.borrow_and_update().network != LinkState::Up {
            continue;
        }

        match network.probe().await {
            Ok(ip) => debug!("Network link healthy ({})", ip),
            Err(err) => {
                warn!("Network probe failed: {:#}", err);
                if events.send(LinkEvent::NetworkLost).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    use super::*;

    pub(crate) const LOCAL_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));

    /// Network whose connect attempts fail until `failures` runs out.
    #[derive(Default)]
    pub(crate) struct FlakyNetwork {
        pub failures: Mutex<u32>,
        pub attempts: Mutex<u32>,
        pub reachable: Mutex<bool>,
    }

    impl FlakyNetwork {
        pub(crate) fn failing(failures: u32) -> Self {
            FlakyNetwork {
                failures: Mutex::new(failures),
                attempts: Mutex::new(0),
                reachable: Mutex::new(true),
            }
        }
    }

    impl NetworkLink for FlakyNetwork {
        async fn connect(&self) -> anyhow::Result<IpAddr> {
            *self.attempts.lock().unwrap() += 1;
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                bail!("association failed");
            }
            Ok(LOCAL_IP)
        }

        async fn probe(&self) -> anyhow::Result<IpAddr> {
            if *self.reachable.lock().unwrap() {
                Ok(LOCAL_IP)
            } else {
                bail!("unreachable")
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_link_reports_loss_only_when_up() {
        let network = Arc::new(FlakyNetwork::failing(0));
        *network.reachable.lock().unwrap() = false;
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());
        let (events_tx, mut events_rx) = mpsc::channel(4);

        tokio::spawn(watch_link(
            network.clone(),
            state_rx,
            events_tx,
            Duration::from_secs(30),
        ));

        tokio::time::sleep(Duration::from_secs(65)).await;
        assert!(events_rx.try_recv().is_err());

        state_tx.send_replace(ConnectionState {
            network: LinkState::Up,
            ..Default::default()
        });
        assert_eq!(events_rx.recv().await, Some(LinkEvent::NetworkLost));
    }

    #[tokio::test]
    async fn test_host_probe_reports_local_address() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config: AppConfig = toml::de::from_str(&format!(
            r#"
            [node]
            hostname = "node"
            room = "lab"

            [mqtt]
            host = "127.0.0.1"
            port = {port}
        "#
        ))
        .unwrap();

        let network = HostNetwork::new(&config);
        let ip = network.connect().await.unwrap();
        assert!(ip.is_loopback());
    }
}
