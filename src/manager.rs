use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::link::NetworkLink;
use crate::messages::Availability;
use crate::mqtt::{SessionCommand, Uplink};
use crate::supervisor::{Action, ConnectionState, Layer, LinkEvent, RetryPolicy, Supervisor};

/// Owns the connectivity supervisor and carries out its decisions: link
/// attempts, retry timers, session commands and restart escalation. All
/// link events funnel through one channel, so transitions never interleave.
pub struct Manager<N, U> {
    supervisor: Supervisor,
    network: Arc<N>,
    uplink: U,
    session: mpsc::Sender<SessionCommand>,
    events_tx: mpsc::Sender<LinkEvent>,
    events_rx: mpsc::Receiver<LinkEvent>,
    state: watch::Sender<ConnectionState>,
    retry_delay: Duration,
    network_timer: Option<JoinHandle<()>>,
    session_timer: Option<JoinHandle<()>>,
}

impl<N: NetworkLink, U: Uplink> Manager<N, U> {
    pub fn new(
        network: Arc<N>,
        uplink: U,
        session: mpsc::Sender<SessionCommand>,
        policy: RetryPolicy,
        retry_delay: Duration,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(32);
        let (state, _) = watch::channel(ConnectionState::default());

        Manager {
            supervisor: Supervisor::new(policy),
            network,
            uplink,
            session,
            events_tx,
            events_rx,
            state,
            retry_delay,
            network_timer: None,
            session_timer: None,
        }
    }

    pub fn events(&self) -> mpsc::Sender<LinkEvent> {
        self.events_tx.clone()
    }

    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Runs until the supervisor asks for a restart.
    pub async fn run_loop(mut self) -> anyhow::Result<()> {
        self.dispatch(LinkEvent::NetworkRequested)?;

        while let Some(event) = self.events_rx.recv().await {
            self.dispatch(event)?;
        }

        warn!("Link event channel closed");
        Ok(())
    }

    fn dispatch(&mut self, event: LinkEvent) -> anyhow::Result<()> {
        let actions = self.supervisor.handle(event);
        self.state.send_replace(self.supervisor.state().clone());

        for action in actions {
            debug!("Executing {:?}", action);
            match action {
                Action::ConnectNetwork => self.connect_network(),
                Action::ConnectSession => self.command_session(SessionCommand::Connect),
                Action::DisconnectSession => self.command_session(SessionCommand::Disconnect),
                Action::ArmRetry(layer) => self.arm(layer),
                Action::CancelRetry(layer) => self.cancel(layer),
                Action::AnnounceOnline => {
                    if let Err(err) = self.uplink.publish_availability(Availability::Connected) {
                        error!("Error sending availability: {:?}", err);
                    }
                }
                Action::Restart => {
                    anyhow::bail!(
                        "restart requested after {} connection attempts",
                        self.supervisor.state().retry_attempts
                    );
                }
            }
        }
        Ok(())
    }

    fn connect_network(&self) {
        let network = self.network.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match network.connect().await {
                Ok(ip) => LinkEvent::NetworkEstablished(ip),
                Err(err) => {
                    warn!("Error connecting network: {:#}", err);
                    LinkEvent::NetworkFailed
                }
            };
            if let Err(err) = events.send(event).await {
                error!("Error reporting network result: {:?}", err);
            }
        });
    }

    fn command_session(&self, command: SessionCommand) {
        if let Err(err) = self.session.try_send(command) {
            error!("Error sending {:?} to session: {:?}", command, err);
        }
    }

    fn arm(&mut self, layer: Layer) {
        let Some(generation) = self.supervisor.timer_generation(layer) else {
            return;
        };
        info!("Retrying {:?} in {:?}", layer, self.retry_delay);
        let events = self.events_tx.clone();
        let delay = self.retry_delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let fired = LinkEvent::RetryTimerFired(layer, generation);
            if let Err(err) = events.send(fired).await {
                debug!("Retry timer outlived the manager: {:?}", err);
            }
        });

        if let Some(previous) = self.timer(layer).replace(handle) {
            previous.abort();
        }
    }

    fn cancel(&mut self, layer: Layer) {
        if let Some(handle) = self.timer(layer).take() {
            debug!("Stopping {:?} retry timer", layer);
            handle.abort();
        }
    }

    fn timer(&mut self, layer: Layer) -> &mut Option<JoinHandle<()>> {
        match layer {
            Layer::Network => &mut self.network_timer,
            Layer::Session => &mut self.session_timer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::tests::{FlakyNetwork, LOCAL_IP};
    use crate::publisher::tests::RecordingUplink;
    use crate::supervisor::LinkState;

    fn manager(
        network: FlakyNetwork,
        policy: RetryPolicy,
    ) -> (
        Manager<FlakyNetwork, RecordingUplink>,
        Arc<FlakyNetwork>,
        RecordingUplink,
        mpsc::Receiver<SessionCommand>,
    ) {
        let network = Arc::new(network);
        let uplink = RecordingUplink::default();
        let (session_tx, session_rx) = mpsc::channel(8);
        let manager = Manager::new(
            network.clone(),
            uplink.clone(),
            session_tx,
            policy,
            Duration::from_secs(2),
        );
        (manager, network, uplink, session_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_network_then_connects_session() {
        let (manager, network, uplink, mut session) =
            manager(FlakyNetwork::failing(3), RetryPolicy::default());
        let events = manager.events();
        let mut connection = manager.connection();
        tokio::spawn(manager.run_loop());

        assert_eq!(session.recv().await, Some(SessionCommand::Connect));
        assert_eq!(*network.attempts.lock().unwrap(), 4);
        assert_eq!(connection.borrow_and_update().local_ip, Some(LOCAL_IP));

        events.send(LinkEvent::SessionEstablished).await.unwrap();
        connection
            .wait_for(|state| state.session == LinkState::Up)
            .await
            .unwrap();
        assert_eq!(connection.borrow().retry_attempts, 0);
        assert_eq!(
            *uplink.availability.lock().unwrap(),
            vec![Availability::Connected]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_end_the_loop() {
        let (manager, network, _uplink, _session) =
            manager(FlakyNetwork::failing(u32::MAX), RetryPolicy::default());

        let started = tokio::time::Instant::now();
        let result = manager.run_loop().await;
        assert!(result.is_err());
        assert_eq!(*network.attempts.lock().unwrap(), 11);
        assert!(started.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_retry_after_loss() {
        let (manager, _network, _uplink, mut session) =
            manager(FlakyNetwork::failing(0), RetryPolicy::default());
        let events = manager.events();
        let mut connection = manager.connection();
        tokio::spawn(manager.run_loop());

        assert_eq!(session.recv().await, Some(SessionCommand::Connect));
        events.send(LinkEvent::SessionEstablished).await.unwrap();
        events.send(LinkEvent::SessionLost).await.unwrap();

        let started = tokio::time::Instant::now();
        assert_eq!(session.recv().await, Some(SessionCommand::Connect));
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(connection.borrow_and_update().retry_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_disconnects_without_retry() {
        let (manager, _network, _uplink, mut session) =
            manager(FlakyNetwork::failing(0), RetryPolicy::default());
        let events = manager.events();
        let mut connection = manager.connection();
        tokio::spawn(manager.run_loop());

        assert_eq!(session.recv().await, Some(SessionCommand::Connect));
        events.send(LinkEvent::SessionEstablished).await.unwrap();
        events.send(LinkEvent::UpdateStarted).await.unwrap();
        assert_eq!(session.recv().await, Some(SessionCommand::Disconnect));
        events.send(LinkEvent::SessionLost).await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(session.try_recv().is_err());
        let state = connection.borrow_and_update().clone();
        assert!(state.update_in_progress);
        assert_eq!(state.retry_attempts, 0);

        events.send(LinkEvent::UpdateFinished).await.unwrap();
        assert_eq!(session.recv().await, Some(SessionCommand::Connect));
    }
}
