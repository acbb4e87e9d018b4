//! Two-layer connectivity state machine.
//!
//! The network link must be up before the broker session is attempted. Both
//! layers draw from a single retry budget: every failure at either layer bumps
//! the same counter, and any successful connection resets it. Once the budget
//! is exhausted the node asks to be restarted, unless restarts are suppressed
//! (low-power deployments), in which case it keeps retrying.
//!
//! [`Supervisor::handle`] is a pure transition function; the caller executes
//! the returned [`Action`]s.

use std::net::IpAddr;

use log::{debug, info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LinkState {
    #[default]
    Down,
    Connecting,
    Up,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layer {
    Network,
    Session,
}

/// Snapshot shared read-only with the scan loop.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub network: LinkState,
    pub session: LinkState,
    pub retry_attempts: u32,
    pub update_in_progress: bool,
    pub local_ip: Option<IpAddr>,
}

impl ConnectionState {
    pub fn session_up(&self) -> bool {
        self.session == LinkState::Up
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    NetworkRequested,
    NetworkEstablished(IpAddr),
    NetworkFailed,
    NetworkLost,
    SessionEstablished,
    SessionLost,
    /// Carries the generation handed out when the timer was armed.
    RetryTimerFired(Layer, u64),
    UpdateStarted,
    UpdateFinished,
    UpdateFailed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    ConnectNetwork,
    ConnectSession,
    DisconnectSession,
    ArmRetry(Layer),
    CancelRetry(Layer),
    AnnounceOnline,
    Restart,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub suppress_restart: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 10,
            suppress_restart: false,
        }
    }
}

pub struct Supervisor {
    state: ConnectionState,
    policy: RetryPolicy,
    /// Generation of the pending timer per layer.
    network_timer: Option<u64>,
    session_timer: Option<u64>,
    generation: u64,
}

impl Supervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Supervisor {
            state: ConnectionState::default(),
            policy,
            network_timer: None,
            session_timer: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Generation of the pending retry timer, if one is armed.
    pub fn timer_generation(&self, layer: Layer) -> Option<u64> {
        match layer {
            Layer::Network => self.network_timer,
            Layer::Session => self.session_timer,
        }
    }

    pub fn handle(&mut self, event: LinkEvent) -> Vec<Action> {
        debug!("Link event {:?} in {:?}", event, self.state);
        let mut actions = Vec::new();

        match event {
            LinkEvent::NetworkRequested => {
                if self.state.network == LinkState::Down {
                    self.state.network = LinkState::Connecting;
                    actions.push(Action::ConnectNetwork);
                }
            }
            LinkEvent::NetworkEstablished(ip) => {
                info!("Network link up, local address {}", ip);
                self.state.network = LinkState::Up;
                self.state.local_ip = Some(ip);
                self.state.retry_attempts = 0;
                self.cancel(Layer::Network, &mut actions);
                self.connect_session(&mut actions);
            }
            LinkEvent::NetworkFailed | LinkEvent::NetworkLost => {
                warn!("Network link down ({:?})", event);
                self.network_failure(&mut actions);
            }
            LinkEvent::SessionEstablished => {
                info!("Session established");
                self.state.session = LinkState::Up;
                self.state.retry_attempts = 0;
                self.cancel(Layer::Session, &mut actions);
                actions.push(Action::AnnounceOnline);
            }
            LinkEvent::SessionLost => self.session_failure(&mut actions),
            LinkEvent::RetryTimerFired(layer, generation)
                if self.timer_generation(layer) != Some(generation) =>
            {
                debug!("Ignoring stale {:?} retry timer #{}", layer, generation);
            }
            LinkEvent::RetryTimerFired(Layer::Network, _) => {
                self.network_timer = None;
                if self.state.network != LinkState::Up {
                    self.state.network = LinkState::Connecting;
                    actions.push(Action::ConnectNetwork);
                }
            }
            LinkEvent::RetryTimerFired(Layer::Session, _) => {
                self.session_timer = None;
                if self.state.session != LinkState::Up {
                    self.connect_session(&mut actions);
                }
            }
            LinkEvent::UpdateStarted => {
                info!("Update started, suspending session reconnects");
                self.state.update_in_progress = true;
                self.cancel(Layer::Session, &mut actions);
                if self.state.session != LinkState::Down {
                    self.state.session = LinkState::Down;
                    actions.push(Action::DisconnectSession);
                }
            }
            LinkEvent::UpdateFinished => {
                info!("Update finished");
                self.state.update_in_progress = false;
                if self.state.session == LinkState::Down {
                    self.connect_session(&mut actions);
                }
            }
            LinkEvent::UpdateFailed => {
                warn!("Update failed, restarting");
                self.state.update_in_progress = false;
                actions.push(Action::Restart);
            }
        }

        actions
    }

    /// Counts one failure against the shared budget. Returns false when the
    /// caller must escalate to a restart instead of scheduling a retry.
    fn record_failure(&mut self, actions: &mut Vec<Action>) -> bool {
        self.state.retry_attempts = self.state.retry_attempts.saturating_add(1);
        if self.state.retry_attempts > self.policy.max_retries {
            if self.policy.suppress_restart {
                debug!(
                    "Retry budget exhausted ({} attempts), restart suppressed",
                    self.state.retry_attempts
                );
            } else {
                warn!(
                    "Too many retries ({}), restarting",
                    self.state.retry_attempts
                );
                actions.push(Action::Restart);
                return false;
            }
        }
        true
    }

    fn network_failure(&mut self, actions: &mut Vec<Action>) {
        self.state.network = LinkState::Down;
        self.state.local_ip = None;
        if self.state.session != LinkState::Down {
            self.state.session = LinkState::Down;
            actions.push(Action::DisconnectSession);
        }
        // No session reconnects while the network itself is being recovered.
        self.cancel(Layer::Session, actions);

        if self.record_failure(actions) {
            self.arm(Layer::Network, actions);
        }
    }

    fn session_failure(&mut self, actions: &mut Vec<Action>) {
        self.state.session = LinkState::Down;
        if self.state.update_in_progress {
            info!("Session lost during update, not retrying");
            return;
        }
        warn!("Session lost");

        if !self.record_failure(actions) {
            return;
        }
        if self.state.network == LinkState::Up {
            self.arm(Layer::Session, actions);
        } else if self.state.network == LinkState::Down {
            self.arm(Layer::Network, actions);
        }
    }

    fn connect_session(&mut self, actions: &mut Vec<Action>) {
        if self.state.update_in_progress {
            debug!("Not connecting session, update in progress");
            return;
        }
        match self.state.network {
            LinkState::Up => {}
            LinkState::Connecting => {
                debug!("Session will connect once the network is up");
                return;
            }
            LinkState::Down => {
                debug!("Cannot connect session, network is down");
                self.network_failure(actions);
                return;
            }
        }
        self.state.session = LinkState::Connecting;
        actions.push(Action::ConnectSession);
    }

    fn arm(&mut self, layer: Layer, actions: &mut Vec<Action>) {
        let pending = match layer {
            Layer::Network => &mut self.network_timer,
            Layer::Session => &mut self.session_timer,
        };
        if pending.is_none() {
            self.generation += 1;
            *pending = Some(self.generation);
            actions.push(Action::ArmRetry(layer));
        }
    }

    fn cancel(&mut self, layer: Layer, actions: &mut Vec<Action>) {
        let pending = match layer {
            Layer::Network => &mut self.network_timer,
            Layer::Session => &mut self.session_timer,
        };
        if pending.take().is_some() {
            actions.push(Action::CancelRetry(layer));
        }
    }
}
