use log::{debug, error, info};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;

use crate::supervisor::LinkEvent;

/// Notifications from the firmware update process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSignal {
    Started,
    Progress,
    Finished,
    Failed,
}

impl UpdateSignal {
    /// Progress only keeps the update alive; it causes no link transition.
    pub fn link_event(self) -> Option<LinkEvent> {
        match self {
            UpdateSignal::Started => Some(LinkEvent::UpdateStarted),
            UpdateSignal::Progress => None,
            UpdateSignal::Finished => Some(LinkEvent::UpdateFinished),
            UpdateSignal::Failed => Some(LinkEvent::UpdateFailed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Received {
    Begin,
    End,
    Abort,
}

/// Tracks whether an update is running so a repeated start reads as progress.
#[derive(Debug, Default)]
struct UpdateTracker {
    running: bool,
}

impl UpdateTracker {
    fn classify(&mut self, received: Received) -> UpdateSignal {
        match received {
            Received::Begin if self.running => UpdateSignal::Progress,
            Received::Begin => {
                self.running = true;
                UpdateSignal::Started
            }
            Received::End => {
                self.running = false;
                UpdateSignal::Finished
            }
            Received::Abort => {
                self.running = false;
                UpdateSignal::Failed
            }
        }
    }
}

/// The updater talks to the node with Unix signals: `SIGUSR1` when it starts
/// writing (and again as it makes progress), `SIGUSR2` when it is done and
/// `SIGHUP` when the update failed.
pub async fn listen_for_signals(events: mpsc::Sender<LinkEvent>) -> anyhow::Result<()> {
    let mut begin = signal(SignalKind::user_defined1())?;
    let mut end = signal(SignalKind::user_defined2())?;
    let mut abort = signal(SignalKind::hangup())?;
    let mut tracker = UpdateTracker::default();

    loop {
        let received = tokio::select! {
            Some(()) = begin.recv() => Received::Begin,
            Some(()) = end.recv() => Received::End,
            Some(()) = abort.recv() => Received::Abort,
            else => break,
        };

        let update = tracker.classify(received);
        let Some(event) = update.link_event() else {
            debug!("Update in progress");
            continue;
        };
        info!("Update signal: {:?}", update);

        if let Err(err) = events.send(event).await {
            error!("Error forwarding update signal: {:?}", err);
            break;
        }
    }
    Ok(())
}
