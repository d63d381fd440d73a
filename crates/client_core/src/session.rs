//! One synchronization session: connection, gateway and controller wired
//! onto a single event loop.

use std::sync::Arc;

use shared::{
    domain::{ClientEvent, ConditionId, ControlAction, PartId},
    protocol::CounterEvaluation,
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, info};

use crate::{
    config::ClientSettings,
    connection::{
        ConnectionEvent, ConnectionManager, ConnectionState, Connector, WebSocketConnector,
    },
    controller::{SyncController, ViewModel},
    error::ClientError,
    gateway::ActionGateway,
    notice::StatusNotice,
    scheduler::CountdownTick,
};

enum Command {
    RefreshSnapshot,
    CounterEvaluated {
        condition_id: ConditionId,
        part_id: PartId,
        evaluation: CounterEvaluation,
    },
    AutoTransition(bool),
    Notice(StatusNotice),
}

/// Owns every resource of a session. Dropping it stops the reconnect loop
/// and the countdown; `shutdown` does the same and waits for both.
pub struct SyncSession {
    manager: Arc<ConnectionManager>,
    gateway: ActionGateway,
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<Arc<ViewModel>>,
    notices: broadcast::Sender<StatusNotice>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncSession {
    pub async fn start(settings: &ClientSettings) -> Result<Self, ClientError> {
        Self::start_with(settings, Arc::new(WebSocketConnector)).await
    }

    pub async fn start_with(
        settings: &ClientSettings,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ClientError> {
        let gateway = ActionGateway::new(settings.http_base()?);
        let ws_url = settings.websocket_url()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ticks_tx, ticks_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let manager = ConnectionManager::new(
            ws_url,
            connector,
            settings.reconnect_policy(),
            events_tx,
        );
        let controller = SyncController::new(ticks_tx);
        let view = controller.subscribe();
        let notices = controller.notice_sender();

        if settings.initial_snapshot {
            let _ = commands_tx.send(Command::RefreshSnapshot);
        }

        let event_loop = EventLoop {
            controller,
            gateway: gateway.clone(),
            resync_on_reconnect: settings.resync_on_reconnect,
            fetches: JoinSet::new(),
        };
        let task = tokio::spawn(event_loop.run(events_rx, ticks_rx, commands_rx, shutdown_rx));

        info!(
            server_url = %gateway.server_url(),
            ws_url = %manager.url(),
            "session: started"
        );
        manager.open().await;

        Ok(Self {
            manager,
            gateway,
            commands: commands_tx,
            view,
            notices,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn subscribe_view(&self) -> watch::Receiver<Arc<ViewModel>> {
        self.view.clone()
    }

    pub fn view(&self) -> Arc<ViewModel> {
        self.view.borrow().clone()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusNotice> {
        self.notices.subscribe()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.state()
    }

    pub fn gateway(&self) -> &ActionGateway {
        &self.gateway
    }

    /// Issues one control call. The outcome is published as a notice; a
    /// successful start, stop or reset also updates the auto-transition flag.
    pub async fn control_auto_transition(&self, action: ControlAction) -> Result<(), ClientError> {
        match self.gateway.control_auto_transition(action).await {
            Ok(()) => {
                let text = match action.auto_transition_running() {
                    Some(running) => {
                        self.command(Command::AutoTransition(running));
                        if running {
                            "auto-transition started".to_string()
                        } else {
                            format!("auto-transition stopped ({action})")
                        }
                    }
                    None => format!("{action} requested"),
                };
                self.command(Command::Notice(StatusNotice::success(text)));
                Ok(())
            }
            Err(err) => {
                self.command(Command::Notice(StatusNotice::error(format!(
                    "auto-transition control error: {}",
                    err.notice_text()
                ))));
                Err(err)
            }
        }
    }

    pub async fn increment_counter(
        &self,
        condition_id: ConditionId,
        part_id: PartId,
        amount: i64,
    ) -> Result<CounterEvaluation, ClientError> {
        match self
            .gateway
            .increment_counter(condition_id, part_id, amount)
            .await
        {
            Ok(evaluation) => {
                self.command(Command::CounterEvaluated {
                    condition_id,
                    part_id,
                    evaluation,
                });
                Ok(evaluation)
            }
            Err(err) => {
                self.command(Command::Notice(StatusNotice::error(format!(
                    "counter update failed: {}",
                    err.notice_text()
                ))));
                Err(err)
            }
        }
    }

    /// Legacy socket event. Not queued while disconnected.
    pub async fn send_event(&self, event: ClientEvent) -> Result<(), ClientError> {
        let result = self.manager.send(event).await;
        if let Err(err) = &result {
            self.command(Command::Notice(StatusNotice::error(err.notice_text())));
        }
        result
    }

    pub fn refresh_snapshot(&self) {
        self.command(Command::RefreshSnapshot);
    }

    /// Closes the socket, cancels the countdown and waits for the event loop
    /// to finish. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.manager.close().await;
        self.shutdown.send_replace(true);
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
            info!("session: stopped");
        }
    }

    fn command(&self, command: Command) {
        let _ = self.commands.send(command);
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.manager.request_close();
        self.shutdown.send_replace(true);
    }
}

struct EventLoop {
    controller: SyncController,
    gateway: ActionGateway,
    resync_on_reconnect: bool,
    fetches: JoinSet<(u64, Result<String, ClientError>)>,
}

impl EventLoop {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut ticks: mpsc::UnboundedReceiver<CountdownTick>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                Some(event) = events.recv() => self.on_connection_event(event),
                Some(tick) = ticks.recv() => self.controller.apply_tick(tick),
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(joined) = self.fetches.join_next() => match joined {
                    Ok((issued_at, Ok(raw))) => {
                        self.controller.handle_snapshot(&raw, issued_at);
                    }
                    Ok((_, Err(err))) => self.controller.notify(StatusNotice::warning(format!(
                        "snapshot fetch failed: {}",
                        err.notice_text()
                    ))),
                    Err(err) => debug!(error = %err, "session: snapshot task ended early"),
                },
                _ = shutdown.changed() => break,
            }
        }

        // Drain what the connection already delivered so its final state
        // notices are not lost.
        while let Ok(event) = events.try_recv() {
            self.on_connection_event(event);
        }
        self.fetches.abort_all();
        self.controller.teardown();
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Frame(raw) => self.controller.handle_frame(&raw),
            ConnectionEvent::Notice(notice) => self.controller.notify(notice),
            ConnectionEvent::StateChanged(state) => {
                debug!(state = ?state, "session: connection state changed");
                if state == ConnectionState::Open && self.resync_on_reconnect {
                    self.request_snapshot();
                }
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::RefreshSnapshot => self.request_snapshot(),
            Command::CounterEvaluated {
                condition_id,
                part_id,
                evaluation,
            } => self
                .controller
                .apply_counter_evaluation(condition_id, part_id, &evaluation),
            Command::AutoTransition(running) => {
                self.controller.set_auto_transition_running(running)
            }
            Command::Notice(notice) => self.controller.notify(notice),
        }
    }

    fn request_snapshot(&mut self) {
        let issued_at = self.controller.live_updates();
        let gateway = self.gateway.clone();
        debug!(issued_at, "session: snapshot requested");
        self.fetches
            .spawn(async move { (issued_at, gateway.fetch_initial_state().await) });
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
