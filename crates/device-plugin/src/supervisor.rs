//! Restart/shutdown orchestration of the plugin endpoint.
//!
//! Every trigger (a failed start, the kubelet socket reappearing, OS
//! signals, a crash-looping serve loop) arrives on one channel and drives
//! [`transition`]. [`Supervisor::run`] performs the side effects of each
//! state.

use std::sync::Arc;

use error_stack::Report;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::context::PluginContext;
use crate::k8s::DevicePluginError;
use crate::k8s::EndpointConfig;
use crate::k8s::PluginEndpoint;

pub type EventSender = mpsc::UnboundedSender<SupervisorEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Signal {
    #[display("SIGHUP")]
    Hangup,
    #[display("SIGINT")]
    Interrupt,
    #[display("SIGTERM")]
    Terminate,
    #[display("SIGQUIT")]
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// the endpoint started by the numbered attempt could not be started
    StartFailed { attempt: u64 },
    /// the kubelet socket was created, the kubelet has restarted
    KubeletRestarted,
    Signal(Signal),
    /// the filesystem watcher reported an error
    WatchError(String),
    /// the serve loop crashed too often and gave up
    CrashLoop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// tear down the current endpoint, if any, and start a new one
    Restarting,
    /// wait for the next event
    Running,
    /// stop the endpoint and leave; `fatal` exits with an error
    ShuttingDown { fatal: bool },
}

/// Next state after `event` arrives in `state`.
///
/// `current_attempt` numbers the latest start; a failure reported by an
/// earlier attempt was already superseded by a restart and is ignored.
pub fn transition(
    state: SupervisorState,
    event: &SupervisorEvent,
    current_attempt: u64,
) -> SupervisorState {
    if let SupervisorState::ShuttingDown { .. } = state {
        return state;
    }

    match event {
        SupervisorEvent::StartFailed { attempt } if *attempt != current_attempt => state,
        SupervisorEvent::StartFailed { .. }
        | SupervisorEvent::KubeletRestarted
        | SupervisorEvent::Signal(Signal::Hangup) => SupervisorState::Restarting,
        SupervisorEvent::Signal(Signal::Interrupt | Signal::Terminate | Signal::Quit) => {
            SupervisorState::ShuttingDown { fatal: false }
        }
        SupervisorEvent::CrashLoop => SupervisorState::ShuttingDown { fatal: true },
        SupervisorEvent::WatchError(_) => state,
    }
}

pub struct Supervisor {
    context: Arc<PluginContext>,
    config: EndpointConfig,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<SupervisorEvent>,
}

impl Supervisor {
    pub fn new(context: Arc<PluginContext>, config: EndpointConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            context,
            config,
            events_tx,
            events_rx,
        }
    }

    /// Sender for watchers feeding this supervisor.
    pub fn events(&self) -> EventSender {
        self.events_tx.clone()
    }

    /// Run until a shutdown signal or a crash loop.
    ///
    /// A failed start is retried right away, without backoff; each attempt
    /// is only slowed down by the dial timeouts.
    #[tracing::instrument(skip(self), fields(resource = %self.context.resource_name))]
    pub async fn run(mut self) -> Result<(), Report<DevicePluginError>> {
        let mut state = SupervisorState::Restarting;
        let mut endpoint: Option<PluginEndpoint> = None;
        let mut attempt: u64 = 0;

        loop {
            match state {
                SupervisorState::Restarting => {
                    stop_endpoint(endpoint.take()).await;
                    attempt += 1;

                    let mut next = PluginEndpoint::new(
                        self.context.clone(),
                        self.config.clone(),
                        self.events_tx.clone(),
                    );
                    if let Err(e) = next.start().await {
                        warn!("failed to start device plugin, retrying: {e:?}");
                        // the receiver lives in self, sending cannot fail
                        let _ = self.events_tx.send(SupervisorEvent::StartFailed { attempt });
                    }
                    endpoint = Some(next);
                    state = SupervisorState::Running;
                }
                SupervisorState::Running => {
                    let event = match self.events_rx.recv().await {
                        Some(event) => event,
                        None => SupervisorEvent::Signal(Signal::Terminate),
                    };
                    let next = transition(state, &event, attempt);
                    log_event(&event, next, &self.config);
                    state = next;
                }
                SupervisorState::ShuttingDown { fatal } => {
                    stop_endpoint(endpoint.take()).await;
                    if fatal {
                        return Err(Report::new(DevicePluginError::CrashLoop {
                            resource_name: self.context.resource_name.clone(),
                        }));
                    }
                    info!("device plugin shut down");
                    return Ok(());
                }
            }
        }
    }
}

async fn stop_endpoint(endpoint: Option<PluginEndpoint>) {
    if let Some(mut endpoint) = endpoint {
        if let Err(e) = endpoint.stop().await {
            error!("failed to stop device plugin endpoint: {e:?}");
        }
    }
}

fn log_event(event: &SupervisorEvent, next: SupervisorState, config: &EndpointConfig) {
    match event {
        SupervisorEvent::StartFailed { attempt } => match next {
            SupervisorState::Restarting => {
                info!("restarting device plugin after failed start attempt {attempt}")
            }
            _ => debug!("ignoring failure of superseded start attempt {attempt}"),
        },
        SupervisorEvent::KubeletRestarted => info!(
            "{} created, restarting",
            config.kubelet_socket_path().display()
        ),
        SupervisorEvent::Signal(signal) => match next {
            SupervisorState::ShuttingDown { .. } => {
                info!("received signal \"{signal}\", shutting down")
            }
            _ => info!("received signal \"{signal}\", restarting"),
        },
        SupervisorEvent::WatchError(message) => warn!("filesystem watcher error: {message}"),
        SupervisorEvent::CrashLoop => error!("gRPC server crash loop detected, exiting"),
    }
}
