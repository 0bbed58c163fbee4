// ── Session supervision ──
//
// One task owns the authenticated session: it drives the connect
// sequence, schedules token refresh, pumps state broadcasts through the
// parser, and relays bus commands. Transport loss redrives the whole
// handshake and rebuilds the entity registry from a fresh structure file.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use halox_api::{ControllerSession, FrameKind, SessionConfig, StateFrame};

use crate::config::ControllerConfig;
use crate::error::CoreError;
use crate::registry::EntityRegistry;
use crate::states::{self, StateUpdate};

/// State-out port capacity. A full queue blocks the receive loop, which
/// is acceptable: the controller retransmits state on the next change.
pub const STATE_OUT_CAPACITY: usize = 10;
/// Command-in port capacity.
pub const COMMAND_IN_CAPACITY: usize = 2;

/// Fallback refresh interval when no token is held yet.
const NO_TOKEN_RETRY: Duration = Duration::from_secs(3600);

/// Retry pacing once the token is past due (a failed refresh must not
/// spin the timer).
const REFRESH_RETRY: Duration = Duration::from_secs(60);

/// Channel endpoints the bus adapter plugs into.
pub struct BridgePorts {
    /// Registry-matched state changes, ready to publish.
    pub state_out: mpsc::Receiver<StateUpdate>,
    /// Ready-shaped control URLs bound for the controller.
    pub command_in: mpsc::Sender<String>,
    /// Current entity registry; republished after every reconnect.
    pub registry: watch::Receiver<Arc<EntityRegistry>>,
}

/// Owns the controller session and everything scheduled around it.
pub struct SessionSupervisor {
    session: ControllerSession,
    state_rx: mpsc::Receiver<StateFrame>,
    reconnect_rx: mpsc::Receiver<()>,
    registry: Arc<EntityRegistry>,
    registry_tx: watch::Sender<Arc<EntityRegistry>>,
    state_out: mpsc::Sender<StateUpdate>,
    command_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
}

impl SessionSupervisor {
    /// Connect, build the registry, enable live updates, and hand back
    /// the supervisor plus the adapter-facing ports.
    pub async fn connect(
        config: &ControllerConfig,
        cancel: CancellationToken,
    ) -> Result<(Self, BridgePorts), CoreError> {
        let mut session = ControllerSession::new(SessionConfig {
            address: config.address(),
            username: config.username.clone(),
            password: config.password.clone(),
        })?;

        let (state_rx, reconnect_rx) = session.connect().await?;

        let structure = session.fetch_structure().await?;
        let registry = Arc::new(EntityRegistry::from_structure(&structure));
        info!(devices = registry.len(), "structure file loaded");

        session.enable_updates().await?;

        let (registry_tx, registry_watch) = watch::channel(Arc::clone(&registry));
        let (state_out_tx, state_out_rx) = mpsc::channel(STATE_OUT_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_IN_CAPACITY);

        let supervisor = Self {
            session,
            state_rx,
            reconnect_rx,
            registry,
            registry_tx,
            state_out: state_out_tx,
            command_rx,
            cancel,
        };
        let ports = BridgePorts {
            state_out: state_out_rx,
            command_in: command_tx,
            registry: registry_watch,
        };
        Ok((supervisor, ports))
    }

    /// Snapshot of the current registry (used by `--print-hass`).
    pub fn registry(&self) -> Arc<EntityRegistry> {
        Arc::clone(&self.registry)
    }

    /// Drive the session until shutdown or an unrecoverable reconnect
    /// failure.
    pub async fn run(mut self) -> Result<(), CoreError> {
        loop {
            let refresh_at = self.refresh_deadline();

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!("supervisor shutting down");
                    self.session.close().await;
                    return Ok(());
                }

                _ = self.reconnect_rx.recv() => {
                    info!("transport lost, reconnecting");
                    self.reconnect().await?;
                }

                _ = sleep_until(refresh_at) => {
                    debug!("token expiring, refreshing");
                    if let Err(e) = self.session.refresh_token().await {
                        // The next transport loss forces a full re-handshake.
                        warn!(error = %e, "token refresh failed");
                    }
                }

                frame = self.state_rx.recv() => {
                    if let Some(frame) = frame {
                        self.dispatch_state(frame).await;
                    }
                    // None means the receive loop is gone; the reconnect
                    // signal is already queued and handled above.
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if let Err(e) = self.session.send_command(&cmd).await {
                                warn!(error = %e, "command send failed");
                            }
                        }
                        None => {
                            info!("command port closed, shutting down");
                            self.session.close().await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// When to wake for a token refresh: at expiry, paced once past due,
    /// or in an hour if no token is held.
    fn refresh_deadline(&self) -> Instant {
        let remaining = self
            .session
            .token_expiry()
            .map(|expiry| (expiry - Utc::now()).to_std().unwrap_or(REFRESH_RETRY))
            .unwrap_or(NO_TOKEN_RETRY);
        Instant::now() + remaining
    }

    /// Redrive the full handshake, rebuild the registry from a fresh
    /// structure file, and re-enable updates. Failure here is fatal.
    async fn reconnect(&mut self) -> Result<(), CoreError> {
        match self.session.connect().await {
            Ok((state_rx, reconnect_rx)) => {
                self.state_rx = state_rx;
                self.reconnect_rx = reconnect_rx;

                let structure = self.session.fetch_structure().await?;
                let registry = Arc::new(EntityRegistry::from_structure(&structure));
                info!(devices = registry.len(), "registry rebuilt after reconnect");
                self.registry = Arc::clone(&registry);
                let _ = self.registry_tx.send(registry);

                self.session.enable_updates().await?;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "reconnect failed, giving up");
                Err(CoreError::Api(e))
            }
        }
    }

    /// Route one state broadcast: types 2 and 3 go through the parser,
    /// 4 and 7 are accepted but ignored.
    async fn dispatch_state(&mut self, frame: StateFrame) {
        let updates = match frame.kind {
            FrameKind::ValueState => states::parse_value_states(&frame.payload, &self.registry),
            FrameKind::TextState => states::parse_text_states(&frame.payload, &self.registry),
            other => {
                debug!(kind = ?other, "ignoring state frame");
                return;
            }
        };

        for update in updates {
            if self.state_out.send(update).await.is_err() {
                warn!("state port closed, dropping updates");
                return;
            }
        }
    }
}
