// Connection lifecycle and request/response exchange with the vendor server.
//
// The session is the pipe server; the vendor process is the client peer.
// All calls block the caller. Only the wait for the peer is bounded by a
// timeout; every other exchange blocks until the server answers.

use crate::config::SessionConfig;
use crate::ipc::{
    Command, Frame, MeasurementRecord, MeasurementReply, PipeChannel, ProtocolError,
    StatusResponse, TransportError,
};
use crate::server::{ProcessError, ServerProcess, Supervisor};
use log::{debug, error, info, warn};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Server process error: {0}")]
    Process(#[from] ProcessError),
    #[error("Failed to create Tokio runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("Server did not connect within {0:?}")]
    ConnectTimeout(Duration),
    #[error("Beam profiler not ready (profiler state {profiler_state})")]
    NotReady { profiler_state: i32 },
    #[error("Not connected")]
    NotConnected,
}

/// Caller-facing status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum DeviceStatus {
    /// Connected to server and profiler; can measure.
    Ready = 0,
    /// Connected, but the profiler is not ready; cannot measure.
    NotReady = 1,
    /// Server or channel up, but the profiler never became ready.
    ServerOnly = 2,
    /// Completely disconnected.
    Disconnected = 3,
}

impl DeviceStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Result of a connect attempt. Never an error so retry loops can act on codes.
#[derive(Debug)]
pub enum ConnectOutcome {
    Ready,
    /// Peer connected but the profiler reported a state that cannot measure.
    NotReady(StatusResponse),
    /// No peer within the deadline. Process and channel are kept for a retry.
    TimedOut(Duration),
    Failed(SessionError),
}

impl ConnectOutcome {
    /// `0` when ready, `1` otherwise.
    pub fn code(&self) -> i32 {
        match self {
            ConnectOutcome::Ready => 0,
            _ => 1,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectOutcome::Ready)
    }

    pub fn into_result(self) -> Result<(), SessionError> {
        match self {
            ConnectOutcome::Ready => Ok(()),
            ConnectOutcome::NotReady(status) => Err(SessionError::NotReady {
                profiler_state: status.profiler_state,
            }),
            ConnectOutcome::TimedOut(timeout) => Err(SessionError::ConnectTimeout(timeout)),
            ConnectOutcome::Failed(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// Nothing was running; no transport operation was performed.
    NotConnected,
    Disconnected,
}

/// Control object for one beam profiler behind the vendor server.
pub struct Session<S: Supervisor = ServerProcess> {
    config: SessionConfig,
    supervisor: S,
    // Declared before the runtime so it is released while the runtime is alive.
    channel: Option<PipeChannel>,
    runtime: tokio::runtime::Runtime,
    connected: bool,
    server_running: bool,
}

impl Session<ServerProcess> {
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        Self::with_supervisor(config, ServerProcess::new())
    }
}

impl<S: Supervisor> Session<S> {
    pub fn with_supervisor(config: SessionConfig, supervisor: S) -> Result<Self, SessionError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(SessionError::Runtime)?;

        Ok(Self {
            config,
            supervisor,
            channel: None,
            runtime,
            connected: false,
            server_running: false,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &S {
        &self.supervisor
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_server_running(&self) -> bool {
        self.server_running
    }

    pub fn is_debug_mode(&self) -> bool {
        self.config.debug_mode
    }

    /// Connect using the configured timeout.
    pub fn connect(&mut self) -> ConnectOutcome {
        let timeout = self.config.connect_timeout();
        self.connect_with_timeout(timeout)
    }

    /// Start the server, wait for it on the channel and confirm readiness.
    ///
    /// Returns immediately when already ready. After a timeout or a not-ready
    /// reply the server and channel are kept, so calling again resumes where
    /// the previous attempt stopped instead of starting over.
    pub fn connect_with_timeout(&mut self, timeout: Duration) -> ConnectOutcome {
        if self.connected {
            debug!("[SESSION] Already connected");
            return ConnectOutcome::Ready;
        }

        match self.try_connect(timeout) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("[SESSION] Connect failed: {}", e);
                ConnectOutcome::Failed(e)
            }
        }
    }

    fn try_connect(&mut self, timeout: Duration) -> Result<ConnectOutcome, SessionError> {
        if !self.config.debug_mode && !(self.server_running && self.supervisor.is_running()) {
            if self.server_running {
                warn!("[SESSION] Server exited before connecting, relaunching");
                self.close_channel();
            }
            self.supervisor.start(&self.config)?;
            self.server_running = true;
        }

        if self.channel.is_none() {
            let _guard = self.runtime.enter();
            let channel = PipeChannel::create(&self.config.channel_name, self.config.buffer_size)?;
            self.channel = Some(channel);
        }

        let channel = self.channel.as_mut().ok_or(SessionError::NotConnected)?;
        if !channel.is_accepted() {
            info!(
                "[SESSION] Waiting for server on '{}' (timeout: {:?})...",
                channel.name(),
                timeout
            );

            let accepted = self
                .runtime
                .block_on(async { tokio::time::timeout(timeout, channel.accept()).await });

            match accepted {
                Ok(result) => result?,
                Err(_) => {
                    warn!("[SESSION] Server did not connect within {:?}", timeout);
                    return Ok(ConnectOutcome::TimedOut(timeout));
                }
            }
        }

        let status = match self.query_status() {
            Ok(status) => status,
            Err(SessionError::Transport(e)) if e.is_peer_loss() => {
                // Keeping the dead stream would fail every later retry.
                warn!("[SESSION] Server went away during handshake, releasing channel");
                self.close_channel();
                return Err(SessionError::Transport(e));
            }
            Err(e) => return Err(e),
        };
        if status.is_ready_for_connect() {
            self.connected = true;
            info!("[SESSION] Beam profiler ready");
            Ok(ConnectOutcome::Ready)
        } else {
            info!(
                "[SESSION] Beam profiler not ready (transport result {}, profiler state {})",
                status.transport_result, status.profiler_state
            );
            Ok(ConnectOutcome::NotReady(status))
        }
    }

    /// Stop the device, close the channel and kill the server.
    ///
    /// Teardown always runs to completion. Losing the peer while sending
    /// `stop` is only logged; any other failure is returned afterwards.
    pub fn disconnect(&mut self) -> Result<DisconnectOutcome, SessionError> {
        if !self.server_running && !self.connected {
            info!("[SESSION] Not connected");
            return Ok(DisconnectOutcome::NotConnected);
        }

        let mut failure: Option<SessionError> = None;

        if self.channel.as_ref().is_some_and(PipeChannel::is_accepted) {
            match self.exchange(Command::Stop) {
                Ok(frame) => debug!(
                    "[SESSION] Stop acknowledged: {}",
                    String::from_utf8_lossy(&frame.payload).trim_end()
                ),
                Err(SessionError::Transport(e)) if e.is_peer_loss() => {
                    if self.config.debug_mode {
                        debug!("[SESSION] Pipe already closed: {}", e);
                    } else {
                        warn!("[SESSION] Pipe closed unexpectedly: {}", e);
                    }
                }
                Err(e) => {
                    error!("[SESSION] Stop command failed: {}", e);
                    failure = Some(e);
                }
            }
        } else {
            debug!("[SESSION] No peer attached, skipping stop");
        }

        // Let the server act on `stop` before the channel goes away.
        std::thread::sleep(self.config.settle_delay());

        self.close_channel();

        if !self.config.debug_mode {
            if let Err(e) = self.supervisor.kill() {
                error!("[SESSION] {}", e);
                failure.get_or_insert(e.into());
            }
        }

        self.server_running = false;
        self.connected = false;
        info!("[SESSION] Disconnected");

        match failure {
            Some(e) => Err(e),
            None => Ok(DisconnectOutcome::Disconnected),
        }
    }

    /// Current status. Queries the profiler only when connected.
    pub fn status(&mut self) -> Result<DeviceStatus, SessionError> {
        if !self.server_running && !self.config.debug_mode && !self.connected {
            return Ok(DeviceStatus::Disconnected);
        }

        if !self.connected {
            return Ok(DeviceStatus::ServerOnly);
        }

        let status = self.query_status()?;
        if status.is_ready() {
            Ok(DeviceStatus::Ready)
        } else {
            Ok(DeviceStatus::NotReady)
        }
    }

    /// Take one measurement.
    ///
    /// `None` when the profiler is not ready (nothing is measured) or the
    /// server reports a measuring error. A malformed reply is an error.
    pub fn measurement(&mut self) -> Result<Option<MeasurementRecord>, SessionError> {
        let status = self.status()?;
        if status != DeviceStatus::Ready {
            debug!("[SESSION] Not measuring, status {:?}", status);
            return Ok(None);
        }

        let frame = self.exchange(Command::Measure)?;
        match MeasurementReply::parse(&frame)? {
            MeasurementReply::Record(record) => Ok(Some(record)),
            MeasurementReply::DeviceError => {
                warn!("[SESSION] Server reported an error while measuring");
                Ok(None)
            }
        }
    }

    fn query_status(&mut self) -> Result<StatusResponse, SessionError> {
        let frame = self.exchange(Command::Status)?;
        Ok(StatusResponse::parse(&frame)?)
    }

    /// One request, one reply.
    ///
    /// A reply longer than the buffer comes back truncated; its remainder is
    /// read and dropped so the next request lines up with its own reply.
    fn exchange(&mut self, command: Command) -> Result<Frame, SessionError> {
        let channel = self.channel.as_mut().ok_or(SessionError::NotConnected)?;
        let frame = self.runtime.block_on(async {
            channel.send(command.verb()).await?;
            let frame = channel.receive().await?;
            if !frame.is_complete() {
                let mut discarded = 0;
                loop {
                    let tail = channel.receive().await?;
                    discarded += tail.payload.len();
                    if tail.is_complete() {
                        break;
                    }
                }
                warn!(
                    "[SESSION] Reply to '{}' exceeded the buffer, dropped {} trailing bytes",
                    command, discarded
                );
            }
            Ok::<_, TransportError>(frame)
        })?;
        Ok(frame)
    }

    fn close_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
    }
}

impl<S: Supervisor> Drop for Session<S> {
    fn drop(&mut self) {
        if self.server_running || self.connected {
            if let Err(e) = self.disconnect() {
                warn!("[SESSION] Disconnect on drop failed: {}", e);
            }
        }
    }
}
