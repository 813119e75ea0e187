pub mod config;
pub mod ipc;
pub mod logging;
pub mod server;
pub mod session;

pub use config::{ConfigError, SessionConfig};
pub use ipc::{
    Command, GaussianFit, MeasurementRecord, MeasurementValue, ProfilerState, ProtocolError,
    StatusResponse, TransportError,
};
pub use server::{ProcessError, ServerProcess, Supervisor};
pub use session::{ConnectOutcome, DeviceStatus, DisconnectOutcome, Session, SessionError};
