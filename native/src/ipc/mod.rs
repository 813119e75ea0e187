// Pipe transport and text command protocol spoken with the vendor server.

pub mod protocol;
pub mod transport;

#[cfg(unix)]
mod pipe_unix;
#[cfg(windows)]
mod pipe_windows;

#[cfg(unix)]
pub use pipe_unix::{pipe_address, PipeChannel};
#[cfg(windows)]
pub use pipe_windows::{pipe_address, PipeChannel};

pub use protocol::{
    Command, GaussianFit, MeasurementRecord, MeasurementReply, MeasurementValue, ProfilerState,
    ProtocolError, StatusResponse,
};
pub use transport::{Frame, TransportError};

/// Channel name compiled into the vendor server executable.
pub const DEFAULT_CHANNEL_NAME: &str = "TLBP2PyConnection";

/// Pipe buffer capacity in bytes, used for both directions.
pub const DEFAULT_BUFFER_SIZE: usize = 65536;
