// Windows transport: single-instance, message-mode named pipe server.

use super::transport::{read_frame, write_frame, Frame, TransportError};
use log::{debug, info, warn};
use tokio::net::windows::named_pipe::{NamedPipeServer, PipeMode, ServerOptions};

/// Full pipe path for a channel name.
pub fn pipe_address(name: &str) -> String {
    format!(r"\\.\pipe\{}", name)
}

/// Server end of the channel shared with the vendor process.
pub struct PipeChannel {
    name: String,
    buffer_size: usize,
    pipe: Option<NamedPipeServer>,
    accepted: bool,
    pending: Vec<u8>,
}

impl PipeChannel {
    /// Create the pipe. Must be called inside a Tokio runtime context.
    pub fn create(name: &str, buffer_size: usize) -> Result<Self, TransportError> {
        let address = pipe_address(name);
        let pipe = ServerOptions::new()
            .first_pipe_instance(true)
            .access_inbound(true)
            .access_outbound(true)
            .pipe_mode(PipeMode::Message)
            .max_instances(1)
            .in_buffer_size(buffer_size as u32)
            .out_buffer_size(buffer_size as u32)
            .create(&address)
            .map_err(|source| TransportError::ChannelCreation {
                name: name.to_string(),
                source,
            })?;

        info!("[PIPE] Created {}", address);

        Ok(Self {
            name: name.to_string(),
            buffer_size,
            pipe: Some(pipe),
            accepted: false,
            pending: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.pipe.is_some()
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    /// Wait for the peer to open the pipe. Cancel safe.
    pub async fn accept(&mut self) -> Result<(), TransportError> {
        let pipe = self.pipe.as_ref().ok_or(TransportError::Closed)?;
        pipe.connect().await.map_err(TransportError::Accept)?;
        self.accepted = true;
        info!("[PIPE] Peer connected to {}", self.name);
        Ok(())
    }

    pub async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        let pipe = self.connected_pipe()?;
        debug!("[PIPE] -> {}", message);
        write_frame(pipe, message).await
    }

    pub async fn receive(&mut self) -> Result<Frame, TransportError> {
        if !self.accepted {
            return Err(TransportError::NotAccepted);
        }
        let pipe = self.pipe.as_mut().ok_or(TransportError::Closed)?;
        let frame = read_frame(pipe, &mut self.pending, self.buffer_size).await?;
        debug!("[PIPE] <- {}", String::from_utf8_lossy(&frame.payload).trim_end());
        Ok(frame)
    }

    /// Release the pipe. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(pipe) = self.pipe.take() {
            if self.accepted {
                if let Err(e) = pipe.disconnect() {
                    warn!("[PIPE] Disconnect of {} failed: {}", self.name, e);
                }
            }
            info!("[PIPE] Closed {}", self.name);
        }
        self.accepted = false;
        self.pending.clear();
    }

    fn connected_pipe(&mut self) -> Result<&mut NamedPipeServer, TransportError> {
        if !self.accepted {
            return Err(TransportError::NotAccepted);
        }
        self.pipe.as_mut().ok_or(TransportError::Closed)
    }
}

impl Drop for PipeChannel {
    fn drop(&mut self) {
        self.close();
    }
}
