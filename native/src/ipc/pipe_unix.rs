// Unix transport: a Unix domain socket standing in for the named pipe.

use super::transport::{read_frame, write_frame, Frame, TransportError};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};

/// Socket path for a channel name.
pub fn pipe_address(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}.sock", name))
}

/// Server end of the channel shared with the vendor process.
///
/// The listener stays bound after the first peer is accepted so the name
/// remains taken, but no further peers are ever accepted.
pub struct PipeChannel {
    name: String,
    path: PathBuf,
    buffer_size: usize,
    listener: Option<UnixListener>,
    stream: Option<UnixStream>,
    pending: Vec<u8>,
}

impl PipeChannel {
    /// Bind the socket. Must be called inside a Tokio runtime context.
    ///
    /// A live owner is detected by connecting to its socket. An owner that is
    /// still waiting for its peer accepts that connection, sees it hang up on
    /// the first exchange and has to connect again.
    pub fn create(name: &str, buffer_size: usize) -> Result<Self, TransportError> {
        let path = pipe_address(name);
        let creation_error = |source| TransportError::ChannelCreation {
            name: name.to_string(),
            source,
        };

        if path.exists() {
            if std::os::unix::net::UnixStream::connect(&path).is_ok() {
                return Err(creation_error(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    format!("{} is served by another instance", path.display()),
                )));
            }
            warn!("[PIPE] Removing stale socket {:?}", path);
            std::fs::remove_file(&path).map_err(creation_error)?;
        }

        let listener = UnixListener::bind(&path).map_err(creation_error)?;
        info!("[PIPE] Created {:?}", path);

        Ok(Self {
            name: name.to_string(),
            path,
            buffer_size,
            listener: Some(listener),
            stream: None,
            pending: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.listener.is_some()
    }

    pub fn is_accepted(&self) -> bool {
        self.stream.is_some()
    }

    /// Wait for the peer to connect. Cancel safe.
    pub async fn accept(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let listener = self.listener.as_ref().ok_or(TransportError::Closed)?;
        let (stream, _) = listener.accept().await.map_err(TransportError::Accept)?;
        self.stream = Some(stream);
        info!("[PIPE] Peer connected to {}", self.name);
        Ok(())
    }

    pub async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        let stream = self.connected_stream()?;
        debug!("[PIPE] -> {}", message);
        write_frame(stream, message).await
    }

    pub async fn receive(&mut self) -> Result<Frame, TransportError> {
        if self.listener.is_none() {
            return Err(TransportError::Closed);
        }
        let stream = self.stream.as_mut().ok_or(TransportError::NotAccepted)?;
        let frame = read_frame(stream, &mut self.pending, self.buffer_size).await?;
        debug!("[PIPE] <- {}", String::from_utf8_lossy(&frame.payload).trim_end());
        Ok(frame)
    }

    /// Release the socket and remove its path. Safe to call more than once.
    pub fn close(&mut self) {
        self.stream = None;
        self.pending.clear();
        if self.listener.take().is_some() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("[PIPE] Could not remove {:?}: {}", self.path, e);
            }
            info!("[PIPE] Closed {}", self.name);
        }
    }

    fn connected_stream(&mut self) -> Result<&mut UnixStream, TransportError> {
        if self.listener.is_none() {
            return Err(TransportError::Closed);
        }
        self.stream.as_mut().ok_or(TransportError::NotAccepted)
    }
}

impl Drop for PipeChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::time::Duration;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime")
    }

    fn unique_name() -> String {
        format!("tlbp2-pipe-test-{}", uuid::Uuid::new_v4())
    }

    #[test]
    fn second_instance_is_rejected() {
        let rt = runtime();
        let _guard = rt.enter();
        let name = unique_name();

        let first = PipeChannel::create(&name, 1024).unwrap();
        let second = PipeChannel::create(&name, 1024);
        assert!(matches!(
            second,
            Err(TransportError::ChannelCreation { .. })
        ));
        drop(first);
    }

    #[test]
    fn rejected_instance_looks_like_lost_peer_to_owner() {
        let rt = runtime();
        let name = unique_name();
        let mut owner = {
            let _guard = rt.enter();
            PipeChannel::create(&name, 1024).unwrap()
        };

        let contender = std::thread::spawn(move || {
            let rt = runtime();
            let _guard = rt.enter();
            PipeChannel::create(&name, 1024).is_err()
        });

        rt.block_on(async {
            tokio::time::timeout(Duration::from_secs(5), owner.accept())
                .await
                .expect("liveness check connects")
                .unwrap();
            assert!(contender.join().unwrap());

            let err = owner.receive().await.unwrap_err();
            assert!(err.is_peer_loss());
        });
        assert!(owner.is_open());
    }

    #[test]
    fn stale_socket_is_replaced() {
        let name = unique_name();
        let path = pipe_address(&name);
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let rt = runtime();
        let _guard = rt.enter();
        let mut channel = PipeChannel::create(&name, 1024).unwrap();
        assert!(channel.is_open());
        channel.close();
        assert!(!path.exists());
    }

    #[test]
    fn exchanges_messages_with_peer() {
        let rt = runtime();
        let name = unique_name();
        let mut channel = {
            let _guard = rt.enter();
            PipeChannel::create(&name, 1024).unwrap()
        };

        let path = channel.path().to_path_buf();
        let peer = std::thread::spawn(move || {
            let stream = std::os::unix::net::UnixStream::connect(&path).unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            writer.write_all(b"3\r\n").unwrap();
            line
        });

        rt.block_on(async {
            tokio::time::timeout(Duration::from_secs(5), channel.accept())
                .await
                .expect("peer connects")
                .unwrap();
            channel.send("status").await.unwrap();
            let frame = channel.receive().await.unwrap();
            assert!(frame.is_complete());
            assert_eq!(frame.text().unwrap(), "3");
        });

        assert_eq!(peer.join().unwrap(), "status\n");
        channel.close();
        channel.close();
        assert!(!channel.is_open());
    }

    #[test]
    fn send_before_accept_is_rejected() {
        let rt = runtime();
        let name = unique_name();
        let mut channel = {
            let _guard = rt.enter();
            PipeChannel::create(&name, 1024).unwrap()
        };

        rt.block_on(async {
            let err = channel.send("status").await.unwrap_err();
            assert!(matches!(err, TransportError::NotAccepted));
        });
    }
}
