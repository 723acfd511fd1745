use super::protocol::{ControlCommand, ControlMessage, ControlReply, MessageFrame};
use crate::error::Result;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::trace;

/// Sends one request per connection to a running supervisor.
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Send a raw frame sequence and return the raw reply frames.
    pub async fn request<S: AsRef<str>>(&self, frames: &[S]) -> Result<Vec<String>> {
        trace!(socket = %self.socket_path.display(), "Connecting to supervisor");
        let mut stream = UnixStream::connect(&self.socket_path).await?;

        let message = ControlMessage::new(frames.iter().map(|f| f.as_ref()));
        stream.write_all(&MessageFrame::encode(&message)?).await?;
        stream.flush().await?;

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = MessageFrame::read_length(&len_buf)?;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;

        Ok(MessageFrame::decode(&body)?.frames)
    }

    pub async fn send(&self, command: ControlCommand, plugin: &str) -> Result<ControlReply> {
        let frames = self.request(&[command.as_str(), plugin]).await?;
        Ok(ControlReply::from_wire(&frames))
    }
}
