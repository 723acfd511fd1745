use super::protocol::{ControlMessage, MessageFrame};
use super::waiter::PipeWriter;
use crate::error::{Result, SupervisorError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// How long a client waits for the event loop to answer.
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// A request waiting to be answered on the event loop.
pub struct ControlRequest {
    frames: Vec<String>,
    reply: oneshot::Sender<Vec<String>>,
}

impl ControlRequest {
    pub fn new(frames: Vec<String>) -> (Self, oneshot::Receiver<Vec<String>>) {
        let (reply, rx) = oneshot::channel();
        (Self { frames, reply }, rx)
    }

    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    pub fn respond(self, reply: Vec<String>) {
        if self.reply.send(reply).is_err() {
            debug!("Control client went away before the reply");
        }
    }
}

/// Producer side: used by the socket listener.
#[derive(Clone)]
pub struct ControlQueue {
    tx: mpsc::UnboundedSender<ControlRequest>,
    ready: PipeWriter,
}

impl ControlQueue {
    pub fn new(tx: mpsc::UnboundedSender<ControlRequest>, ready: PipeWriter) -> Self {
        Self { tx, ready }
    }

    /// Queue a request and wake the event loop.
    pub fn submit(&self, frames: Vec<String>) -> Result<oneshot::Receiver<Vec<String>>> {
        let (request, rx) = ControlRequest::new(frames);
        self.tx
            .send(request)
            .map_err(|_| SupervisorError::Protocol("supervisor is shutting down".into()))?;
        self.ready.notify();
        Ok(rx)
    }
}

/// Consumer side: drained by the socket's handler on the event loop.
pub struct ControlInbox {
    rx: mpsc::UnboundedReceiver<ControlRequest>,
}

impl ControlInbox {
    pub fn drain(&mut self) -> Vec<ControlRequest> {
        let mut requests = Vec::new();
        while let Ok(request) = self.rx.try_recv() {
            requests.push(request);
        }
        requests
    }
}

pub fn control_channel() -> (mpsc::UnboundedSender<ControlRequest>, ControlInbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, ControlInbox { rx })
}

/// Listening control socket. Dropping it stops the listener and removes the
/// socket file.
pub struct ControlServer {
    path: PathBuf,
    task: JoinHandle<()>,
}

impl ControlServer {
    /// Bind `path` (replacing a stale socket) and start accepting.
    /// Must be called from within a tokio runtime.
    pub fn bind(path: &Path, queue: ControlQueue) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path)?;
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }
        info!("Control socket listening on: {}", path.display());

        let task = tokio::spawn(accept_loop(listener, queue));
        Ok(Self {
            path: path.to_path_buf(),
            task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.task.abort();
        if let Err(e) = std::fs::remove_file(&self.path) {
            trace!("Could not remove {}: {}", self.path.display(), e);
        }
    }
}

async fn accept_loop(listener: UnixListener, queue: ControlQueue) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let queue = queue.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, queue).await {
                        warn!("Control connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Accept error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(mut stream: UnixStream, queue: ControlQueue) -> Result<()> {
    trace!("New control connection accepted");

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = MessageFrame::read_length(&len_buf)?;

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;

    let reply = match MessageFrame::decode(&body) {
        Ok(request) => {
            debug!("Control request: {:?}", request.frames);
            let rx = queue.submit(request.frames)?;
            match tokio::time::timeout(REPLY_TIMEOUT, rx).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => vec!["Error: Request dropped".to_string()],
                Err(_) => vec!["Error: Timed out".to_string()],
            }
        }
        Err(e) => {
            warn!("Malformed control request: {}", e);
            vec!["Error: Malformed request".to_string()]
        }
    };

    let bytes = MessageFrame::encode(&ControlMessage { frames: reply })?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;

    trace!("Control reply sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::client::ControlClient;
    use crate::daemon::waiter::MultiplexedWaiter;

    fn socket_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("supervisor-{}-{}.sock", tag, std::process::id()))
    }

    #[tokio::test]
    async fn queued_request_is_answered_from_the_loop() {
        let mut waiter = MultiplexedWaiter::new();
        let ready = waiter.add_entry("control");
        let (tx, mut inbox) = control_channel();
        let path = socket_path("roundtrip");
        let server = ControlServer::bind(&path, ControlQueue::new(tx, ready.clone())).unwrap();

        let client = ControlClient::new(server.path());
        let request = tokio::spawn(async move { client.request(&["ISRUNNING", "scanner"]).await });

        // Play the event loop: wait for readiness, answer everything queued.
        let tokens = waiter.poll(Duration::from_secs(10)).await;
        assert_eq!(tokens, vec![ready.token()]);
        let requests = inbox.drain();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].frames(), ["ISRUNNING", "scanner"]);
        for request in requests {
            request.respond(vec!["NOTRUNNING".to_string()]);
        }

        let reply = request.await.unwrap().unwrap();
        assert_eq!(reply, vec!["NOTRUNNING".to_string()]);

        drop(server);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn submit_fails_once_inbox_is_gone() {
        let mut waiter = MultiplexedWaiter::new();
        let ready = waiter.add_entry("control");
        let (tx, inbox) = control_channel();
        drop(inbox);

        let queue = ControlQueue::new(tx, ready);
        assert!(queue.submit(vec!["STOP".into(), "scanner".into()]).is_err());
    }
}
