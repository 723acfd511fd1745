use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

/// Identifies one registered event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(usize);

/// Write end of a self-pipe. Cheap to clone and safe to use from any thread.
#[derive(Debug, Clone)]
pub struct PipeWriter {
    token: Token,
    tx: mpsc::UnboundedSender<Token>,
}

impl PipeWriter {
    pub fn token(&self) -> Token {
        self.token
    }

    /// Mark the entry ready. A write after the waiter is gone is dropped.
    pub fn notify(&self) {
        let _ = self.tx.send(self.token);
    }
}

pub struct MultiplexedWaiter {
    tx: mpsc::UnboundedSender<Token>,
    rx: mpsc::UnboundedReceiver<Token>,
    labels: Vec<String>,
}

impl MultiplexedWaiter {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            labels: Vec::new(),
        }
    }

    /// Register a new source. Tokens are handed out in registration order.
    pub fn add_entry(&mut self, label: impl Into<String>) -> PipeWriter {
        let token = Token(self.labels.len());
        self.labels.push(label.into());
        PipeWriter {
            token,
            tx: self.tx.clone(),
        }
    }

    pub fn label(&self, token: Token) -> &str {
        self.labels.get(token.0).map(String::as_str).unwrap_or("unknown")
    }

    /// Wait up to `timeout` for readiness. Returns each ready token once, in
    /// registration order; an empty result means the timeout expired.
    pub async fn poll(&mut self, timeout: Duration) -> Vec<Token> {
        let mut ready = BTreeSet::new();

        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(token)) => {
                ready.insert(token);
            }
            // Unreachable while we hold our own sender, but never spin on it.
            Ok(None) => return Vec::new(),
            Err(_) => {
                trace!("Wait timed out after {:?}", timeout);
                return Vec::new();
            }
        }

        while let Ok(token) = self.rx.try_recv() {
            ready.insert(token);
        }

        ready.into_iter().collect()
    }
}

impl Default for MultiplexedWaiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_times_out_without_writes() {
        let mut waiter = MultiplexedWaiter::new();
        let _pipe = waiter.add_entry("idle");

        let ready = waiter.poll(Duration::from_millis(20)).await;
        assert!(ready.is_empty());
    }

    #[tokio::test]
    async fn poll_drains_and_dedups_in_registration_order() {
        let mut waiter = MultiplexedWaiter::new();
        let first = waiter.add_entry("first");
        let second = waiter.add_entry("second");

        second.notify();
        second.notify();
        first.notify();

        let ready = waiter.poll(Duration::from_secs(1)).await;
        assert_eq!(ready, vec![first.token(), second.token()]);
        assert_eq!(waiter.label(first.token()), "first");

        // Everything was drained by the previous poll.
        let ready = waiter.poll(Duration::from_millis(20)).await;
        assert!(ready.is_empty());
    }

    #[tokio::test]
    async fn writes_from_other_threads_wake_the_poll() {
        let mut waiter = MultiplexedWaiter::new();
        let pipe = waiter.add_entry("callback");

        let writer = pipe.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.notify();
        });

        let ready = waiter.poll(Duration::from_secs(5)).await;
        assert_eq!(ready, vec![pipe.token()]);
    }
}
