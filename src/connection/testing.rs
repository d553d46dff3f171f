//! Scriptable transport for unit tests.

use super::peer::PeerHandle;
use super::transport::Transport;
use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::HashSet;
use std::pin::pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct Attempt {
    pub peer_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub delivered: bool,
}

impl Attempt {
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap()
    }
}

pub struct MockTransport {
    peers: Mutex<Vec<PeerHandle>>,
    attempts: Mutex<Vec<Attempt>>,
    failing: Mutex<HashSet<usize>>,
    fail_queries: AtomicBool,
    sent: Notify,
}

impl MockTransport {
    pub fn new(peers: Vec<PeerHandle>) -> Self {
        Self {
            peers: Mutex::new(peers),
            attempts: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            fail_queries: AtomicBool::new(false),
            sent: Notify::new(),
        }
    }

    pub fn set_peers(&self, peers: Vec<PeerHandle>) {
        *self.peers.lock().unwrap() = peers;
    }

    /// Make the n-th send attempt (1-based) fail
    pub fn fail_attempt(&self, n: usize) {
        self.failing.lock().unwrap().insert(n);
    }

    pub fn fail_peer_queries(&self) {
        self.fail_queries.store(true, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().unwrap().clone()
    }

    fn delivered(&self) -> Vec<Attempt> {
        self.attempts().into_iter().filter(|a| a.delivered).collect()
    }

    pub fn topics(&self) -> Vec<String> {
        self.delivered().into_iter().map(|a| a.topic).collect()
    }

    pub fn payloads(&self) -> Vec<String> {
        self.delivered()
            .into_iter()
            .map(|a| String::from_utf8(a.payload).unwrap())
            .collect()
    }

    pub fn count_topic(&self, topic: &str) -> usize {
        self.topics().iter().filter(|t| *t == topic).count()
    }

    pub async fn wait_for_attempts(&self, n: usize) {
        let wait = async {
            loop {
                let mut notified = pin!(self.sent.notified());
                notified.as_mut().enable();
                if self.attempts.lock().unwrap().len() >= n {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(60), wait)
            .await
            .expect("transport never saw the expected sends");
    }

    /// Wait until `topic` has been delivered at least `n` times
    pub async fn wait_for_topic(&self, topic: &str, n: usize) {
        let wait = async {
            loop {
                let mut notified = pin!(self.sent.notified());
                notified.as_mut().enable();
                if self.count_topic(topic) >= n {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(60), wait)
            .await
            .expect("topic was never delivered");
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connected_peers(&self) -> Result<Vec<PeerHandle>> {
        if self.fail_queries.load(Ordering::SeqCst) {
            bail!("node client unavailable");
        }
        Ok(self.peers.lock().unwrap().clone())
    }

    async fn send(&self, peer_id: &str, topic: &str, payload: &[u8]) -> Result<()> {
        let result = {
            let mut attempts = self.attempts.lock().unwrap();
            let number = attempts.len() + 1;
            let delivered = !self.failing.lock().unwrap().contains(&number);
            attempts.push(Attempt {
                peer_id: peer_id.to_string(),
                topic: topic.to_string(),
                payload: payload.to_vec(),
                delivered,
            });
            delivered
        };
        self.sent.notify_waiters();

        if result {
            Ok(())
        } else {
            bail!("simulated send failure")
        }
    }
}
