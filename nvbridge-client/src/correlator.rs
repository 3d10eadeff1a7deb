//! Pairing of outbound requests with inbound responses
//!
//! The correlator is owned by the connection task, so it needs no locking.
//! Every registered request completes exactly once: with the matching
//! response, on its deadline, or when the connection drains.

use std::collections::HashMap;

use nvbridge_protocol::Response;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome delivered to a request's caller
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Response(Response),
    TimedOut,
    /// The connection closed before a response arrived
    Cancelled,
}

struct Pending {
    deadline: Instant,
    reply: oneshot::Sender<Completion>,
}

/// In-flight request table keyed by msgid
#[derive(Default)]
pub struct RequestCorrelator {
    pending: HashMap<u32, Pending>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and get the handle its outcome arrives on
    pub fn register(&mut self, msgid: u32, deadline: Instant) -> oneshot::Receiver<Completion> {
        let (tx, rx) = oneshot::channel();
        self.track(msgid, deadline, tx);
        rx
    }

    /// Register a request whose completion channel was created by the caller
    pub fn track(&mut self, msgid: u32, deadline: Instant, reply: oneshot::Sender<Completion>) {
        if let Some(previous) = self.pending.insert(msgid, Pending { deadline, reply }) {
            // Only reachable after the msgid counter wrapped onto a request
            // that is still outstanding.
            warn!(msgid, "msgid reused while still pending, cancelling older request");
            let _ = previous.reply.send(Completion::Cancelled);
        }
    }

    /// Complete the request matching `response.msgid`
    ///
    /// Returns false for unknown or already-completed msgids; those
    /// responses are dropped.
    pub fn resolve(&mut self, response: Response) -> bool {
        match self.pending.remove(&response.msgid) {
            Some(pending) => {
                // The caller may have stopped waiting; nothing to do then.
                let _ = pending.reply.send(Completion::Response(response));
                true
            }
            None => {
                debug!(msgid = response.msgid, "Dropping response for unknown msgid");
                false
            }
        }
    }

    /// Complete a single request with [`Completion::TimedOut`]
    pub fn expire(&mut self, msgid: u32) -> bool {
        match self.pending.remove(&msgid) {
            Some(pending) => {
                let _ = pending.reply.send(Completion::TimedOut);
                true
            }
            None => false,
        }
    }

    /// Time out every request whose deadline is at or before `now`
    pub fn expire_due(&mut self, now: Instant) -> usize {
        let due: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for msgid in &due {
            debug!(msgid, "Request deadline passed");
            self.expire(*msgid);
        }
        due.len()
    }

    /// Earliest deadline among pending requests
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Cancel everything in flight; used when the connection goes away
    pub fn drain_on_disconnect(&mut self) -> usize {
        let count = self.pending.len();
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Completion::Cancelled);
        }
        count
    }

    pub fn contains(&self, msgid: u32) -> bool {
        self.pending.contains_key(&msgid)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
