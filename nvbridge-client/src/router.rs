//! Fan-out of peer-initiated messages to subscribers
//!
//! Subscriptions and dispatches travel over one FIFO channel into a single
//! router task, so handlers run one at a time in arrival order, and a
//! subscription made before a message arrives always sees it. The router is
//! independent of any connection and survives reconnects.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nvbridge_protocol::{
    BufDetachEvent, BufLinesEvent, EventParseError, Message, Notification, Request, Response, Value,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::connection::Command;
use crate::error::ClientError;

/// Opaque token returned by subscribe
pub type SubscriptionId = Uuid;

/// Subscriber callback
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// A notification or request initiated by the peer
#[derive(Debug, Clone)]
pub struct Event {
    pub method: String,
    pub params: Vec<Value>,
    /// Present when the peer expects a reply
    pub responder: Option<Responder>,
}

impl Event {
    pub fn notification(notification: Notification) -> Self {
        Self {
            method: notification.method,
            params: notification.params,
            responder: None,
        }
    }

    pub(crate) fn request(request: Request, responder: Responder) -> Self {
        Self {
            method: request.method,
            params: request.params,
            responder: Some(responder),
        }
    }

    pub fn is_request(&self) -> bool {
        self.responder.is_some()
    }
}

/// Reply handle for a peer request
///
/// Clones share one answered flag: the first `respond` whose reply is queued
/// wins and later calls fail with [`ClientError::AlreadyAnswered`]. A reply
/// that cannot be queued leaves the request unanswered. Requests are never
/// answered automatically.
#[derive(Clone)]
pub struct Responder {
    msgid: u32,
    outbound: mpsc::WeakSender<Command>,
    answered: Arc<AtomicBool>,
}

impl Responder {
    pub(crate) fn new(msgid: u32, outbound: mpsc::WeakSender<Command>) -> Self {
        Self {
            msgid,
            outbound,
            answered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn msgid(&self) -> u32 {
        self.msgid
    }

    pub fn is_answered(&self) -> bool {
        self.answered.load(Ordering::SeqCst)
    }

    /// Send the response; `Err` values go out in the error slot
    pub async fn respond(&self, result: Result<Value, Value>) -> Result<(), ClientError> {
        if self.answered.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyAnswered { msgid: self.msgid });
        }

        let response = match result {
            Ok(value) => Response::ok(self.msgid, value),
            Err(error) => Response::err(self.msgid, error),
        };

        let sent = match self.outbound.upgrade() {
            Some(outbound) => outbound
                .send(Command::Send(Message::Response(response)))
                .await
                .is_ok(),
            None => false,
        };

        if sent {
            Ok(())
        } else {
            self.answered.store(false, Ordering::SeqCst);
            Err(ClientError::ConnectionClosed)
        }
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("msgid", &self.msgid)
            .field("answered", &self.is_answered())
            .finish()
    }
}

struct Subscription {
    id: SubscriptionId,
    event_name: String,
    handler: EventHandler,
}

/// Subscriber table, in subscription order
#[derive(Default)]
pub struct SubscriptionTable {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, event_name: &str, handler: EventHandler) -> SubscriptionId {
        let id = Uuid::new_v4();
        self.insert(id, event_name.to_string(), handler);
        id
    }

    /// One subscription per name, all sharing `handler`
    pub fn subscribe_many(&mut self, event_names: &[&str], handler: EventHandler) -> Vec<SubscriptionId> {
        event_names
            .iter()
            .map(|name| self.subscribe(name, Arc::clone(&handler)))
            .collect()
    }

    fn insert(&mut self, id: SubscriptionId, event_name: String, handler: EventHandler) {
        self.subscriptions.push(Subscription {
            id,
            event_name,
            handler,
        });
    }

    /// Remove one subscription; unknown ids are a no-op
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != id);
        self.subscriptions.len() != before
    }

    /// Remove every subscription for `event_name`
    pub fn unsubscribe_event(&mut self, event_name: &str) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.event_name != event_name);
        before - self.subscriptions.len()
    }

    pub fn unsubscribe_all(&mut self) -> usize {
        let count = self.subscriptions.len();
        self.subscriptions.clear();
        count
    }

    pub fn handler_count(&self, event_name: &str) -> usize {
        self.subscriptions
            .iter()
            .filter(|s| s.event_name == event_name)
            .count()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Invoke every handler subscribed to `event.method`
    ///
    /// A panicking handler is logged and does not stop the others.
    pub fn dispatch(&self, event: &Event) -> usize {
        let mut invoked = 0;
        for sub in self.subscriptions.iter().filter(|s| s.event_name == event.method) {
            invoked += 1;
            if catch_unwind(AssertUnwindSafe(|| (sub.handler)(event))).is_err() {
                error!(event = %event.method, subscription = %sub.id, "Event handler panicked");
            }
        }

        if invoked == 0 {
            if event.is_request() {
                warn!(method = %event.method, "No subscriber for peer request, it will go unanswered");
            } else {
                debug!(method = %event.method, "No subscriber for notification");
            }
        }
        invoked
    }
}

enum RouterCommand {
    Subscribe {
        entries: Vec<(SubscriptionId, String)>,
        handler: EventHandler,
    },
    Unsubscribe(SubscriptionId),
    UnsubscribeEvent(String),
    UnsubscribeAll,
    Dispatch(Event),
    HandlerCount {
        event_name: String,
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to the router task
///
/// Cheap to clone; the task exits once every handle is dropped.
#[derive(Clone)]
pub struct EventRouter {
    tx: mpsc::UnboundedSender<RouterCommand>,
}

impl EventRouter {
    /// Spawn the router task. Must be called within a tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(router_task(rx));
        Self { tx }
    }

    pub fn subscribe<F>(&self, event_name: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.send(RouterCommand::Subscribe {
            entries: vec![(id, event_name.to_string())],
            handler: Arc::new(handler),
        });
        id
    }

    /// Subscribe one handler to several events; one id per name
    pub fn subscribe_many<F>(&self, event_names: &[&str], handler: F) -> Vec<SubscriptionId>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let entries: Vec<_> = event_names
            .iter()
            .map(|name| (Uuid::new_v4(), name.to_string()))
            .collect();
        let ids = entries.iter().map(|(id, _)| *id).collect();
        self.send(RouterCommand::Subscribe {
            entries,
            handler: Arc::new(handler),
        });
        ids
    }

    /// Subscribe with a payload parser in front of the handler
    ///
    /// Payloads that fail to parse are logged and dropped.
    pub fn subscribe_parsed<T, F>(
        &self,
        event_name: &str,
        parse: fn(&[Value]) -> Result<T, EventParseError>,
        handler: F,
    ) -> SubscriptionId
    where
        T: 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.subscribe(event_name, move |event| match parse(&event.params) {
            Ok(parsed) => handler(parsed),
            Err(e) => warn!("Dropping malformed event payload: {}", e),
        })
    }

    pub fn subscribe_buf_lines<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(BufLinesEvent) + Send + Sync + 'static,
    {
        self.subscribe_parsed(BufLinesEvent::NAME, BufLinesEvent::parse, handler)
    }

    pub fn subscribe_buf_detach<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(BufDetachEvent) + Send + Sync + 'static,
    {
        self.subscribe_parsed(BufDetachEvent::NAME, BufDetachEvent::parse, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.send(RouterCommand::Unsubscribe(id));
    }

    pub fn unsubscribe_event(&self, event_name: &str) {
        self.send(RouterCommand::UnsubscribeEvent(event_name.to_string()));
    }

    pub fn unsubscribe_all(&self) {
        self.send(RouterCommand::UnsubscribeAll);
    }

    /// Queue an event for delivery to its subscribers
    pub fn dispatch(&self, event: Event) {
        self.send(RouterCommand::Dispatch(event));
    }

    /// Number of handlers for `event_name`, after all earlier commands
    pub async fn handler_count(&self, event_name: &str) -> usize {
        let (reply, rx) = oneshot::channel();
        self.send(RouterCommand::HandlerCount {
            event_name: event_name.to_string(),
            reply,
        });
        rx.await.unwrap_or(0)
    }

    fn send(&self, command: RouterCommand) {
        if self.tx.send(command).is_err() {
            debug!("Event router task has stopped");
        }
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

async fn router_task(mut rx: mpsc::UnboundedReceiver<RouterCommand>) {
    let mut table = SubscriptionTable::new();

    while let Some(command) = rx.recv().await {
        match command {
            RouterCommand::Subscribe { entries, handler } => {
                for (id, event_name) in entries {
                    debug!(event = %event_name, subscription = %id, "Subscribed");
                    table.insert(id, event_name, Arc::clone(&handler));
                }
            }
            RouterCommand::Unsubscribe(id) => {
                table.unsubscribe(id);
            }
            RouterCommand::UnsubscribeEvent(event_name) => {
                let removed = table.unsubscribe_event(&event_name);
                debug!(event = %event_name, removed, "Unsubscribed event");
            }
            RouterCommand::UnsubscribeAll => {
                table.unsubscribe_all();
            }
            RouterCommand::Dispatch(event) => {
                table.dispatch(&event);
            }
            RouterCommand::HandlerCount { event_name, reply } => {
                let _ = reply.send(table.handler_count(&event_name));
            }
        }
    }

    debug!("Event router stopped");
}
