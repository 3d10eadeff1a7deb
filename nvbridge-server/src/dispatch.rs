//! Method handler table
//!
//! Routes inbound requests and notifications by method name. Handlers are
//! shared by every client session; registering or removing one takes effect
//! for the next message on any connection.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use nvbridge_protocol::{Notification, Request, Response, Value};

/// Handler outcome; `Err` goes out in the response's error slot
pub type HandlerResult = Result<Value, Value>;

/// Type-erased async handler
pub type BoxedHandler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Error value sent back for a method nobody handles
pub fn unknown_method_error(method: &str) -> Value {
    Value::from(format!("no handler registered for method '{}'", method))
}

/// Shared method-name to handler map
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: Arc<DashMap<String, BoxedHandler>>,
}

impl HandlerTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Table preloaded with `ping` and `log`
    pub fn with_builtins() -> Self {
        let table = Self::new();
        table.register_sync("ping", |_| Ok(Value::from("pong")));
        table.register_sync("log", |params| {
            info!(target: "nvbridge::remote", "{}", render_log_line(&params));
            Ok(Value::Nil)
        });
        table
    }

    /// Register an async handler, replacing any previous one for `method`
    pub fn register<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let boxed: BoxedHandler = Arc::new(move |params| handler(params).boxed());
        if self.handlers.insert(method.to_string(), boxed).is_some() {
            debug!(method, "Replaced handler");
        }
    }

    /// Register a handler that completes without awaiting
    pub fn register_sync<F>(&self, method: &str, handler: F)
    where
        F: Fn(Vec<Value>) -> HandlerResult + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.register(method, move |params| {
            let handler = Arc::clone(&handler);
            async move { handler(params) }
        });
    }

    pub fn unregister(&self, method: &str) -> bool {
        self.handlers.remove(method).is_some()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered method names, sorted
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        methods.sort();
        methods
    }

    // Clone the handler out so no shard lock is held across an await
    fn get(&self, method: &str) -> Option<BoxedHandler> {
        self.handlers.get(method).map(|entry| Arc::clone(entry.value()))
    }

    /// Run the handler for `request` and build its response
    ///
    /// Unknown methods and panicking handlers become error responses.
    pub async fn handle_request(&self, request: Request) -> Response {
        let Request { msgid, method, params } = request;

        let Some(handler) = self.get(&method) else {
            warn!(method = %method, msgid, "Request for unknown method");
            return Response::err(msgid, unknown_method_error(&method));
        };

        match AssertUnwindSafe(handler(params)).catch_unwind().await {
            Ok(Ok(result)) => Response::ok(msgid, result),
            Ok(Err(error)) => {
                debug!(method = %method, msgid, %error, "Handler returned error");
                Response::err(msgid, error)
            }
            Err(_) => {
                error!(method = %method, msgid, "Handler panicked");
                Response::err(msgid, Value::from(format!("handler for method '{}' panicked", method)))
            }
        }
    }

    /// Run the handler for `notification`; the result is discarded
    pub async fn handle_notification(&self, notification: Notification) {
        let Notification { method, params } = notification;

        let Some(handler) = self.get(&method) else {
            debug!(method = %method, "Notification for unknown method");
            return;
        };

        match AssertUnwindSafe(handler(params)).catch_unwind().await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => debug!(method = %method, %error, "Notification handler failed"),
            Err(_) => error!(method = %method, "Notification handler panicked"),
        }
    }
}

fn render_log_line(params: &[Value]) -> String {
    params
        .iter()
        .map(|p| match p.as_str() {
            Some(s) => s.to_string(),
            None => p.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_builtin_ping() {
        let table = HandlerTable::with_builtins();
        let response = table.handle_request(Request::new(1, "ping", vec![])).await;
        assert_eq!(response, Response::ok(1, Value::from("pong")));
    }

    #[test]
    fn test_builtins_registered() {
        let table = HandlerTable::with_builtins();
        assert_eq!(table.methods(), vec!["log".to_string(), "ping".to_string()]);
        assert!(HandlerTable::new().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_method_names_method() {
        let table = HandlerTable::new();
        let response = table.handle_request(Request::new(4, "nope", vec![])).await;
        assert_eq!(response.msgid, 4);
        assert_eq!(
            response.error,
            Value::from("no handler registered for method 'nope'")
        );
        assert_eq!(response.result, Value::Nil);
    }

    #[tokio::test]
    async fn test_async_handler_result() {
        let table = HandlerTable::new();
        table.register("add", |params: Vec<Value>| async move {
            let sum: i64 = params.iter().filter_map(Value::as_i64).sum();
            Ok(Value::from(sum))
        });

        let response = table
            .handle_request(Request::new(2, "add", vec![Value::from(2), Value::from(3)]))
            .await;
        assert_eq!(response.into_result(), Ok(Value::from(5)));
    }

    #[tokio::test]
    async fn test_handler_error_goes_in_error_slot() {
        let table = HandlerTable::new();
        table.register_sync("reject", |_| Err(Value::from("denied")));

        let response = table.handle_request(Request::new(3, "reject", vec![])).await;
        assert_eq!(response, Response::err(3, Value::from("denied")));
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_error_response() {
        let table = HandlerTable::new();
        table.register_sync("boom", |_| panic!("bug"));

        let response = table.handle_request(Request::new(5, "boom", vec![])).await;
        assert!(response.is_error());
        assert_eq!(response.msgid, 5);
    }

    #[tokio::test]
    async fn test_notification_invokes_handler() {
        let table = HandlerTable::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        table.register_sync("tick", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Nil)
        });

        table.handle_notification(Notification::new("tick", vec![])).await;
        table.handle_notification(Notification::new("unknown", vec![])).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_replaces_and_unregister() {
        let table = HandlerTable::new();
        table.register_sync("m", |_| Ok(Value::from(1)));
        table.register_sync("m", |_| Ok(Value::from(2)));
        assert_eq!(table.len(), 1);
        assert!(table.unregister("m"));
        assert!(!table.contains("m"));
        assert!(!table.unregister("m"));
    }

    #[test]
    fn test_render_log_line() {
        let line = render_log_line(&[Value::from("hello"), Value::from(3), Value::Nil]);
        assert_eq!(line, "hello 3 nil");
    }
}
