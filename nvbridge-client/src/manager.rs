//! Connection lifecycle management
//!
//! The manager owns at most one [`ClientTransport`]. Requests connect lazily,
//! a dropped connection is reported once through the crash handler, and the
//! next request reconnects. Notifications never trigger a connect.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use nvbridge_protocol::Value;
use nvbridge_utils::{BridgeConfig, ClientConfig};

use crate::connection::{ClientTransport, ConnectionState, CrashCallback, DisconnectReason};
use crate::error::ClientError;
use crate::router::EventRouter;

/// Called when a live connection drops without [`ConnectionManager::disconnect`]
pub type CrashHandler = Arc<dyn Fn(&DisconnectReason) + Send + Sync>;

/// Manages the connection to the editor socket
pub struct ConnectionManager {
    socket_path: PathBuf,
    config: ClientConfig,
    router: EventRouter,
    /// Held across connect so only one transition runs at a time
    transport: Mutex<Option<Arc<ClientTransport>>>,
    state_tx: watch::Sender<ConnectionState>,
    crash_handler: Option<CrashHandler>,
}

impl ConnectionManager {
    /// Create a manager; nothing connects until first use
    ///
    /// Must be called within a tokio runtime, since the event router task
    /// starts here.
    pub fn new(socket_path: impl Into<PathBuf>, config: ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            socket_path: socket_path.into(),
            config,
            router: EventRouter::new(),
            transport: Mutex::new(None),
            state_tx,
            crash_handler: None,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.socket_path(), config.client.clone())
    }

    /// Register the crash-detection hook
    pub fn with_crash_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&DisconnectReason) + Send + Sync + 'static,
    {
        self.crash_handler = Some(Arc::new(handler));
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Event router for peer notifications and requests
    ///
    /// Subscriptions outlive reconnects.
    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Connect now if not already connected
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.ensure_connected().await.map(|_| ())
    }

    /// Request with the configured default timeout
    pub async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, ClientError> {
        self.request_with_timeout(method, params, self.config.request_timeout())
            .await
    }

    /// Request, connecting first if needed
    ///
    /// A non-nil error in the response becomes [`ClientError::Remote`].
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let transport = self.ensure_connected().await?;
        request_value(&transport, method, params, timeout).await
    }

    /// Fire-and-forget notification; fails immediately when not connected
    pub async fn notify(&self, method: &str, params: Vec<Value>) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let transport = self.transport.lock().await.clone();
        match transport {
            Some(transport) if !transport.is_closed() && self.is_connected() => {
                transport.notify(method, params).await
            }
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Close the connection on purpose
    ///
    /// Pending requests complete as cancelled and the crash handler is not
    /// invoked. Idempotent.
    pub async fn disconnect(&self) {
        let transport = self.transport.lock().await.take();
        if let Some(transport) = transport {
            transport.shutdown().await;
            info!(path = %self.socket_path.display(), "Disconnected");
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Run `operation` on a background task, connecting first if needed
    ///
    /// Exactly one of the callbacks is invoked with the outcome.
    pub fn perform<T, F, Fut, S, E>(self: &Arc<Self>, operation: F, on_success: S, on_failure: E) -> JoinHandle<()>
    where
        F: FnOnce(Arc<ClientTransport>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ClientError>> + Send + 'static,
        T: Send + 'static,
        S: FnOnce(T) + Send + 'static,
        E: FnOnce(ClientError) + Send + 'static,
    {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let result = match manager.ensure_connected().await {
                Ok(transport) => operation(transport).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(value) => on_success(value),
                Err(e) => {
                    debug!("Background operation failed: {}", e);
                    on_failure(e);
                }
            }
        })
    }

    /// [`perform`](Self::perform) for a single request
    pub fn spawn_request<S, E>(
        self: &Arc<Self>,
        method: &str,
        params: Vec<Value>,
        on_success: S,
        on_failure: E,
    ) -> JoinHandle<()>
    where
        S: FnOnce(Value) + Send + 'static,
        E: FnOnce(ClientError) + Send + 'static,
    {
        let method = method.to_string();
        let timeout = self.config.request_timeout();
        self.perform(
            move |transport| async move { request_value(&transport, &method, params, timeout).await },
            on_success,
            on_failure,
        )
    }

    async fn ensure_connected(&self) -> Result<Arc<ClientTransport>, ClientError> {
        let mut slot = self.transport.lock().await;

        // The crash callback flips the state before the old task finishes
        // closing, so check both.
        if let Some(transport) = slot.as_ref() {
            if !transport.is_closed() && self.is_connected() {
                return Ok(Arc::clone(transport));
            }
            debug!("Previous connection closed, reconnecting");
        }
        *slot = None;

        self.state_tx.send_replace(ConnectionState::Connecting);
        info!(path = %self.socket_path.display(), "Connecting");

        match ClientTransport::connect(
            &self.socket_path,
            &self.config,
            self.router.clone(),
            Some(self.crash_callback()),
        )
        .await
        {
            Ok(transport) => {
                let transport = Arc::new(transport);
                *slot = Some(Arc::clone(&transport));
                self.state_tx.send_replace(ConnectionState::Connected);
                Ok(transport)
            }
            Err(e) => {
                warn!("Connect failed: {}", e);
                self.state_tx.send_replace(ConnectionState::Error(e.to_string()));
                Err(e)
            }
        }
    }

    fn crash_callback(&self) -> CrashCallback {
        let state_tx = self.state_tx.clone();
        let handler = self.crash_handler.clone();

        Box::new(move |reason| {
            state_tx.send_replace(reason.resulting_state());
            if let Some(handler) = handler {
                handler(&reason);
            }
        })
    }
}

async fn request_value(
    transport: &ClientTransport,
    method: &str,
    params: Vec<Value>,
    timeout: Duration,
) -> Result<Value, ClientError> {
    let response = transport.request(method, params, timeout).await?;
    response.into_result().map_err(|error| ClientError::Remote {
        method: method.to_string(),
        error,
    })
}
