//! Unix socket listener
//!
//! Binds the socket, accepts clients, and runs one [`ClientSession`] per
//! connection until [`RpcServer::stop`] is called.

use std::future::Future;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixListener;
use tokio::sync::{broadcast, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use nvbridge_protocol::Value;
use nvbridge_utils::{BridgeConfig, BridgeError, Result, ServerConfig};

use crate::dispatch::{HandlerResult, HandlerTable};
use crate::session::{ClientSession, ConnectionGuard};

/// Longest socket path accepted; `sun_path` is 104 bytes on macOS, 108 on Linux
pub const MAX_SOCKET_PATH: usize = 104;

/// Pause after a failed accept so a persistent error (EMFILE) can't spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// msgpack-rpc server on a Unix domain socket
pub struct RpcServer {
    socket_path: PathBuf,
    config: ServerConfig,
    handlers: HandlerTable,
    connections: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcServer {
    /// Create a server with the built-in `ping` and `log` handlers
    pub fn new(socket_path: impl Into<PathBuf>, config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            socket_path: socket_path.into(),
            config,
            handlers: HandlerTable::with_builtins(),
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            accept_task: Mutex::new(None),
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.socket_path(), config.server.clone())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    /// Register an async method handler
    pub fn register<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.register(method, handler);
    }

    /// Register a method handler that needs no awaiting
    pub fn register_sync<F>(&self, method: &str, handler: F)
    where
        F: Fn(Vec<Value>) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers.register_sync(method, handler);
    }

    /// Number of connected clients
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub async fn is_running(&self) -> bool {
        self.accept_task.lock().await.is_some()
    }

    /// Bind the socket and start accepting clients
    ///
    /// A leftover socket from an earlier run is replaced; any other kind of
    /// file at the path is left alone and reported as an error. Calling
    /// `start` on a running server does nothing.
    pub async fn start(&self) -> Result<()> {
        let mut accept_task = self.accept_task.lock().await;
        if accept_task.is_some() {
            debug!("Server already running");
            return Ok(());
        }

        let listener = bind_listener(&self.socket_path, self.config.socket_mode)?;
        info!(path = %self.socket_path.display(), "Listening");

        let shutdown_rx = self.shutdown_tx.subscribe();
        *accept_task = Some(tokio::spawn(accept_loop(
            listener,
            self.handlers.clone(),
            Arc::clone(&self.connections),
            self.config.max_frame_bytes,
            shutdown_rx,
        )));

        Ok(())
    }

    /// Stop accepting, drop every client, and remove the socket file
    ///
    /// Idempotent.
    pub async fn stop(&self) {
        let Some(task) = self.accept_task.lock().await.take() else {
            return;
        };

        let _ = self.shutdown_tx.send(());
        if let Err(e) = task.await {
            error!("Accept loop ended abnormally: {}", e);
        }

        remove_socket_file(&self.socket_path);
        info!(path = %self.socket_path.display(), "Server stopped");
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.get_mut().take() {
            // Aborting the loop drops its JoinSet, which aborts the sessions
            task.abort();
            remove_socket_file(&self.socket_path);
        }
    }
}

/// Bind a listener with stale-file cleanup and restricted permissions
fn bind_listener(path: &Path, mode: u32) -> Result<UnixListener> {
    let len = path.as_os_str().len();
    if len >= MAX_SOCKET_PATH {
        return Err(BridgeError::SocketPathTooLong {
            path: path.to_path_buf(),
            len,
            max: MAX_SOCKET_PATH - 1,
        });
    }

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            warn!(path = %path.display(), "Removing stale socket");
            std::fs::remove_file(path).map_err(|e| BridgeError::FileWrite {
                path: path.to_path_buf(),
                source: e,
            })?;
        }
        Ok(_) => {
            return Err(BridgeError::NotASocket {
                path: path.to_path_buf(),
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(BridgeError::FileRead {
                path: path.to_path_buf(),
                source: e,
            })
        }
    }

    if let Some(parent) = path.parent() {
        nvbridge_utils::ensure_private_dir(parent)?;
    }

    let bind_err = |source| BridgeError::Bind {
        path: path.to_path_buf(),
        source,
    };

    let listener = std::os::unix::net::UnixListener::bind(path).map_err(bind_err)?;

    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }

    listener.set_nonblocking(true).map_err(bind_err)?;
    UnixListener::from_std(listener).map_err(bind_err)
}

fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed socket file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "Failed to remove socket file: {}", e),
    }
}

async fn back_off_after_accept_error(e: &std::io::Error) {
    error!("Accept error: {}", e);
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

async fn accept_loop(
    listener: UnixListener,
    handlers: HandlerTable,
    connections: Arc<AtomicUsize>,
    max_frame_size: usize,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let guard = ConnectionGuard::new(Arc::clone(&connections));
                        let session = ClientSession::new(handlers.clone(), max_frame_size, guard);
                        sessions.spawn(session.run(stream));
                    }
                    Err(e) => back_off_after_accept_error(&e).await,
                }
            }
            Some(result) = sessions.join_next() => {
                if let Err(e) = result {
                    if e.is_panic() {
                        error!("Client session panicked: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    sessions.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server.sock");
        let server = RpcServer::new(&path, ServerConfig::default());

        server.start().await.unwrap();
        assert!(path.exists());
        assert!(server.is_running().await);

        // Second start is a no-op
        server.start().await.unwrap();

        server.stop().await;
        assert!(!path.exists());
        assert!(!server.is_running().await);

        // Second stop is a no-op
        server.stop().await;
    }

    #[tokio::test]
    async fn test_socket_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("perm.sock");
        let server = RpcServer::new(&path, ServerConfig::default());
        server.start().await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_replaces_stale_socket_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        // A listener from a previous run leaves its socket file behind
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let server = RpcServer::new(&path, ServerConfig::default());
        server.start().await.unwrap();
        tokio::net::UnixStream::connect(&path).await.unwrap();

        server.stop().await;
    }

    #[tokio::test]
    async fn test_refuses_to_replace_regular_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"keep me").unwrap();

        let server = RpcServer::new(&path, ServerConfig::default());
        match server.start().await {
            Err(BridgeError::NotASocket { path: reported }) => assert_eq!(reported, path),
            other => panic!("Expected NotASocket, got {:?}", other),
        }
        assert!(!server.is_running().await);
        assert_eq!(std::fs::read(&path).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn test_creates_parent_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("run").join("s.sock");

        let server = RpcServer::new(&path, ServerConfig::default());
        server.start().await.unwrap();
        assert!(path.exists());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_rejects_long_path() {
        let long = PathBuf::from(format!("/tmp/{}.sock", "x".repeat(MAX_SOCKET_PATH)));
        let server = RpcServer::new(&long, ServerConfig::default());

        match server.start().await {
            Err(BridgeError::SocketPathTooLong { len, max, .. }) => {
                assert!(len >= MAX_SOCKET_PATH);
                assert_eq!(max, MAX_SOCKET_PATH - 1);
            }
            other => panic!("Expected SocketPathTooLong, got {:?}", other),
        }
        assert!(!server.is_running().await);
    }

    #[tokio::test]
    async fn test_accept_error_pauses_before_retrying() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "too many open files");
        let started = std::time::Instant::now();
        back_off_after_accept_error(&err).await;
        assert!(started.elapsed() >= ACCEPT_ERROR_BACKOFF);
    }

    #[tokio::test]
    async fn test_connection_count_tracks_clients() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("count.sock");
        let server = RpcServer::new(&path, ServerConfig::default());
        server.start().await.unwrap();
        assert_eq!(server.connection_count(), 0);

        let client = tokio::net::UnixStream::connect(&path).await.unwrap();
        while server.connection_count() != 1 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        drop(client);
        while server.connection_count() != 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn test_drop_removes_socket() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("drop.sock");
        {
            let server = RpcServer::new(&path, ServerConfig::default());
            server.start().await.unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
