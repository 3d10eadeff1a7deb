//! Client transport over a Unix socket

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use nvbridge_protocol::{Frame, Message, Notification, Request, Response, RpcCodec, Value};
use nvbridge_utils::ClientConfig;

use super::state::DisconnectReason;
use crate::correlator::{Completion, RequestCorrelator};
use crate::error::ClientError;
use crate::router::{Event, EventRouter, Responder};

/// Buffered commands before callers start waiting on the connection task
const COMMAND_CHANNEL_SIZE: usize = 100;

/// How long an intentional shutdown waits for queued frames to flush
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Sleep target used when nothing is pending; the branch is disabled anyway
const IDLE_SWEEP: Duration = Duration::from_secs(3600);

/// Invoked once when the connection drops without a local shutdown
pub type CrashCallback = Box<dyn FnOnce(DisconnectReason) + Send + 'static>;

/// Work handed to the connection task
pub(crate) enum Command {
    Request {
        request: Request,
        deadline: Instant,
        reply: oneshot::Sender<Completion>,
    },
    /// Notifications and responses; nothing to correlate
    Send(Message),
    Expire(u32),
    PendingCount(oneshot::Sender<usize>),
    /// Acknowledged once queued frames are flushed
    Shutdown(oneshot::Sender<()>),
}

/// One live connection to the peer
///
/// Dropping the transport stops its background task just like
/// [`shutdown`](Self::shutdown), without waiting for it.
pub struct ClientTransport {
    socket_path: PathBuf,
    commands: mpsc::Sender<Command>,
    next_msgid: AtomicU32,
}

impl ClientTransport {
    /// Connect using the retry policy in `config`
    pub async fn connect(
        socket_path: &Path,
        config: &ClientConfig,
        router: EventRouter,
        on_crash: Option<CrashCallback>,
    ) -> Result<Self, ClientError> {
        let stream = connect_with_retry(
            socket_path,
            config.connect_attempts,
            config.connect_retry_delay(),
            config.connect_timeout(),
        )
        .await?;

        Ok(Self::from_stream(socket_path.to_path_buf(), stream, router, on_crash))
    }

    /// Wrap an already-connected stream and start its tasks
    pub fn from_stream(
        socket_path: PathBuf,
        stream: UnixStream,
        router: EventRouter,
        on_crash: Option<CrashCallback>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (read_half, write_half) = stream.into_split();

        tokio::spawn(connection_task(
            read_half,
            write_half,
            rx,
            tx.downgrade(),
            router,
            on_crash,
        ));

        info!(path = %socket_path.display(), "Connected");

        Self {
            socket_path,
            commands: tx,
            next_msgid: AtomicU32::new(1),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// True once the connection task has stopped accepting work
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Allocate the next msgid; wraps to 1 and never yields 0
    pub fn next_msgid(&self) -> u32 {
        self.next_msgid
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                Some(if id == u32::MAX { 1 } else { id + 1 })
            })
            .unwrap_or_else(|id| id)
    }

    /// Send a request and wait for its response, at most `timeout`
    ///
    /// A response carrying an error value is still `Ok`; callers decide how
    /// to treat it.
    pub async fn request(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Response, ClientError> {
        let msgid = self.next_msgid();
        let deadline = Instant::now() + timeout;
        let (reply, completion) = oneshot::channel();

        self.commands
            .send(Command::Request {
                request: Request::new(msgid, method, params),
                deadline,
                reply,
            })
            .await
            .map_err(|_| ClientError::NotConnected)?;

        let timed_out = || ClientError::Timeout {
            method: method.to_string(),
            timeout,
        };

        match tokio::time::timeout_at(deadline, completion).await {
            Ok(Ok(Completion::Response(response))) => Ok(response),
            Ok(Ok(Completion::TimedOut)) => Err(timed_out()),
            Ok(Ok(Completion::Cancelled)) | Ok(Err(_)) => Err(ClientError::Cancelled {
                method: method.to_string(),
            }),
            Err(_) => {
                // The task's own sweep may race us here; expiring twice is harmless.
                let _ = self.commands.try_send(Command::Expire(msgid));
                Err(timed_out())
            }
        }
    }

    /// Fire-and-forget notification
    pub async fn notify(&self, method: &str, params: Vec<Value>) -> Result<(), ClientError> {
        let message = Notification::new(method, params).into_message();
        self.commands
            .send(Command::Send(message))
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    /// Number of requests awaiting a response
    pub async fn pending_requests(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::PendingCount(reply)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Stop the connection and wait for its task to finish
    ///
    /// Outstanding requests complete as cancelled. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self.commands.send(Command::Shutdown(done)).await.is_ok() {
            let _ = finished.await;
        }
    }
}

/// Dial `path`, retrying with a fixed delay within the overall budget
async fn connect_with_retry(
    path: &Path,
    max_attempts: u32,
    retry_delay: Duration,
    budget: Duration,
) -> Result<UnixStream, ClientError> {
    let deadline = Instant::now() + budget;
    let mut attempts = 0;
    let mut last_error = String::from("no connection attempt made");

    while attempts < max_attempts {
        attempts += 1;
        match tokio::time::timeout_at(deadline, UnixStream::connect(path)).await {
            Ok(Ok(stream)) => {
                debug!(attempt = attempts, "Socket connected");
                return Ok(stream);
            }
            Ok(Err(e)) => {
                debug!(attempt = attempts, error = %e, "Connect attempt failed");
                last_error = e.to_string();
            }
            Err(_) => {
                last_error = format!("connect timed out after {:?}", budget);
                break;
            }
        }

        if attempts < max_attempts {
            if Instant::now() + retry_delay >= deadline {
                break;
            }
            tokio::time::sleep(retry_delay).await;
        }
    }

    warn!(path = %path.display(), attempts, "Giving up on connect: {}", last_error);
    Err(ClientError::ConnectFailed {
        path: path.to_path_buf(),
        attempts,
        cause: last_error,
    })
}

/// Background task that owns the read half and the correlator
async fn connection_task(
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
    mut commands: mpsc::Receiver<Command>,
    responder_tx: mpsc::WeakSender<Command>,
    router: EventRouter,
    on_crash: Option<CrashCallback>,
) {
    let mut reader = FramedRead::new(read_half, RpcCodec::new());
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let (write_failed_tx, mut write_failed) = oneshot::channel();
    let writer = tokio::spawn(write_task(write_half, frames_rx, write_failed_tx));
    let mut correlator = RequestCorrelator::new();
    let mut shutdown_acks = Vec::new();

    let reason = loop {
        let next_deadline = correlator.next_deadline();
        let sweep_at = next_deadline.unwrap_or_else(|| Instant::now() + IDLE_SWEEP);

        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Request { request, deadline, reply }) => {
                    debug!(msgid = request.msgid, method = %request.method, "Sending request");
                    correlator.track(request.msgid, deadline, reply);
                    // A dead writer reports through write_failed on the next turn
                    let _ = frames_tx.send(Message::Request(request));
                }
                Some(Command::Send(message)) => {
                    let _ = frames_tx.send(message);
                }
                Some(Command::Expire(msgid)) => {
                    correlator.expire(msgid);
                }
                Some(Command::PendingCount(reply)) => {
                    let _ = reply.send(correlator.len());
                }
                Some(Command::Shutdown(done)) => {
                    shutdown_acks.push(done);
                    break DisconnectReason::Requested;
                }
                None => break DisconnectReason::Requested,
            },

            frame = reader.next() => match frame {
                Some(Ok(Frame::Message(message))) => {
                    route_incoming(message, &mut correlator, &router, &responder_tx);
                }
                Some(Ok(Frame::Invalid(e))) => {
                    warn!("Skipping malformed frame from peer: {}", e);
                }
                Some(Err(e)) => {
                    error!("Failed to read from socket: {}", e);
                    break DisconnectReason::ReadFailed(e.to_string());
                }
                None => {
                    info!("Peer closed connection");
                    break DisconnectReason::PeerClosed;
                }
            },

            result = &mut write_failed => {
                let cause = result.unwrap_or_else(|_| "writer stopped".to_string());
                break DisconnectReason::WriteFailed(cause);
            }

            _ = tokio::time::sleep_until(sweep_at), if next_deadline.is_some() => {
                let expired = correlator.expire_due(Instant::now());
                debug!(expired, "Swept overdue requests");
            }
        }
    };

    // Publish the loss before waking any caller, so a caller that retries
    // on `Cancelled` finds this transport closed and reconnects.
    let requested = reason.is_requested();
    commands.close();
    if !requested {
        writer.abort();
        warn!(?reason, "Connection lost");
        if let Some(on_crash) = on_crash {
            on_crash(reason);
        }
    }

    let cancelled = correlator.drain_on_disconnect();
    if cancelled > 0 {
        debug!(cancelled, "Cancelled in-flight requests");
    }

    // Anything queued after the loop stopped never reached the socket
    while let Ok(command) = commands.try_recv() {
        match command {
            Command::Request { reply, .. } => {
                let _ = reply.send(Completion::Cancelled);
            }
            Command::PendingCount(reply) => {
                let _ = reply.send(0);
            }
            Command::Shutdown(done) => shutdown_acks.push(done),
            Command::Send(_) | Command::Expire(_) => {}
        }
    }

    drop(frames_tx);
    if requested {
        if tokio::time::timeout(FLUSH_TIMEOUT, writer).await.is_err() {
            warn!("Timed out flushing outbound frames");
        }
        info!("Disconnected");
    }

    for done in shutdown_acks {
        let _ = done.send(());
    }
}

fn route_incoming(
    message: Message,
    correlator: &mut RequestCorrelator,
    router: &EventRouter,
    responder_tx: &mpsc::WeakSender<Command>,
) {
    match message {
        Message::Response(response) => {
            correlator.resolve(response);
        }
        Message::Notification(notification) => {
            router.dispatch(Event::notification(notification));
        }
        Message::Request(request) => {
            debug!(msgid = request.msgid, method = %request.method, "Peer request");
            let responder = Responder::new(request.msgid, responder_tx.clone());
            router.dispatch(Event::request(request, responder));
        }
    }
}

/// Serializes outbound frames so a slow peer never stalls reads
async fn write_task(
    write_half: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Message>,
    failed: oneshot::Sender<String>,
) {
    let mut writer = FramedWrite::new(write_half, RpcCodec::new());

    while let Some(message) = frames.recv().await {
        if let Err(e) = writer.send(message).await {
            error!("Failed to write to socket: {}", e);
            let _ = failed.send(e.to_string());
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::net::UnixListener;

    type ServerReader = FramedRead<OwnedReadHalf, RpcCodec>;
    type ServerWriter = FramedWrite<OwnedWriteHalf, RpcCodec>;

    fn fast_config() -> ClientConfig {
        ClientConfig {
            connect_attempts: 2,
            connect_retry_delay_ms: 10,
            connect_timeout_ms: 1000,
            ..ClientConfig::default()
        }
    }

    async fn accept(listener: &UnixListener) -> (ServerReader, ServerWriter) {
        let (stream, _) = listener.accept().await.unwrap();
        let (r, w) = stream.into_split();
        (FramedRead::new(r, RpcCodec::new()), FramedWrite::new(w, RpcCodec::new()))
    }

    async fn next_request(reader: &mut ServerReader) -> Option<Request> {
        loop {
            match reader.next().await? {
                Ok(Frame::Message(Message::Request(request))) => return Some(request),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    #[tokio::test]
    async fn test_connect_no_server() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.sock");

        let result = ClientTransport::connect(&path, &fast_config(), EventRouter::new(), None).await;
        match result {
            Err(ClientError::ConnectFailed { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("Expected ConnectFailed, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_connect_budget_cuts_retries_short() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.sock");
        let config = ClientConfig {
            connect_attempts: 10,
            connect_retry_delay_ms: 50,
            connect_timeout_ms: 120,
            ..ClientConfig::default()
        };

        let started = std::time::Instant::now();
        let result = ClientTransport::connect(&path, &config, EventRouter::new(), None).await;
        let elapsed = started.elapsed();

        match result {
            Err(ClientError::ConnectFailed { attempts, .. }) => {
                assert!((2..10).contains(&attempts), "made {} attempts", attempts);
            }
            other => panic!("Expected ConnectFailed, got {:?}", other.map(|_| ())),
        }
        // At least one retry delay, and no sleep past the budget
        assert!(elapsed >= Duration::from_millis(50), "gave up after {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(500), "ran for {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_msgid_wraps_to_one() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(async move { listener.accept().await.unwrap() });

        let transport = ClientTransport::connect(&path, &fast_config(), EventRouter::new(), None)
            .await
            .unwrap();
        assert_eq!(transport.next_msgid(), 1);
        assert_eq!(transport.next_msgid(), 2);

        transport.next_msgid.store(u32::MAX, Ordering::Relaxed);
        assert_eq!(transport.next_msgid(), u32::MAX);
        assert_eq!(transport.next_msgid(), 1);

        transport.shutdown().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut reader, mut writer) = accept(&listener).await;
            let mut requests = Vec::new();
            while requests.len() < 3 {
                requests.push(next_request(&mut reader).await.unwrap());
            }
            for request in requests.into_iter().rev() {
                let echo = request.params[0].clone();
                writer
                    .send(Message::Response(Response::ok(request.msgid, echo)))
                    .await
                    .unwrap();
            }
            // Hold the connection until the client hangs up
            while reader.next().await.is_some() {}
        });

        let transport = ClientTransport::connect(&path, &fast_config(), EventRouter::new(), None)
            .await
            .unwrap();
        let timeout = Duration::from_secs(5);
        let (a, b, c) = tokio::join!(
            transport.request("echo", vec![Value::from("a")], timeout),
            transport.request("echo", vec![Value::from("b")], timeout),
            transport.request("echo", vec![Value::from("c")], timeout),
        );

        assert_eq!(a.unwrap().result, Value::from("a"));
        assert_eq!(b.unwrap().result, Value::from("b"));
        assert_eq!(c.unwrap().result, Value::from("c"));
        assert_eq!(transport.pending_requests().await, 0);

        transport.shutdown().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_response_is_delivered() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut reader, mut writer) = accept(&listener).await;
            let request = next_request(&mut reader).await.unwrap();
            writer
                .send(Message::Response(Response::err(request.msgid, Value::from("bad"))))
                .await
                .unwrap();
            while reader.next().await.is_some() {}
        });

        let transport = ClientTransport::connect(&path, &fast_config(), EventRouter::new(), None)
            .await
            .unwrap();
        let response = transport
            .request("fail", vec![], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(response.is_error());
        assert_eq!(response.into_result(), Err(Value::from("bad")));

        transport.shutdown().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sock");
        let listener = UnixListener::bind(&path).unwrap();

        // Reads but never answers
        let server = tokio::spawn(async move {
            let (mut reader, _writer) = accept(&listener).await;
            while reader.next().await.is_some() {}
        });

        let transport = ClientTransport::connect(&path, &fast_config(), EventRouter::new(), None)
            .await
            .unwrap();
        let result = transport
            .request("slow", vec![], Duration::from_millis(50))
            .await;

        match result {
            Err(ClientError::Timeout { method, timeout }) => {
                assert_eq!(method, "slow");
                assert_eq!(timeout, Duration::from_millis(50));
            }
            other => panic!("Expected Timeout, got {:?}", other),
        }
        assert_eq!(transport.pending_requests().await, 0);

        transport.shutdown().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_requests() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut reader, _writer) = accept(&listener).await;
            while reader.next().await.is_some() {}
        });

        let crashed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let crashed_flag = Arc::clone(&crashed);
        let on_crash: CrashCallback = Box::new(move |_| crashed_flag.store(true, Ordering::SeqCst));

        let transport = Arc::new(
            ClientTransport::connect(&path, &fast_config(), EventRouter::new(), Some(on_crash))
                .await
                .unwrap(),
        );

        let mut callers = Vec::new();
        for _ in 0..3 {
            let transport = Arc::clone(&transport);
            callers.push(tokio::spawn(async move {
                transport.request("hang", vec![], Duration::from_secs(30)).await
            }));
        }
        while transport.pending_requests().await < 3 {
            tokio::task::yield_now().await;
        }

        transport.shutdown().await;
        assert!(transport.is_closed());

        for caller in callers {
            assert!(matches!(
                caller.await.unwrap(),
                Err(ClientError::Cancelled { .. })
            ));
        }
        assert!(!crashed.load(Ordering::SeqCst));
        assert!(matches!(
            transport.notify("late", vec![]).await,
            Err(ClientError::NotConnected)
        ));

        // Repeated shutdown is a no-op
        transport.shutdown().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_reports_crash_and_cancels() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut reader, writer) = accept(&listener).await;
            next_request(&mut reader).await.unwrap();
            drop(writer);
            drop(reader);
        });

        let (crash_tx, crash_rx) = oneshot::channel();
        let on_crash: CrashCallback = Box::new(move |reason| {
            let _ = crash_tx.send(reason);
        });

        let transport = ClientTransport::connect(&path, &fast_config(), EventRouter::new(), Some(on_crash))
            .await
            .unwrap();
        let result = transport
            .request("doomed", vec![], Duration::from_secs(5))
            .await;

        assert!(matches!(result, Err(ClientError::Cancelled { method }) if method == "doomed"));
        assert_eq!(crash_rx.await.unwrap(), DisconnectReason::PeerClosed);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_notification_is_routed_to_subscribers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut reader, mut writer) = accept(&listener).await;
            writer
                .send(Notification::new("nvim_buf_detach_event", vec![Value::from(4)]).into_message())
                .await
                .unwrap();
            while reader.next().await.is_some() {}
        });

        let router = EventRouter::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        router.subscribe("nvim_buf_detach_event", move |event| {
            let _ = tx.send((event.params.clone(), event.is_request()));
        });

        let transport = ClientTransport::connect(&path, &fast_config(), router, None)
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some((vec![Value::from(4)], false)));

        transport.shutdown().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_request_answered_through_responder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut reader, mut writer) = accept(&listener).await;
            writer
                .send(Request::new(7, "host_call", vec![Value::from(21)]).into_message())
                .await
                .unwrap();
            loop {
                match reader.next().await {
                    Some(Ok(Frame::Message(Message::Response(response)))) => return response,
                    Some(_) => continue,
                    None => panic!("client closed before responding"),
                }
            }
        });

        let router = EventRouter::new();
        router.subscribe("host_call", |event| {
            let responder = event.responder.clone().unwrap();
            let n = event.params[0].as_i64().unwrap();
            tokio::spawn(async move {
                responder.respond(Ok(Value::from(n * 2))).await.unwrap();
            });
        });

        let transport = ClientTransport::connect(&path, &fast_config(), router, None)
            .await
            .unwrap();

        let response = server.await.unwrap();
        assert_eq!(response, Response::ok(7, Value::from(42)));

        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_alive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, mut w) = stream.into_split();
            let mut reader = FramedRead::new(r, RpcCodec::new());
            let request = next_request(&mut reader).await.unwrap();

            // [9] is a well-formed value but not a message
            let mut bytes = vec![0x91, 0x09];
            Message::Response(Response::ok(request.msgid, Value::from("ok"))).encode_into(&mut bytes);
            tokio::io::AsyncWriteExt::write_all(&mut w, &bytes).await.unwrap();
            while reader.next().await.is_some() {}
        });

        let transport = ClientTransport::connect(&path, &fast_config(), EventRouter::new(), None)
            .await
            .unwrap();
        let response = transport
            .request("check", vec![], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.result, Value::from("ok"));

        transport.shutdown().await;
        server.await.unwrap();
    }
}
