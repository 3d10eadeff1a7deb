//! Per-connection message loop

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};
use uuid::Uuid;

use nvbridge_protocol::{Frame, Message, RpcCodec};

use crate::dispatch::HandlerTable;

/// Keeps the live-connection counter accurate even when a session is aborted
pub(crate) struct ConnectionGuard {
    count: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    pub(crate) fn new(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self { count }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One accepted client
pub(crate) struct ClientSession {
    id: Uuid,
    handlers: HandlerTable,
    max_frame_size: usize,
    _guard: ConnectionGuard,
}

impl ClientSession {
    pub(crate) fn new(handlers: HandlerTable, max_frame_size: usize, guard: ConnectionGuard) -> Self {
        Self {
            id: Uuid::new_v4(),
            handlers,
            max_frame_size,
            _guard: guard,
        }
    }

    /// Serve the client until it disconnects
    ///
    /// Requests are answered one at a time in arrival order.
    pub(crate) async fn run(self, stream: UnixStream) {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, RpcCodec::with_max_frame_size(self.max_frame_size));
        let mut writer = FramedWrite::new(write_half, RpcCodec::new());

        info!(session = %self.id, "Client connected");

        while let Some(frame) = reader.next().await {
            let message = match frame {
                Ok(Frame::Message(message)) => message,
                Ok(Frame::Invalid(e)) => {
                    warn!(session = %self.id, "Skipping malformed frame: {}", e);
                    continue;
                }
                Err(e) => {
                    warn!(session = %self.id, "Read error: {}", e);
                    break;
                }
            };

            match message {
                Message::Request(request) => {
                    debug!(session = %self.id, msgid = request.msgid, method = %request.method, "Request");
                    let response = self.handlers.handle_request(request).await;
                    if let Err(e) = writer.send(Message::Response(response)).await {
                        warn!(session = %self.id, "Write error: {}", e);
                        break;
                    }
                }
                Message::Notification(notification) => {
                    debug!(session = %self.id, method = %notification.method, "Notification");
                    self.handlers.handle_notification(notification).await;
                }
                Message::Response(response) => {
                    // This server never sends requests, so nothing can match
                    warn!(
                        session = %self.id,
                        msgid = response.msgid,
                        "Protocol violation: unsolicited response from client"
                    );
                }
            }
        }

        info!(session = %self.id, "Client disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvbridge_protocol::{Notification, Request, Response, Value};

    fn spawn_session(handlers: HandlerTable) -> (UnixStream, Arc<AtomicUsize>, tokio::task::JoinHandle<()>) {
        let (client, server) = UnixStream::pair().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let session = ClientSession::new(handlers, 1024 * 1024, ConnectionGuard::new(Arc::clone(&count)));
        let handle = tokio::spawn(session.run(server));
        (client, count, handle)
    }

    #[tokio::test]
    async fn test_requests_answered_in_order() {
        let (client, count, handle) = spawn_session(HandlerTable::with_builtins());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let (r, w) = client.into_split();
        let mut reader = FramedRead::new(r, RpcCodec::new());
        let mut writer = FramedWrite::new(w, RpcCodec::new());

        writer.send(Request::new(1, "ping", vec![]).into_message()).await.unwrap();
        writer.send(Request::new(2, "missing", vec![]).into_message()).await.unwrap();

        let first = reader.next().await.unwrap().unwrap();
        assert_eq!(
            first,
            Frame::Message(Message::Response(Response::ok(1, Value::from("pong"))))
        );
        match reader.next().await.unwrap().unwrap() {
            Frame::Message(Message::Response(response)) => {
                assert_eq!(response.msgid, 2);
                assert!(response.is_error());
            }
            other => panic!("Expected response, got {:?}", other),
        }

        drop(writer);
        handle.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_notifications_and_stray_responses_get_no_reply() {
        let handlers = HandlerTable::with_builtins();
        let (client, _count, handle) = spawn_session(handlers);

        let (r, w) = client.into_split();
        let mut reader = FramedRead::new(r, RpcCodec::new());
        let mut writer = FramedWrite::new(w, RpcCodec::new());

        writer
            .send(Notification::new("log", vec![Value::from("hello")]).into_message())
            .await
            .unwrap();
        writer.send(Message::Response(Response::ok(9, Value::Nil))).await.unwrap();
        writer.send(Request::new(3, "ping", vec![]).into_message()).await.unwrap();

        // The only reply is the one for the request
        match reader.next().await.unwrap().unwrap() {
            Frame::Message(Message::Response(response)) => assert_eq!(response.msgid, 3),
            other => panic!("Expected response, got {:?}", other),
        }

        drop(writer);
        handle.await.unwrap();
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let (client, _count, handle) = spawn_session(HandlerTable::with_builtins());

        let (r, mut w) = client.into_split();
        let mut reader = FramedRead::new(r, RpcCodec::new());

        let mut bytes = vec![0x93, 0x05, 0x01, 0x02];
        Request::new(8, "ping", vec![]).into_message().encode_into(&mut bytes);
        tokio::io::AsyncWriteExt::write_all(&mut w, &bytes).await.unwrap();

        match reader.next().await.unwrap().unwrap() {
            Frame::Message(Message::Response(response)) => {
                assert_eq!(response, Response::ok(8, Value::from("pong")));
            }
            other => panic!("Expected response, got {:?}", other),
        }

        drop(w);
        handle.await.unwrap();
    }
}
