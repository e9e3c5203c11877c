//! Connection - one framed session over a byte stream

use crate::server::Registry;
use async_trait::async_trait;
use hubvpn_protocol::{CodecError, Converter, Frame, FrameError, Message, read_frame, write_frame};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{OwnedMutexGuard, watch};
use tracing::{debug, info, trace};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,

    #[error("Connection already resumed")]
    AlreadyResumed,

    #[error("Connection already suspended")]
    AlreadySuspended,

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receiver of the messages read by a connection's loop
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// Called for every decoded message, in wire order
    async fn received(&self, message: Message);

    /// Called once when the connection closes
    async fn closed(&self, reason: &str);
}

/// Stop flag owned by one read loop
#[derive(Debug, Default)]
struct LoopToken {
    stopping: AtomicBool,
}

impl LoopToken {
    fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

struct Control {
    handler: Option<Arc<dyn ConnectionHandler>>,
    /// Token of the loop currently allowed to dispatch
    active: Option<Arc<LoopToken>>,
    generation: u64,
    closed: bool,
}

/// A framed session over one transport stream.
///
/// At most one read loop dispatches at a time. `send` may run concurrently
/// with the read loop. After `close`, `send`, `resume` and `suspend` fail.
pub struct Connection {
    peer: SocketAddr,
    converter: Arc<Converter>,
    reader: tokio::sync::Mutex<BoxedReader>,
    writer: Arc<tokio::sync::Mutex<BoxedWriter>>,
    control: Mutex<Control>,
    /// Frame read by a loop that was suspended mid-read
    pending: Mutex<Option<Frame>>,
    registry: Mutex<Option<Weak<Registry>>>,
    closed_tx: watch::Sender<bool>,
}

impl Connection {
    /// Wrap a byte stream
    pub fn new<S>(stream: S, peer: SocketAddr, converter: Arc<Converter>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (closed_tx, _) = watch::channel(false);

        Arc::new(Self {
            peer,
            converter,
            reader: tokio::sync::Mutex::new(Box::new(reader)),
            writer: Arc::new(tokio::sync::Mutex::new(Box::new(writer))),
            control: Mutex::new(Control {
                handler: None,
                active: None,
                generation: 0,
                closed: false,
            }),
            pending: Mutex::new(None),
            registry: Mutex::new(None),
            closed_tx,
        })
    }

    /// Dial a server over TCP
    pub async fn connect(
        addr: impl ToSocketAddrs,
        converter: Arc<Converter>,
    ) -> Result<Arc<Self>, ConnectionError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;

        info!("Connected to {}", peer);

        Ok(Self::new(stream, peer, converter))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn converter(&self) -> &Arc<Converter> {
        &self.converter
    }

    pub fn is_closed(&self) -> bool {
        self.control.lock().closed
    }

    /// Whether a read loop is currently allowed to dispatch
    pub fn is_running(&self) -> bool {
        self.control.lock().active.is_some()
    }

    /// Number of times the connection has been resumed
    pub fn generation(&self) -> u64 {
        self.control.lock().generation
    }

    pub(crate) fn attach_registry(&self, registry: Weak<Registry>) {
        *self.registry.lock() = Some(registry);
    }

    /// Start a read loop dispatching to `handler`.
    ///
    /// Fails if the connection is closed or a loop is already running.
    pub fn resume(
        self: &Arc<Self>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<(), ConnectionError> {
        let token = {
            let mut control = self.control.lock();
            if control.closed {
                return Err(ConnectionError::Closed);
            }
            if control.active.is_some() {
                return Err(ConnectionError::AlreadyResumed);
            }
            let token = Arc::new(LoopToken::default());
            control.handler = Some(handler);
            control.active = Some(token.clone());
            control.generation += 1;
            token
        };

        debug!(peer = %self.peer, "Connection resumed");
        tokio::spawn(self.clone().read_loop(token));

        Ok(())
    }

    /// Stop the running loop after its current iteration.
    ///
    /// A read already in flight is not interrupted; a frame it returns is kept
    /// for the next resumed loop instead of being dispatched.
    pub fn suspend(&self) -> Result<(), ConnectionError> {
        let mut control = self.control.lock();
        if control.closed {
            return Err(ConnectionError::Closed);
        }
        match control.active.take() {
            Some(token) => {
                token.stop();
                debug!(peer = %self.peer, "Connection suspended");
                Ok(())
            }
            None => Err(ConnectionError::AlreadySuspended),
        }
    }

    /// Encode and write one message.
    ///
    /// A write still blocked when the connection closes is abandoned with
    /// `ConnectionError::Closed`.
    pub async fn send(&self, message: &Message) -> Result<(), ConnectionError> {
        let mut closed_rx = self.closed_tx.subscribe();
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let frame = self.converter.to_frame(message)?;
        let write = async {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &frame).await
        };
        tokio::select! {
            result = write => result?,
            _ = closed_rx.wait_for(|closed| *closed) => return Err(ConnectionError::Closed),
        }

        trace!(peer = %self.peer, "Sent {}", message.message_type());

        Ok(())
    }

    /// Close the connection. Only the first call has any effect.
    pub async fn close(&self, reason: &str) {
        let (handler, registry) = {
            let mut control = self.control.lock();
            if control.closed {
                return;
            }
            control.closed = true;
            if let Some(token) = control.active.take() {
                token.stop();
            }
            (control.handler.take(), self.registry.lock().take())
        };

        // wakes a loop blocked in read and any send blocked in write
        self.closed_tx.send_replace(true);

        if let Some(registry) = registry.and_then(|r| r.upgrade()) {
            registry.deregister(self, reason).await;
        }

        match self.writer.clone().try_lock_owned() {
            Ok(writer) => shutdown_writer(writer, self.peer).await,
            Err(_) => {
                // a woken send still holds the writer; shut down once it lets go
                let writer = self.writer.clone();
                let peer = self.peer;
                tokio::spawn(async move {
                    shutdown_writer(writer.lock_owned().await, peer).await;
                });
            }
        }

        if let Some(handler) = handler {
            handler.closed(reason).await;
        }

        info!(peer = %self.peer, "Connection closed: {}", reason);
    }

    async fn read_loop(self: Arc<Self>, token: Arc<LoopToken>) {
        let mut closed_rx = self.closed_tx.subscribe();
        let mut reader = self.reader.lock().await;

        loop {
            if token.is_stopping() {
                break;
            }

            let pending = self.pending.lock().take();
            let frame = match pending {
                Some(frame) => frame,
                None => {
                    let result = tokio::select! {
                        result = read_frame(&mut *reader) => result,
                        _ = closed_rx.wait_for(|closed| *closed) => break,
                    };
                    match result {
                        Ok(frame) => frame,
                        Err(e) => {
                            self.close(&format!("read failed: {}", e)).await;
                            break;
                        }
                    }
                }
            };

            let handler = {
                let control = self.control.lock();
                if token.is_stopping() {
                    *self.pending.lock() = Some(frame);
                    debug!(peer = %self.peer, "Frame held for next resume");
                    break;
                }
                control.handler.clone()
            };

            let message = match self.converter.to_object(&frame) {
                Ok(message) => message,
                Err(e) => {
                    self.close(&format!("decode failed: {}", e)).await;
                    break;
                }
            };

            trace!(peer = %self.peer, "Received {}", message.message_type());

            if let Some(handler) = handler {
                handler.received(message).await;
            }
        }

        trace!(peer = %self.peer, "Read loop ended");
    }
}

async fn shutdown_writer(mut writer: OwnedMutexGuard<BoxedWriter>, peer: SocketAddr) {
    if let Err(e) = writer.shutdown().await {
        debug!(%peer, "Transport shutdown error: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use hubvpn_protocol::{Fail, MessageType};
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct Recorder {
        messages: mpsc::UnboundedSender<Message>,
        closes: mpsc::UnboundedSender<String>,
    }

    struct RecorderRx {
        messages: mpsc::UnboundedReceiver<Message>,
        closes: mpsc::UnboundedReceiver<String>,
    }

    fn recorder() -> (Arc<Recorder>, RecorderRx) {
        let (messages_tx, messages) = mpsc::unbounded_channel();
        let (closes_tx, closes) = mpsc::unbounded_channel();
        (
            Arc::new(Recorder {
                messages: messages_tx,
                closes: closes_tx,
            }),
            RecorderRx { messages, closes },
        )
    }

    #[async_trait]
    impl ConnectionHandler for Recorder {
        async fn received(&self, message: Message) {
            let _ = self.messages.send(message);
        }

        async fn closed(&self, reason: &str) {
            let _ = self.closes.send(reason.to_string());
        }
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn pair() -> (Arc<Connection>, Arc<Connection>) {
        let converter = Arc::new(Converter::standard());
        let (a, b) = tokio::io::duplex(256 * 1024);
        (
            Connection::new(a, peer(1), converter.clone()),
            Connection::new(b, peer(2), converter),
        )
    }

    fn packet(byte: u8) -> Message {
        Message::Packet(Bytes::from(vec![byte; 4]))
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_send_and_receive_in_order() {
        let (left, right) = pair();
        let (handler, mut rx) = recorder();
        right.resume(handler).unwrap();

        for i in 0..10u8 {
            left.send(&packet(i)).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(next(&mut rx.messages).await, packet(i));
        }
    }

    #[tokio::test]
    async fn test_resume_twice_fails() {
        let (_left, right) = pair();
        let (handler, _rx) = recorder();

        right.resume(handler.clone()).unwrap();
        assert!(matches!(
            right.resume(handler),
            Err(ConnectionError::AlreadyResumed)
        ));
        assert_eq!(right.generation(), 1);
    }

    #[tokio::test]
    async fn test_suspend_requires_running_loop() {
        let (_left, right) = pair();
        let (handler, _rx) = recorder();

        assert!(matches!(
            right.suspend(),
            Err(ConnectionError::AlreadySuspended)
        ));
        right.resume(handler).unwrap();
        right.suspend().unwrap();
        assert!(!right.is_running());
        assert!(matches!(
            right.suspend(),
            Err(ConnectionError::AlreadySuspended)
        ));
    }

    #[tokio::test]
    async fn test_swap_handler_after_suspend() {
        let (left, right) = pair();
        let (first, mut first_rx) = recorder();
        let (second, mut second_rx) = recorder();

        right.resume(first).unwrap();
        left.send(&packet(1)).await.unwrap();
        assert_eq!(next(&mut first_rx.messages).await, packet(1));

        right.suspend().unwrap();
        right.resume(second).unwrap();

        left.send(&packet(2)).await.unwrap();
        left.send(&packet(3)).await.unwrap();
        assert_eq!(next(&mut second_rx.messages).await, packet(2));
        assert_eq!(next(&mut second_rx.messages).await, packet(3));
        assert!(first_rx.messages.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_frame_read_while_suspended_goes_to_next_handler() {
        let (left, right) = pair();
        let (first, mut first_rx) = recorder();
        let (second, mut second_rx) = recorder();

        right.resume(first).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // first loop is blocked in read when it is suspended
        right.suspend().unwrap();
        left.send(&packet(7)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(first_rx.messages.try_recv().is_err());

        right.resume(second).unwrap();
        assert_eq!(next(&mut second_rx.messages).await, packet(7));
        assert!(first_rx.messages.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_left, right) = pair();
        let (handler, mut rx) = recorder();
        right.resume(handler).unwrap();

        right.close("first").await;
        right.close("second").await;

        assert_eq!(next(&mut rx.closes).await, "first");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.closes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_operations_fail_after_close() {
        let (_left, right) = pair();
        let (handler, _rx) = recorder();

        right.close("done").await;

        assert!(right.is_closed());
        assert!(matches!(
            right.send(&Message::ConfigRequest).await,
            Err(ConnectionError::Closed)
        ));
        assert!(matches!(right.resume(handler), Err(ConnectionError::Closed)));
        assert!(matches!(right.suspend(), Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_peer_close_closes_connection() {
        let (left, right) = pair();
        let (handler, mut rx) = recorder();
        right.resume(handler).unwrap();

        left.close("bye").await;

        let reason = next(&mut rx.closes).await;
        assert!(reason.starts_with("read failed"), "{}", reason);
        assert!(right.is_closed());
    }

    #[tokio::test]
    async fn test_bad_marker_closes_connection() {
        let converter = Arc::new(Converter::standard());
        let (mut raw, stream): (DuplexStream, DuplexStream) = tokio::io::duplex(1024);
        let conn = Connection::new(stream, peer(3), converter);
        let (handler, mut rx) = recorder();
        conn.resume(handler).unwrap();

        raw.write_all(&[0x00, 0, 4, 0, 0, 0xAA]).await.unwrap();

        let reason = next(&mut rx.closes).await;
        assert!(reason.contains("head marker"), "{}", reason);
        assert!(rx.messages.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_tag_closes_connection() {
        let narrow = Arc::new(
            Converter::builder()
                .bind_relation(0, MessageType::Fail)
                .unwrap()
                .build(),
        );
        let (a, b) = tokio::io::duplex(1024);
        let sender = Connection::new(a, peer(4), Arc::new(Converter::standard()));
        let conn = Connection::new(b, peer(5), narrow);
        let (handler, mut rx) = recorder();
        conn.resume(handler).unwrap();

        sender.send(&packet(1)).await.unwrap();

        let reason = next(&mut rx.closes).await;
        assert!(reason.starts_with("decode failed"), "{}", reason);
        assert!(rx.messages.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_fail_message() {
        let (left, right) = pair();
        let (handler, mut rx) = recorder();
        right.resume(handler).unwrap();

        let fail = Message::Fail(Fail {
            code: 401,
            message: "no".to_string(),
        });
        left.send(&fail).await.unwrap();
        assert_eq!(next(&mut rx.messages).await, fail);
    }

    #[tokio::test]
    async fn test_close_does_not_wait_for_blocked_send() {
        let converter = Arc::new(Converter::standard());
        // the far end never reads, so a large frame cannot be written out
        let (stream, _stalled) = tokio::io::duplex(64);
        let conn = Connection::new(stream, peer(6), converter);
        let (handler, mut rx) = recorder();
        conn.resume(handler).unwrap();

        let sender = conn.clone();
        let blocked = tokio::spawn(async move {
            sender
                .send(&Message::Packet(Bytes::from(vec![0u8; 4000])))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        timeout(Duration::from_secs(2), conn.close("kick"))
            .await
            .expect("close must not wait for the writer");
        assert_eq!(next(&mut rx.closes).await, "kick");

        let result = timeout(Duration::from_secs(2), blocked)
            .await
            .expect("blocked send should be released")
            .unwrap();
        assert!(matches!(result, Err(ConnectionError::Closed)));
    }
}
