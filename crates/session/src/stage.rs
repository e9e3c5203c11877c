//! Stage handler: binds one machine state to one connection

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use hubvpn_fsm::{BoxError, Event, State, StateHandler};
use hubvpn_protocol::{Message, MessageType};
use hubvpn_transport::{Connection, ConnectionHandler};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Async callback for one received message
pub type MessageCallback = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// Async callback run when the connection closes during the stage
pub type CloseCallback = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Async task spawned once the stage's read loop is running
pub type ResumeCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Synchronous hook run before the connection resumes
pub type EnterHook<D> = Arc<dyn Fn(Option<Event>, &D) -> Result<(), BoxError> + Send + Sync>;

/// Routes messages of one stage to their callbacks by kind
struct Dispatcher {
    state: State,
    callbacks: HashMap<MessageType, MessageCallback>,
    default: Option<MessageCallback>,
    on_close: Option<CloseCallback>,
}

#[async_trait]
impl ConnectionHandler for Dispatcher {
    async fn received(&self, message: Message) {
        let kind = message.message_type();
        match self.callbacks.get(&kind).or(self.default.as_ref()) {
            Some(callback) => callback(message).await,
            None => debug!("{} dropped unexpected {}", self.state, kind),
        }
    }

    async fn closed(&self, reason: &str) {
        if let Some(on_close) = &self.on_close {
            on_close(reason.to_string()).await;
        }
    }
}

/// Handler for one handshake stage.
///
/// Entering the stage resumes the connection with this stage's callbacks;
/// exiting suspends it.
pub struct StageHandler<D> {
    state: State,
    connection: Arc<Connection>,
    dispatcher: Arc<Dispatcher>,
    on_enter: Option<EnterHook<D>>,
    after_resume: Option<ResumeCallback>,
}

impl<D> StageHandler<D> {
    pub fn builder(state: State, connection: Arc<Connection>) -> StageBuilder<D> {
        StageBuilder {
            state,
            connection,
            callbacks: HashMap::new(),
            default: None,
            on_close: None,
            on_enter: None,
            after_resume: None,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

impl<D: Send + Sync> StateHandler<D> for StageHandler<D> {
    fn state(&self) -> State {
        self.state
    }

    fn enter_state(&self, event: Option<Event>, data: &D) -> Result<(), BoxError> {
        if let Some(on_enter) = &self.on_enter {
            on_enter(event, data)?;
        }

        self.connection.resume(self.dispatcher.clone())?;
        debug!(peer = %self.connection.peer_addr(), "Entered {}", self.state);

        if let Some(after_resume) = &self.after_resume {
            tokio::spawn(after_resume());
        }
        Ok(())
    }

    fn exit_state(&self, event: Event, _data: &D) -> Result<(), BoxError> {
        if let Err(e) = self.connection.suspend() {
            debug!(peer = %self.connection.peer_addr(), "Suspend on {} ignored: {}", event, e);
        }
        debug!(peer = %self.connection.peer_addr(), "Left {} on {}", self.state, event);
        Ok(())
    }
}

/// Builder for `StageHandler`
pub struct StageBuilder<D> {
    state: State,
    connection: Arc<Connection>,
    callbacks: HashMap<MessageType, MessageCallback>,
    default: Option<MessageCallback>,
    on_close: Option<CloseCallback>,
    on_enter: Option<EnterHook<D>>,
    after_resume: Option<ResumeCallback>,
}

impl<D> StageBuilder<D> {
    /// Handle messages of `kind`
    pub fn on<F, Fut>(mut self, kind: MessageType, callback: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callbacks
            .insert(kind, Arc::new(move |message| callback(message).boxed()));
        self
    }

    /// Handle every message kind without its own callback
    pub fn on_default<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.default = Some(Arc::new(move |message| callback(message).boxed()));
        self
    }

    pub fn on_close<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_close = Some(Arc::new(move |reason| callback(reason).boxed()));
        self
    }

    /// Run `hook` before resuming; an error aborts the transition
    pub fn on_enter<F>(mut self, hook: F) -> Self
    where
        F: Fn(Option<Event>, &D) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.on_enter = Some(Arc::new(hook));
        self
    }

    /// Spawn `task` after the connection resumes for this stage
    pub fn after_resume<F, Fut>(mut self, task: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.after_resume = Some(Arc::new(move || task().boxed()));
        self
    }

    pub fn build(self) -> Arc<StageHandler<D>> {
        Arc::new(StageHandler {
            state: self.state,
            connection: self.connection,
            dispatcher: Arc::new(Dispatcher {
                state: self.state,
                callbacks: self.callbacks,
                default: self.default,
                on_close: self.on_close,
            }),
            on_enter: self.on_enter,
            after_resume: self.after_resume,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use hubvpn_fsm::Machine;
    use hubvpn_protocol::Converter;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const FIRST: State = State::new("First");
    const SECOND: State = State::new("Second");
    const NEXT: Event = Event::new("Next");

    fn pair() -> (Arc<Connection>, Arc<Connection>) {
        let converter = Arc::new(Converter::standard());
        let (a, b) = tokio::io::duplex(64 * 1024);
        let peer: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        (
            Connection::new(a, peer, converter.clone()),
            Connection::new(b, peer, converter),
        )
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    fn packet(byte: u8) -> Message {
        Message::Packet(Bytes::from(vec![byte]))
    }

    #[tokio::test]
    async fn test_dispatch_by_kind_and_default() {
        let (local, remote) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let packets = tx.clone();
        let others = tx;
        let stage: Arc<StageHandler<()>> = StageHandler::builder(FIRST, local.clone())
            .on(MessageType::Packet, move |m| {
                let packets = packets.clone();
                async move {
                    let _ = packets.send(("packet", m));
                }
            })
            .on_default(move |m| {
                let others = others.clone();
                async move {
                    let _ = others.send(("default", m));
                }
            })
            .build();

        let machine: Machine<()> = Machine::new();
        machine.add_state_handler(stage);
        machine.start(FIRST, ()).unwrap();
        assert!(local.is_running());

        remote.send(&packet(1)).await.unwrap();
        remote.send(&Message::ConfigRequest).await.unwrap();

        assert_eq!(next(&mut rx).await, ("packet", packet(1)));
        assert_eq!(next(&mut rx).await, ("default", Message::ConfigRequest));
    }

    #[tokio::test]
    async fn test_transition_swaps_handler() {
        let (local, remote) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let machine: Arc<Machine<()>> = Arc::new(Machine::new());
        let weak = Arc::downgrade(&machine);
        let first_tx = tx.clone();
        let first = StageHandler::builder(FIRST, local.clone())
            .on(MessageType::Packet, move |m| {
                let tx = first_tx.clone();
                let weak = weak.clone();
                async move {
                    let _ = tx.send(("first", m));
                    if let Some(machine) = weak.upgrade() {
                        machine.trigger(NEXT, ()).unwrap();
                    }
                }
            })
            .build();
        let second = StageHandler::builder(SECOND, local.clone())
            .on(MessageType::Packet, move |m| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(("second", m));
                }
            })
            .build();

        machine.add_state_handler(first);
        machine.add_state_handler(second);
        machine.add_transition(NEXT, FIRST, SECOND);
        machine.start(FIRST, ()).unwrap();

        for i in 0..3u8 {
            remote.send(&packet(i)).await.unwrap();
        }

        assert_eq!(next(&mut rx).await, ("first", packet(0)));
        assert_eq!(next(&mut rx).await, ("second", packet(1)));
        assert_eq!(next(&mut rx).await, ("second", packet(2)));
        assert_eq!(machine.state(), Some(SECOND));
        assert_eq!(local.generation(), 2);
    }

    #[tokio::test]
    async fn test_after_resume_and_close_callback() {
        let (local, remote) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let sender = local.clone();
        let stage: Arc<StageHandler<()>> = StageHandler::builder(FIRST, local.clone())
            .after_resume(move || {
                let sender = sender.clone();
                async move {
                    let _ = sender.send(&Message::ConfigRequest).await;
                }
            })
            .on_close(move |reason| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(reason);
                }
            })
            .build();

        let (remote_tx, mut remote_rx) = mpsc::unbounded_channel();
        let remote_stage: Arc<StageHandler<()>> = StageHandler::builder(SECOND, remote.clone())
            .on_default(move |m| {
                let tx = remote_tx.clone();
                async move {
                    let _ = tx.send(m);
                }
            })
            .build();
        let remote_machine: Machine<()> = Machine::new();
        remote_machine.add_state_handler(remote_stage);
        remote_machine.start(SECOND, ()).unwrap();

        let machine: Machine<()> = Machine::new();
        machine.add_state_handler(stage);
        machine.start(FIRST, ()).unwrap();

        assert_eq!(next(&mut remote_rx).await, Message::ConfigRequest);

        local.close("stage over").await;
        assert_eq!(next(&mut rx).await, "stage over");
    }

    #[tokio::test]
    async fn test_enter_hook_error_aborts_resume() {
        let (local, _remote) = pair();

        let stage: Arc<StageHandler<u32>> = StageHandler::builder(FIRST, local.clone())
            .on_enter(|_, data| {
                if *data == 0 {
                    return Err("no address".into());
                }
                Ok(())
            })
            .build();

        let machine: Machine<u32> = Machine::new();
        machine.add_state_handler(stage);

        assert!(machine.start(FIRST, 0).is_err());
        assert!(!local.is_running());
    }

    #[tokio::test]
    async fn test_enter_on_closed_connection_fails() {
        let (local, _remote) = pair();
        local.close("gone").await;

        let stage: Arc<StageHandler<()>> = StageHandler::builder(FIRST, local).build();
        let machine: Machine<()> = Machine::new();
        machine.add_state_handler(stage);

        assert!(machine.start(FIRST, ()).is_err());
    }
}
