//! State machine implementation

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Error type returned by state hooks
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Name of a state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct State(&'static str);

impl State {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Name of a transition event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Event(&'static str);

impl Event {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

#[derive(Error, Debug)]
pub enum MachineError {
    #[error("State machine has already started in state {0}")]
    AlreadyStarted(State),

    #[error("State machine has not started")]
    NotStarted,

    #[error("State {state} has no event {event}")]
    UndefinedEvent { state: State, event: Event },

    #[error("Exiting state {state} failed: {source}")]
    ExitFailed { state: State, source: BoxError },

    #[error("Entering state {state} failed: {source}")]
    EnterFailed { state: State, source: BoxError },
}

/// Hooks bound to one state.
///
/// Hooks run synchronously on the thread calling `start`/`trigger`. They must
/// not call back into the same machine.
pub trait StateHandler<D>: Send + Sync {
    /// The state this handler is bound to
    fn state(&self) -> State;

    /// Called when the machine moves into this state. `event` is `None` for
    /// the initial state entered by `start`.
    fn enter_state(&self, _event: Option<Event>, _data: &D) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called when the machine leaves this state
    fn exit_state(&self, _event: Event, _data: &D) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Outgoing edges of one state
#[derive(Debug, Clone)]
pub struct Transition {
    pub state: State,
    pub events: HashMap<Event, State>,
}

impl Transition {
    pub fn new(state: State) -> Self {
        Self {
            state,
            events: HashMap::new(),
        }
    }

    pub fn add_event(&mut self, event: Event, to: State) {
        self.events.insert(event, to);
    }

    pub fn next_state(&self, event: Event) -> Result<State, MachineError> {
        self.events
            .get(&event)
            .copied()
            .ok_or(MachineError::UndefinedEvent {
                state: self.state,
                event,
            })
    }
}

struct Inner<D> {
    current: Option<State>,
    handlers: HashMap<State, Arc<dyn StateHandler<D>>>,
    transitions: HashMap<State, Transition>,
}

/// State machine managing states and transitions.
///
/// Concurrent `trigger` calls on one machine are not supported; callers
/// serialize them.
pub struct Machine<D> {
    inner: Mutex<Inner<D>>,
}

impl<D> Default for Machine<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> Machine<D> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                current: None,
                handlers: HashMap::new(),
                transitions: HashMap::new(),
            }),
        }
    }

    /// Register the handler for its state, replacing any previous one
    pub fn add_state_handler(&self, handler: Arc<dyn StateHandler<D>>) {
        let mut inner = self.inner.lock();
        inner.handlers.insert(handler.state(), handler);
    }

    /// Add an edge `from --event--> to`. A state without a handler does
    /// nothing when entered or exited.
    pub fn add_transition(&self, event: Event, from: State, to: State) {
        let mut inner = self.inner.lock();
        inner
            .transitions
            .entry(from)
            .or_insert_with(|| Transition::new(from))
            .add_event(event, to);
    }

    /// Current state, `None` before `start`
    pub fn state(&self) -> Option<State> {
        self.inner.lock().current
    }

    /// Enter the first state. Fails if the machine was already started.
    pub fn start(&self, state: State, data: D) -> Result<(), MachineError> {
        let handler = {
            let mut inner = self.inner.lock();
            if let Some(current) = inner.current {
                return Err(MachineError::AlreadyStarted(current));
            }
            inner.current = Some(state);
            inner.handlers.get(&state).cloned()
        };

        debug!("Machine started in {}", state);

        if let Some(handler) = handler {
            handler
                .enter_state(None, &data)
                .map_err(|source| MachineError::EnterFailed { state, source })?;
        }
        Ok(())
    }

    /// Fire an event from the current state.
    ///
    /// The new state is committed only after both the exit hook and the enter
    /// hook return `Ok`. When the enter hook fails, the exit hook's side
    /// effects have already happened but the machine stays in the old state.
    pub fn trigger(&self, event: Event, data: D) -> Result<(), MachineError> {
        let (from, to, exit_handler, enter_handler) = {
            let inner = self.inner.lock();
            let from = inner.current.ok_or(MachineError::NotStarted)?;
            let to = inner
                .transitions
                .get(&from)
                .ok_or(MachineError::UndefinedEvent { state: from, event })?
                .next_state(event)?;
            (
                from,
                to,
                inner.handlers.get(&from).cloned(),
                inner.handlers.get(&to).cloned(),
            )
        };

        if let Some(handler) = exit_handler {
            handler
                .exit_state(event, &data)
                .map_err(|source| MachineError::ExitFailed { state: from, source })?;
        }

        if let Some(handler) = enter_handler {
            handler
                .enter_state(Some(event), &data)
                .map_err(|source| MachineError::EnterFailed { state: to, source })?;
        }

        self.inner.lock().current = Some(to);
        debug!("Machine moved {} --{}--> {}", from, event, to);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: State = State::new("A");
    const B: State = State::new("B");
    const C: State = State::new("C");

    const AB: Event = Event::new("AB");
    const AC: Event = Event::new("AC");
    const BB: Event = Event::new("BB");
    const CA: Event = Event::new("CA");

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        state: State,
        log: Log,
        fail_enter: bool,
        fail_exit: bool,
    }

    impl Recorder {
        fn new(state: State, log: &Log) -> Arc<Self> {
            Arc::new(Self {
                state,
                log: log.clone(),
                fail_enter: false,
                fail_exit: false,
            })
        }
    }

    impl StateHandler<u32> for Recorder {
        fn state(&self) -> State {
            self.state
        }

        fn enter_state(&self, event: Option<Event>, data: &u32) -> Result<(), BoxError> {
            let event = event.map(|e| e.name()).unwrap_or("-");
            self.log
                .lock()
                .push(format!("enter {} {} {}", self.state, event, data));
            if self.fail_enter {
                return Err("enter refused".into());
            }
            Ok(())
        }

        fn exit_state(&self, event: Event, data: &u32) -> Result<(), BoxError> {
            self.log
                .lock()
                .push(format!("exit {} {} {}", self.state, event, data));
            if self.fail_exit {
                return Err("exit refused".into());
            }
            Ok(())
        }
    }

    fn machine(log: &Log) -> Machine<u32> {
        let machine = Machine::new();
        machine.add_state_handler(Recorder::new(A, log));
        machine.add_state_handler(Recorder::new(B, log));
        machine.add_state_handler(Recorder::new(C, log));
        machine.add_transition(AB, A, B);
        machine.add_transition(AC, A, C);
        machine.add_transition(BB, B, B);
        machine.add_transition(CA, C, A);
        machine
    }

    #[test]
    fn test_walk() {
        let log = Log::default();
        let machine = machine(&log);

        machine.start(A, 0).unwrap();
        assert_eq!(machine.state(), Some(A));
        machine.trigger(AC, 1).unwrap();
        assert_eq!(machine.state(), Some(C));
        machine.trigger(CA, 2).unwrap();
        assert_eq!(machine.state(), Some(A));
        machine.trigger(AB, 3).unwrap();
        assert_eq!(machine.state(), Some(B));
        machine.trigger(BB, 4).unwrap();
        assert_eq!(machine.state(), Some(B));
    }

    #[test]
    fn test_trigger_before_start() {
        let log = Log::default();
        let machine = machine(&log);

        assert!(matches!(machine.trigger(AB, 0), Err(MachineError::NotStarted)));
        assert_eq!(machine.state(), None);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_double_start() {
        let log = Log::default();
        let machine = machine(&log);

        machine.start(A, 0).unwrap();
        assert!(matches!(
            machine.start(B, 0),
            Err(MachineError::AlreadyStarted(A))
        ));
        assert_eq!(machine.state(), Some(A));
    }

    #[test]
    fn test_undefined_event_keeps_state() {
        let log = Log::default();
        let machine = machine(&log);

        machine.start(A, 0).unwrap();
        log.lock().clear();

        assert!(matches!(
            machine.trigger(CA, 0),
            Err(MachineError::UndefinedEvent { .. })
        ));
        assert_eq!(machine.state(), Some(A));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_hook_order() {
        let log = Log::default();
        let machine = machine(&log);

        machine.start(A, 7).unwrap();
        machine.trigger(AB, 8).unwrap();

        assert_eq!(
            *log.lock(),
            vec!["enter A - 7", "exit A AB 8", "enter B AB 8"]
        );
    }

    #[test]
    fn test_exit_failure_aborts() {
        let log = Log::default();
        let machine: Machine<u32> = Machine::new();
        machine.add_state_handler(Arc::new(Recorder {
            state: A,
            log: log.clone(),
            fail_enter: false,
            fail_exit: true,
        }));
        machine.add_state_handler(Recorder::new(B, &log));
        machine.add_transition(AB, A, B);

        machine.start(A, 0).unwrap();
        assert!(matches!(
            machine.trigger(AB, 1),
            Err(MachineError::ExitFailed { state: A, .. })
        ));
        assert_eq!(machine.state(), Some(A));
        assert!(!log.lock().iter().any(|l| l.starts_with("enter B")));
    }

    #[test]
    fn test_enter_failure_after_exit_does_not_commit() {
        let log = Log::default();
        let machine: Machine<u32> = Machine::new();
        machine.add_state_handler(Recorder::new(A, &log));
        machine.add_state_handler(Arc::new(Recorder {
            state: B,
            log: log.clone(),
            fail_enter: true,
            fail_exit: false,
        }));
        machine.add_transition(AB, A, B);

        machine.start(A, 0).unwrap();
        assert!(matches!(
            machine.trigger(AB, 1),
            Err(MachineError::EnterFailed { state: B, .. })
        ));

        // exit side effects ran, state was not committed
        assert_eq!(machine.state(), Some(A));
        assert_eq!(*log.lock(), vec!["enter A - 0", "exit A AB 1", "enter B AB 1"]);
    }

    #[test]
    fn test_state_without_handler() {
        let machine: Machine<()> = Machine::new();
        machine.add_transition(AB, A, B);

        machine.start(A, ()).unwrap();
        machine.trigger(AB, ()).unwrap();
        assert_eq!(machine.state(), Some(B));
    }
}
