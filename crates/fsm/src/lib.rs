//! hubvpn FSM - Named states, events and transitions
//!
//! A `Machine` starts in no state. `start` enters the first state; each
//! `trigger` runs the current handler's `exit_state`, then the target
//! handler's `enter_state`, and commits the new state only once both hooks
//! succeeded. States without a registered handler are entered silently.

mod machine;

pub use machine::*;
