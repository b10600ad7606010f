//! Channel lifecycle states and demand capabilities
//!
//! Every channel owns a [`State`] value. Transitions are validated: an
//! illegal transition is rejected and leaves the channel untouched. The
//! normal lifecycle is `Closed -> Opening -> Active -> Closing -> Closed`;
//! any non-terminal state may fall into `Error`, and `Destroy` is the
//! terminal state entered when the channel object is released.
//!
//! [`DCaps`] is the bitset a channel advertises to its driver: whether it
//! wants `process()` calls, has pending work independent of fd readiness,
//! and which poll events its fd should be watched for.

use std::fmt;

use crate::error::{Error, Result};

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum State {
    Closed = 0,
    Opening = 1,
    Active = 2,
    Closing = 3,
    Error = 4,
    Destroy = 5,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Closed => "Closed",
            State::Opening => "Opening",
            State::Active => "Active",
            State::Closing => "Closing",
            State::Error => "Error",
            State::Destroy => "Destroy",
        }
    }

    pub fn from_msgid(msgid: i32) -> Option<State> {
        match msgid {
            0 => Some(State::Closed),
            1 => Some(State::Opening),
            2 => Some(State::Active),
            3 => Some(State::Closing),
            4 => Some(State::Error),
            5 => Some(State::Destroy),
            _ => None,
        }
    }

    /// Check whether `self -> to` is a legal lifecycle transition.
    ///
    /// `Destroy` is reachable from every state; identity transitions are
    /// not legal.
    pub fn can_transition(&self, to: State) -> bool {
        if to == State::Destroy {
            return *self != State::Destroy;
        }
        matches!(
            (*self, to),
            (State::Closed, State::Opening)
                | (State::Opening, State::Active)
                | (State::Opening, State::Closing)
                | (State::Opening, State::Error)
                | (State::Active, State::Closing)
                | (State::Active, State::Error)
                | (State::Closing, State::Closed)
                | (State::Closing, State::Error)
                | (State::Error, State::Closing)
        )
    }

    /// Validate a transition, returning it as the new state.
    pub fn transition(&self, to: State) -> Result<State> {
        if !self.can_transition(to) {
            return Err(Error::InvalidTransition { from: *self, to });
        }
        Ok(to)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags::bitflags! {
    /// Demand capabilities: what the channel needs from its driver.
    ///
    /// `POLLIN`/`POLLOUT` request fd readiness polling, `PROCESS` requests
    /// unconditional `process()` calls, `PENDING` marks queued work that is
    /// independent of fd readiness. `SUSPEND` pauses processing; the
    /// `SUSPEND_PERMANENT` bit marks the channel an explicit suspend target
    /// (as opposed to one suspended through its parent).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DCaps: u32 {
        const POLLIN = 0x01;
        const POLLOUT = 0x02;
        const PROCESS = 0x10;
        const PENDING = 0x20;
        const SUSPEND = 0x40;
        const SUSPEND_PERMANENT = 0x80;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        assert!(State::Closed.can_transition(State::Opening));
        assert!(State::Opening.can_transition(State::Active));
        assert!(State::Active.can_transition(State::Closing));
        assert!(State::Closing.can_transition(State::Closed));
    }

    #[test]
    fn test_error_reachable_from_non_terminal() {
        assert!(State::Opening.can_transition(State::Error));
        assert!(State::Active.can_transition(State::Error));
        assert!(State::Closing.can_transition(State::Error));
        assert!(!State::Closed.can_transition(State::Error));
    }

    #[test]
    fn test_error_recovers_through_close() {
        assert!(State::Error.can_transition(State::Closing));
        assert!(State::Closing.can_transition(State::Closed));
        assert!(State::Closed.can_transition(State::Opening));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        assert!(!State::Closed.can_transition(State::Active));
        assert!(!State::Active.can_transition(State::Opening));
        assert!(!State::Closed.can_transition(State::Closed));
        assert!(State::Active.transition(State::Opening).is_err());
    }

    #[test]
    fn test_destroy_is_terminal() {
        for s in [
            State::Closed,
            State::Opening,
            State::Active,
            State::Closing,
            State::Error,
        ] {
            assert!(s.can_transition(State::Destroy));
        }
        assert!(!State::Destroy.can_transition(State::Closed));
        assert!(!State::Destroy.can_transition(State::Destroy));
    }

    #[test]
    fn test_state_msgid_roundtrip() {
        for s in [
            State::Closed,
            State::Opening,
            State::Active,
            State::Closing,
            State::Error,
            State::Destroy,
        ] {
            assert_eq!(State::from_msgid(s as i32), Some(s));
        }
        assert_eq!(State::from_msgid(6), None);
        assert_eq!(State::from_msgid(-1), None);
    }

    #[test]
    fn test_dcaps_bits() {
        let d = DCaps::PROCESS | DCaps::PENDING;
        assert!(d.contains(DCaps::PROCESS));
        assert!(!d.contains(DCaps::POLLIN));
        assert_eq!(DCaps::default(), DCaps::empty());
    }
}
