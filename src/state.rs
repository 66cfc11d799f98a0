//! Radio, screen, and data-connection state, plus the request admission
//! policy.
//!
//! Each piece of shared state is a small independently-locked cell; none
//! of these locks is ever held across an AT command.

use std::sync::Mutex;

use crate::error::RilError;
use crate::requests::RequestCode;

/// Overall radio/SIM state, as reported to the host.
///
/// Within one attach cycle the walk is monotone:
/// `Unavailable → Off → SimNotReady → (SimLockedOrAbsent | SimReady)`;
/// any state regresses to `Unavailable` on transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Unavailable,
    Off,
    SimNotReady,
    SimLockedOrAbsent,
    SimReady,
}

impl RadioState {
    /// Is `next` a legal direct successor of `self`?
    pub fn can_transition_to(self, next: RadioState) -> bool {
        use RadioState::*;
        if next == Unavailable || self == next {
            return true;
        }
        matches!(
            (self, next),
            (Unavailable, Off)
                | (Off, SimNotReady)
                | (SimNotReady, SimReady)
                | (SimNotReady, SimLockedOrAbsent)
                | (SimNotReady, Off)
                | (SimLockedOrAbsent, SimReady)
                | (SimLockedOrAbsent, SimNotReady)
                | (SimLockedOrAbsent, Off)
                | (SimReady, SimLockedOrAbsent)
                | (SimReady, Off)
        )
    }
}

/// A mutex-guarded state cell.
pub struct StateCell<T: Copy> {
    value: Mutex<T>,
}

impl<T: Copy> StateCell<T> {
    pub fn new(value: T) -> Self {
        StateCell {
            value: Mutex::new(value),
        }
    }

    pub fn get(&self) -> T {
        *self.value.lock().unwrap()
    }

    /// Store `value`, returning the previous one.
    pub fn set(&self, value: T) -> T {
        let mut guard = self.value.lock().unwrap();
        std::mem::replace(&mut *guard, value)
    }
}

/// Data-connection (network access point) state machine, driven by
/// `*E2NAP:` indications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unknown,
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn from_code(code: i32) -> Option<ConnectionState> {
        match code {
            0 => Some(ConnectionState::Disconnected),
            1 => Some(ConnectionState::Connecting),
            2 => Some(ConnectionState::Connected),
            _ => None,
        }
    }
}

/// Connection state plus the disconnect cause that came with it. The cause
/// is only meaningful alongside `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub state: ConnectionState,
    pub cause: Option<i32>,
}

impl Connection {
    pub fn unknown() -> Self {
        Connection {
            state: ConnectionState::Unknown,
            cause: None,
        }
    }
}

/// Requests served by the priority queue when one exists: the short
/// status/control calls a UI blocks on. Anything that can hold the channel
/// for a network round-trip stays on the normal queue.
pub fn is_prio_request(code: RequestCode) -> bool {
    matches!(
        code,
        RequestCode::GetSimStatus
            | RequestCode::RadioPower
            | RequestCode::ScreenState
            | RequestCode::GetCurrentCalls
            | RequestCode::SmsAcknowledge
            | RequestCode::SignalStrength
            | RequestCode::LastDataCallFailCause
            | RequestCode::DataCallList
    )
}

/// Requests admitted while the radio is off or the SIM is still coming up:
/// power control, identity, and basic status.
fn admitted_while_off(code: RequestCode) -> bool {
    matches!(
        code,
        RequestCode::RadioPower
            | RequestCode::GetSimStatus
            | RequestCode::GetImei
            | RequestCode::BasebandVersion
            | RequestCode::ScreenState
    )
}

/// Requests admitted while the SIM is locked or absent: everything needed
/// to unlock it plus identity and basic status.
fn admitted_while_locked(code: RequestCode) -> bool {
    matches!(
        code,
        RequestCode::EnterSimPin
            | RequestCode::EnterSimPuk
            | RequestCode::EnterNetworkDepersonalization
            | RequestCode::GetSimStatus
            | RequestCode::RadioPower
            | RequestCode::GetImei
            | RequestCode::BasebandVersion
            | RequestCode::GetCurrentCalls
    )
}

/// Admission policy consulted by the workers before dispatching a handler.
/// `None` admits the request; `Some(err)` short-circuits with that error.
pub fn check_admission(state: RadioState, code: RequestCode) -> Option<RilError> {
    match state {
        RadioState::Unavailable => {
            if code == RequestCode::GetSimStatus {
                None
            } else {
                Some(RilError::RadioNotAvailable)
            }
        }
        RadioState::Off | RadioState::SimNotReady => {
            if admitted_while_off(code) {
                None
            } else {
                Some(RilError::RadioNotAvailable)
            }
        }
        RadioState::SimLockedOrAbsent => {
            if admitted_while_locked(code) {
                None
            } else {
                Some(RilError::GenericFailure)
            }
        }
        RadioState::SimReady => None,
    }
}
