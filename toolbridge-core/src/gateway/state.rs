//! Gateway run state.
//!
//! ```text
//! Init → ConnectingBackends → ConnectingFrontends → Running → Stopping → Stopped
//! ```
//!
//! Either connecting phase may jump straight to `Stopping` when nothing
//! could be connected.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GatewayState {
    Init = 0,
    ConnectingBackends = 1,
    ConnectingFrontends = 2,
    Running = 3,
    Stopping = 4,
    Stopped = 5,
}

impl GatewayState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Init,
            1 => Self::ConnectingBackends,
            2 => Self::ConnectingFrontends,
            3 => Self::Running,
            4 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    /// True once shutdown has begun.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped)
    }
}

impl std::fmt::Display for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::ConnectingBackends => write!(f, "connecting_backends"),
            Self::ConnectingFrontends => write!(f, "connecting_frontends"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Lock-free holder for the current state.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self(AtomicU8::new(GatewayState::Init as u8))
    }
}

impl StateCell {
    pub fn get(&self) -> GatewayState {
        GatewayState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, next: GatewayState) {
        let prev = GatewayState::from_u8(self.0.swap(next as u8, Ordering::AcqRel));
        if prev != next {
            tracing::info!(from = %prev, to = %next, "gateway state");
        }
    }

    /// Move to `Stopping` unless already there or past it. Returns whether
    /// this call made the transition.
    pub fn begin_stop(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if GatewayState::from_u8(current).is_terminal() {
                return false;
            }
            match self.0.compare_exchange(
                current,
                GatewayState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::info!(from = %GatewayState::from_u8(current), to = %GatewayState::Stopping, "gateway state");
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }
}
