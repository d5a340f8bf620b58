//! Debug actions: breakpoints, watchpoints and passpoints.
//!
//! Actions are keyed by address in a multimap owned by the CPU and
//! evaluated after every instruction. Returning `false` from `evaluate`
//! asks the emulator to stop at the next instruction boundary.

use std::fmt;

use log::trace;

/// What a debug action does when its address is hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    /// Stop on the first hit.
    Breakpoint,
    /// Log every hit, never stop.
    Watchpoint,
    /// Stop once the hit count is exhausted.
    PassPoint { remaining: u16 },
}

/// A user-installed per-address hook.
#[derive(Debug, Clone)]
pub struct DebugAction {
    address: u16,
    /// The expression the user typed to create this action, kept verbatim
    /// for display.
    location: String,
    kind: ActionKind,
}

impl DebugAction {
    pub fn breakpoint(address: u16, location: impl Into<String>) -> Self {
        Self {
            address,
            location: location.into(),
            kind: ActionKind::Breakpoint,
        }
    }

    pub fn watchpoint(address: u16, location: impl Into<String>) -> Self {
        Self {
            address,
            location: location.into(),
            kind: ActionKind::Watchpoint,
        }
    }

    pub fn passpoint(address: u16, location: impl Into<String>, count: u16) -> Self {
        Self {
            address,
            location: location.into(),
            kind: ActionKind::PassPoint { remaining: count },
        }
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    /// Evaluate against the current PC. `false` requests a stop.
    pub fn evaluate(&mut self, pc: u16) -> bool {
        if self.address != pc {
            return true;
        }
        match &mut self.kind {
            ActionKind::Breakpoint => {
                trace!("DEBUG: Breakpoint at {:04X}", pc);
                false
            }
            ActionKind::Watchpoint => {
                trace!("DEBUG: Watchpoint at {:04X}", pc);
                true
            }
            ActionKind::PassPoint { remaining } => {
                if *remaining == 0 {
                    trace!("DEBUG: Passpoint at {:04X} expired, stopping", pc);
                    return false;
                }
                *remaining -= 1;
                if *remaining == 0 {
                    trace!("DEBUG: Passpoint at {:04X} expired, stopping", pc);
                    false
                } else {
                    trace!("DEBUG: Passpoint at {:04X} not yet expired", pc);
                    true
                }
            }
        }
    }
}

impl fmt::Display for DebugAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ActionKind::Breakpoint => {
                write!(
                    f,
                    "Breakpoint at {:04X} (entered as '{}')",
                    self.address, self.location
                )
            }
            ActionKind::Watchpoint => {
                write!(
                    f,
                    "Watchpoint at {:04X} (entered as '{}')",
                    self.address, self.location
                )
            }
            ActionKind::PassPoint { remaining } => {
                write!(
                    f,
                    "Passpoint  at {:04X} (entered as '{}'), {} remaining",
                    self.address, self.location, remaining
                )
            }
        }
    }
}
