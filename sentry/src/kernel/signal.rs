//! Signal dispositions and queues.

use crate::arch::{SigAction, SignalInfo, SignalStack};
use std::collections::HashMap;

pub const SIGHUP: i32 = 1;
pub const SIGINT: i32 = 2;
pub const SIGQUIT: i32 = 3;
pub const SIGKILL: i32 = 9;
pub const SIGSEGV: i32 = 11;
pub const SIGTERM: i32 = 15;
pub const SIGCHLD: i32 = 17;
pub const SIGCONT: i32 = 18;
pub const SIGSTOP: i32 = 19;
pub const SIGTSTP: i32 = 20;
pub const SIGTTIN: i32 = 21;
pub const SIGTTOU: i32 = 22;
pub const SIGURG: i32 = 23;
pub const SIGWINCH: i32 = 28;

pub const NUM_SIGNALS: i32 = 64;

pub fn valid_signal(signo: i32) -> bool {
    (1..=NUM_SIGNALS).contains(&signo)
}

/// What a signal does when no handler is installed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DefaultAction {
    Terminate,
    Ignore,
    Stop,
    Continue,
}

pub fn default_action(signo: i32) -> DefaultAction {
    match signo {
        SIGCHLD | SIGURG | SIGWINCH => DefaultAction::Ignore,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => DefaultAction::Stop,
        SIGCONT => DefaultAction::Continue,
        _ => DefaultAction::Terminate,
    }
}

/// The signal handler table a thread group shares.
#[derive(Debug, Default, Clone)]
pub struct SignalHandlers {
    actions: HashMap<i32, SigAction>,
}

impl SignalHandlers {
    /// Installs a new action, returning the old one. SIGKILL and SIGSTOP
    /// cannot be caught.
    pub fn set_action(&mut self, signo: i32, act: SigAction) -> Result<SigAction, ()> {
        if !valid_signal(signo) || signo == SIGKILL || signo == SIGSTOP {
            return Err(());
        }
        Ok(self.actions.insert(signo, act).unwrap_or_default())
    }

    pub fn action(&self, signo: i32) -> Option<SigAction> {
        self.actions.get(&signo).copied().filter(|a| a.handler != 0)
    }

    /// True when the signal is explicitly set to SIG_IGN.
    pub fn ignored(&self, signo: i32) -> bool {
        const SIG_IGN: u64 = 1;
        self.actions
            .get(&signo)
            .map(|a| a.handler == SIG_IGN)
            .unwrap_or(false)
    }

    /// Handlers are reset to default at execve, except ignored
    /// dispositions which are preserved.
    pub fn reset_for_exec(&mut self) {
        self.actions.retain(|_, act| act.handler == 1);
    }
}

/// Per-task signal state: the mask, queue and alternate stack.
#[derive(Debug, Default, Clone)]
pub struct TaskSignalState {
    pub mask: u64,
    pub pending: Vec<SignalInfo>,
    pub alt_stack: SignalStack,
}

impl TaskSignalState {
    pub fn enqueue(&mut self, info: SignalInfo) {
        self.pending.push(info);
    }

    /// The next deliverable (unmasked) pending signal. SIGKILL and
    /// SIGSTOP cannot be masked.
    pub fn dequeue(&mut self) -> Option<SignalInfo> {
        let position = self.pending.iter().position(|info| {
            let bit = 1u64 << (info.signo - 1);
            info.signo == SIGKILL || info.signo == SIGSTOP || self.mask & bit == 0
        })?;
        Some(self.pending.remove(position))
    }
}
