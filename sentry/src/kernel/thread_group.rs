//! Thread groups: the process-level grouping of tasks.

use super::{limits::LimitSet, signal::SignalHandlers, PidNsId, TaskId, ThreadGroupId};
use sandkern_protocol::{ThreadId, WaitStatus};
use std::{
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

/// A host-backed terminal a session can control.
pub struct Tty {
    index: u32,
    state: Mutex<TtyState>,
}

#[derive(Default)]
struct TtyState {
    /// Session id of the controlling session, 0 when unowned.
    session: ThreadId,
    foreground_pgid: Option<ThreadId>,
}

impl Tty {
    pub fn new(index: u32) -> Arc<Tty> {
        Arc::new(Tty {
            index,
            state: Mutex::new(TtyState::default()),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn session(&self) -> ThreadId {
        self.state.lock().unwrap().session
    }

    pub fn foreground_pgid(&self) -> Option<ThreadId> {
        self.state.lock().unwrap().foreground_pgid
    }

    pub fn set_foreground_pgid(&self, pgid: ThreadId) {
        self.state.lock().unwrap().foreground_pgid = Some(pgid);
    }

    /// Claims the TTY for `session`. A TTY owned by another session is
    /// only taken with `steal`, and stealing follows Linux: the caller
    /// must be a session leader.
    pub fn set_controlling(
        &self,
        session: ThreadId,
        is_session_leader: bool,
        steal: bool,
    ) -> Result<(), ControlTtyError> {
        if !is_session_leader {
            return Err(ControlTtyError::NotSessionLeader);
        }
        let mut state = self.state.lock().unwrap();
        if state.session != 0 && state.session != session {
            if !steal {
                return Err(ControlTtyError::AlreadyControlled);
            }
        }
        state.session = session;
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ControlTtyError {
    NotSessionLeader,
    AlreadyControlled,
}

/// Exit status plumbing: waiters block here rather than on the kernel
/// lock.
#[derive(Default)]
pub struct ExitNotifier {
    status: Mutex<Option<WaitStatus>>,
    exited: Condvar,
}

impl ExitNotifier {
    pub fn status(&self) -> Option<WaitStatus> {
        *self.status.lock().unwrap()
    }

    pub fn notify(&self, status: WaitStatus) {
        let mut slot = self.status.lock().unwrap();
        if slot.is_none() {
            *slot = Some(status);
        }
        self.exited.notify_all();
    }

    /// Blocks until the group exits.
    pub fn wait(&self) -> WaitStatus {
        let mut status = self.status.lock().unwrap();
        while status.is_none() {
            status = self.exited.wait(status).unwrap();
        }
        status.unwrap()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<WaitStatus> {
        let deadline = std::time::Instant::now() + timeout;
        let mut status = self.status.lock().unwrap();
        while status.is_none() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.exited.wait_timeout(status, deadline - now).unwrap();
            status = guard;
        }
        *status
    }
}

struct TgState {
    tasks: Vec<TaskId>,
    leader: Option<TaskId>,
    session: ThreadId,
    pgid: ThreadId,
    controlling_tty: Option<Arc<Tty>>,
    exited: bool,
}

/// A collection of tasks sharing a pid, signal handlers, limits, session
/// and process group.
pub struct ThreadGroup {
    container_id: String,
    pidns: PidNsId,
    parent: Mutex<Option<ThreadGroupId>>,
    state: Mutex<TgState>,
    limits: Mutex<LimitSet>,
    handlers: Mutex<SignalHandlers>,
    exit: Arc<ExitNotifier>,
}

impl ThreadGroup {
    pub fn new(container_id: &str, pidns: PidNsId, parent: Option<ThreadGroupId>) -> Arc<ThreadGroup> {
        Arc::new(ThreadGroup {
            container_id: container_id.to_string(),
            pidns,
            parent: Mutex::new(parent),
            state: Mutex::new(TgState {
                tasks: Vec::new(),
                leader: None,
                session: 0,
                pgid: 0,
                controlling_tty: None,
                exited: false,
            }),
            limits: Mutex::new(LimitSet::default()),
            handlers: Mutex::new(SignalHandlers::default()),
            exit: Arc::new(ExitNotifier::default()),
        })
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn pidns(&self) -> PidNsId {
        self.pidns
    }

    pub fn parent(&self) -> Option<ThreadGroupId> {
        *self.parent.lock().unwrap()
    }

    pub fn set_parent(&self, parent: Option<ThreadGroupId>) {
        *self.parent.lock().unwrap() = parent;
    }

    pub fn limits(&self) -> LimitSet {
        *self.limits.lock().unwrap()
    }

    pub fn with_limits<R>(&self, f: impl FnOnce(&mut LimitSet) -> R) -> R {
        f(&mut self.limits.lock().unwrap())
    }

    pub fn with_handlers<R>(&self, f: impl FnOnce(&mut SignalHandlers) -> R) -> R {
        f(&mut self.handlers.lock().unwrap())
    }

    pub fn exit_notifier(&self) -> Arc<ExitNotifier> {
        Arc::clone(&self.exit)
    }

    pub fn exit_status(&self) -> Option<WaitStatus> {
        self.exit.status()
    }

    /// Adds a task; the first added becomes the leader.
    pub fn add_task(&self, task: TaskId) {
        let mut state = self.state.lock().unwrap();
        assert!(!state.exited, "adding a task to an exited thread group");
        if state.leader.is_none() {
            state.leader = Some(task);
        }
        state.tasks.push(task);
    }

    /// Removes a task. Returns true when the group is now empty (and the
    /// caller should mark it exited). The leader's departure marks the
    /// group exited regardless of remaining tasks.
    pub fn remove_task(&self, task: TaskId) -> bool {
        let mut state = self.state.lock().unwrap();
        state.tasks.retain(|t| *t != task);
        let leader_left = state.leader == Some(task);
        state.tasks.is_empty() || leader_left
    }

    pub fn leader(&self) -> Option<TaskId> {
        self.state.lock().unwrap().leader
    }

    pub fn tasks(&self) -> Vec<TaskId> {
        self.state.lock().unwrap().tasks.clone()
    }

    pub fn task_count(&self) -> usize {
        self.state.lock().unwrap().tasks.len()
    }

    pub fn is_exited(&self) -> bool {
        self.state.lock().unwrap().exited
    }

    /// Marks the group exited with `status`. Idempotent; the first
    /// status wins.
    pub fn set_exited(&self, status: WaitStatus) {
        let mut state = self.state.lock().unwrap();
        if state.exited {
            return;
        }
        state.exited = true;
        drop(state);
        self.exit.notify(status);
    }

    pub fn session(&self) -> ThreadId {
        self.state.lock().unwrap().session
    }

    pub fn pgid(&self) -> ThreadId {
        self.state.lock().unwrap().pgid
    }

    pub fn set_session(&self, session: ThreadId, pgid: ThreadId) {
        let mut state = self.state.lock().unwrap();
        state.session = session;
        state.pgid = pgid;
    }

    pub fn controlling_tty(&self) -> Option<Arc<Tty>> {
        self.state.lock().unwrap().controlling_tty.clone()
    }

    pub fn set_controlling_tty(&self, tty: Option<Arc<Tty>>) {
        self.state.lock().unwrap().controlling_tty = tty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::PidNamespace;

    fn test_pidns_id() -> PidNsId {
        crate::Arena::new().insert(PidNamespace::new(None))
    }

    #[test]
    fn first_status_wins() {
        let tg = ThreadGroup::new("c", test_pidns_id(), None);
        tg.set_exited(WaitStatus::from_exit_code(3));
        tg.set_exited(WaitStatus::from_signal(9));
        assert_eq!(tg.exit_status(), Some(WaitStatus::from_exit_code(3)));
    }

    #[test]
    fn concurrent_waiters_see_same_status() {
        let tg = ThreadGroup::new("c", test_pidns_id(), None);
        let notifier = tg.exit_notifier();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let n = Arc::clone(&notifier);
                std::thread::spawn(move || n.wait())
            })
            .collect();
        tg.set_exited(WaitStatus::from_signal(15));
        for w in waiters {
            assert_eq!(w.join().unwrap(), WaitStatus::from_signal(15));
        }
    }

    #[test]
    fn tty_steal_requires_session_leader() {
        let tty = Tty::new(0);
        tty.set_controlling(10, true, false).unwrap();
        assert_eq!(tty.session(), 10);
        assert_eq!(
            tty.set_controlling(20, true, false),
            Err(ControlTtyError::AlreadyControlled)
        );
        assert_eq!(
            tty.set_controlling(20, false, true),
            Err(ControlTtyError::NotSessionLeader)
        );
        tty.set_controlling(20, true, true).unwrap();
        assert_eq!(tty.session(), 20);
    }
}
