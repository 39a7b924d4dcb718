//! PID namespaces: thread-id allocation and lookup.
//!
//! A task appears under one id in its own namespace and one in each
//! ancestor; ids are unique within a namespace but freely reused across
//! namespaces.

use super::{TaskId, ThreadGroupId};
use sandkern_protocol::ThreadId;
use std::collections::HashMap;

/// Lowest id handed out; 1 is the namespace init.
const FIRST_TID: ThreadId = 1;

/// Ids wrap at the Linux default pid_max.
const TID_LIMIT: ThreadId = 32768;

pub struct PidNamespace {
    parent: Option<super::PidNsId>,
    last_tid: ThreadId,
    tasks: HashMap<ThreadId, TaskId>,
    tids: HashMap<TaskId, ThreadId>,
    thread_groups: HashMap<ThreadId, ThreadGroupId>,
    tgids: HashMap<ThreadGroupId, ThreadId>,
}

impl PidNamespace {
    pub fn new(parent: Option<super::PidNsId>) -> PidNamespace {
        PidNamespace {
            parent,
            last_tid: 0,
            tasks: HashMap::new(),
            tids: HashMap::new(),
            thread_groups: HashMap::new(),
            tgids: HashMap::new(),
        }
    }

    pub fn parent(&self) -> Option<super::PidNsId> {
        self.parent
    }

    /// Allocates the next free thread id.
    pub fn allocate_tid(&mut self) -> Option<ThreadId> {
        let mut candidate = self.last_tid + 1;
        for _ in 0..TID_LIMIT {
            if candidate >= TID_LIMIT {
                candidate = FIRST_TID;
            }
            if !self.tasks.contains_key(&candidate) {
                self.last_tid = candidate;
                return Some(candidate);
            }
            candidate += 1;
        }
        None
    }

    pub fn insert_task(&mut self, tid: ThreadId, task: TaskId) {
        assert!(
            self.tasks.insert(tid, task).is_none(),
            "tid {tid} double-registered"
        );
        self.tids.insert(task, tid);
    }

    pub fn insert_thread_group(&mut self, tgid: ThreadId, tg: ThreadGroupId) {
        assert!(
            self.thread_groups.insert(tgid, tg).is_none(),
            "tgid {tgid} double-registered"
        );
        self.tgids.insert(tg, tgid);
    }

    pub fn remove_task(&mut self, task: TaskId) {
        if let Some(tid) = self.tids.remove(&task) {
            self.tasks.remove(&tid);
        }
    }

    pub fn remove_thread_group(&mut self, tg: ThreadGroupId) {
        if let Some(tgid) = self.tgids.remove(&tg) {
            self.thread_groups.remove(&tgid);
        }
    }

    pub fn task_with_id(&self, tid: ThreadId) -> Option<TaskId> {
        self.tasks.get(&tid).copied()
    }

    pub fn id_of_task(&self, task: TaskId) -> Option<ThreadId> {
        self.tids.get(&task).copied()
    }

    pub fn thread_group_with_id(&self, tgid: ThreadId) -> Option<ThreadGroupId> {
        self.thread_groups.get(&tgid).copied()
    }

    pub fn id_of_thread_group(&self, tg: ThreadGroupId) -> Option<ThreadId> {
        self.tgids.get(&tg).copied()
    }

    pub fn thread_groups(&self) -> Vec<(ThreadId, ThreadGroupId)> {
        let mut groups: Vec<(ThreadId, ThreadGroupId)> = self
            .thread_groups
            .iter()
            .map(|(tgid, tg)| (*tgid, *tg))
            .collect();
        groups.sort_by_key(|(tgid, _)| *tgid);
        groups
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}
