use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;

use super::transaction::TxnInner;
use crate::types::TxnId;

/// Work deferred until no transaction is active.
pub(crate) type SafeTask = Box<dyn FnOnce() + Send + 'static>;

/// Per-thread transaction stacks, the active count and the safe-task queue.
///
/// Always locked after a transaction's own state and after the commit lock.
#[derive(Default)]
pub(crate) struct Registry {
    stacks: HashMap<ThreadId, Vec<(TxnId, Arc<Mutex<TxnInner>>)>>,
    active: usize,
    safe_tasks: VecDeque<SafeTask>,
    pub closed: bool,
}

impl Registry {
    pub fn active(&self) -> usize {
        self.active
    }

    /// Nesting depth a transaction begun now on `thread` would get.
    pub fn depth(&self, thread: ThreadId) -> usize {
        self.stacks.get(&thread).map_or(0, Vec::len)
    }

    pub fn push(&mut self, thread: ThreadId, id: TxnId, inner: Arc<Mutex<TxnInner>>) {
        self.stacks.entry(thread).or_default().push((id, inner));
        self.active += 1;
    }

    pub fn top(&self, thread: ThreadId) -> Option<(TxnId, Arc<Mutex<TxnInner>>)> {
        self.stacks
            .get(&thread)
            .and_then(|stack| stack.last())
            .map(|(id, inner)| (*id, Arc::clone(inner)))
    }

    pub fn is_top(&self, thread: ThreadId, id: TxnId) -> bool {
        self.stacks
            .get(&thread)
            .and_then(|stack| stack.last())
            .is_some_and(|(top, _)| *top == id)
    }

    /// Pops `id` off `thread`'s stack and hands back the queued safe tasks
    /// when it was the last active transaction.
    pub fn pop(&mut self, thread: ThreadId, id: TxnId) -> Vec<SafeTask> {
        if let Some(stack) = self.stacks.get_mut(&thread) {
            if let Some(pos) = stack.iter().rposition(|(top, _)| *top == id) {
                stack.remove(pos);
                self.active = self.active.saturating_sub(1);
            }
            if stack.is_empty() {
                self.stacks.remove(&thread);
            }
        }
        if self.active == 0 {
            self.safe_tasks.drain(..).collect()
        } else {
            Vec::new()
        }
    }

    /// Queues `task` while transactions are active, otherwise hands it back
    /// to be run by the caller.
    pub fn defer(&mut self, task: SafeTask) -> Option<SafeTask> {
        if self.active == 0 {
            return Some(task);
        }
        self.safe_tasks.push_back(task);
        None
    }

    pub fn queued_tasks(&self) -> usize {
        self.safe_tasks.len()
    }
}
