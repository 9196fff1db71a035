//! Thread scheduler: thread table, ready list, condition variables and
//! the join/exit protocol.
//!
//! Threads are guest execution contexts. Suspension happens at trap
//! granularity: a blocking operation marks the caller `Waiting`, saves
//! its context, and the kernel switches the CPU to the next ready
//! context. `condition_broadcast` only moves threads to the ready list;
//! it never yields, so it is safe on ISR paths.

pub mod tcb;

use crate::sync::Condition;
use log::debug;
use std::collections::VecDeque;
use tcb::TrapContext;

pub type Tid = usize;
pub type Pid = usize;

/// Maximum number of threads.
pub const NTHR: usize = 16;

pub const MAIN_TID: Tid = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Uninitialized,
    Stopped,
    Waiting,
    Running,
    Ready,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinTarget {
    Any,
    Thread(Tid),
}

impl JoinTarget {
    fn matches(&self, tid: Tid) -> bool {
        match self {
            JoinTarget::Any => true,
            JoinTarget::Thread(t) => *t == tid,
        }
    }
}

pub struct Thread {
    pub id: Tid,
    pub name: String,
    pub state: ThreadState,
    pub context: TrapContext,
    pub parent: Tid,
    pub proc: Option<Pid>,
    pub child_exit: Condition,
    join_target: Option<JoinTarget>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The child had already exited; its id is returned immediately.
    Reaped(Tid),
    /// The caller is now waiting on its child-exit condition.
    Blocked,
    /// The caller has no matching child.
    NoChild,
}

pub struct ThreadManager {
    threads: Vec<Option<Thread>>,
    ready: VecDeque<Tid>,
    current: Tid,
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadManager {
    pub fn new() -> Self {
        let mut threads: Vec<Option<Thread>> = (0..NTHR).map(|_| None).collect();
        threads[MAIN_TID] = Some(Thread {
            id: MAIN_TID,
            name: "main".to_string(),
            state: ThreadState::Running,
            context: TrapContext::default(),
            parent: MAIN_TID,
            proc: None,
            child_exit: Condition::new("main.child_exit"),
            join_target: None,
        });
        Self {
            threads,
            ready: VecDeque::new(),
            current: MAIN_TID,
        }
    }

    pub fn current(&self) -> Tid {
        self.current
    }

    pub fn get(&self, tid: Tid) -> Option<&Thread> {
        self.threads.get(tid).and_then(|t| t.as_ref())
    }

    pub fn get_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.threads.get_mut(tid).and_then(|t| t.as_mut())
    }

    fn thread(&self, tid: Tid) -> &Thread {
        self.get(tid).expect("no such thread")
    }

    fn thread_mut(&mut self, tid: Tid) -> &mut Thread {
        self.get_mut(tid).expect("no such thread")
    }

    pub fn current_thread(&self) -> &Thread {
        self.thread(self.current)
    }

    pub fn current_thread_mut(&mut self) -> &mut Thread {
        self.thread_mut(self.current)
    }

    pub fn name(&self, tid: Tid) -> &str {
        &self.thread(tid).name
    }

    pub fn process_of(&self, tid: Tid) -> Option<Pid> {
        self.thread(tid).proc
    }

    pub fn set_process(&mut self, tid: Tid, proc: Option<Pid>) {
        self.thread_mut(tid).proc = proc;
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Whether any thread other than the current one still exists.
    pub fn live_threads(&self) -> usize {
        self.threads.iter().flatten().count()
    }

    /// Create a thread from a saved context, ready to run. The new
    /// thread's parent is the current thread. Panics when the thread
    /// table is full.
    pub fn spawn(&mut self, name: &str, context: TrapContext, proc: Option<Pid>) -> Tid {
        let tid = (1..NTHR)
            .find(|&t| self.threads[t].is_none())
            .expect("too many threads");

        let mut thread = Thread {
            id: tid,
            name: name.to_string(),
            state: ThreadState::Uninitialized,
            context,
            parent: self.current,
            proc,
            child_exit: Condition::new(&format!("{name}.child_exit")),
            join_target: None,
        };
        thread.state = ThreadState::Ready;
        self.threads[tid] = Some(thread);
        self.ready.push_back(tid);
        debug!("spawned thread <{name}:{tid}>");
        tid
    }

    /// Suspend the current thread on a condition. The caller must
    /// arrange the saved context so that resumption continues correctly
    /// (return value in a0, sepc past the trapping instruction) before
    /// switching away.
    pub fn condition_wait(&mut self, cond: &mut Condition, cpu: &ember_machine::Cpu) {
        let tid = self.current;
        let thread = self.thread_mut(tid);
        assert_eq!(thread.state, ThreadState::Running);
        thread.state = ThreadState::Waiting;
        thread.context.save_from(cpu);
        cond.waiters.push_back(tid);
        debug!("thread <{}:{tid}> waiting on <{}>", self.name(tid), cond.name);
    }

    /// Move every waiter to the ready list in wait order. Entries whose
    /// thread has since exited or stopped are dropped.
    pub fn condition_broadcast(&mut self, cond: &mut Condition) {
        while let Some(tid) = cond.waiters.pop_front() {
            if let Some(thread) = self.get_mut(tid) {
                if thread.state == ThreadState::Waiting {
                    thread.state = ThreadState::Ready;
                    self.ready.push_back(tid);
                }
            }
        }
    }

    /// Yield the CPU: the current thread goes to the back of the ready
    /// list and the head runs next.
    pub fn yield_current(&mut self, cpu: &mut ember_machine::Cpu) {
        let tid = self.current;
        {
            let thread = self.thread_mut(tid);
            assert_eq!(thread.state, ThreadState::Running);
            thread.state = ThreadState::Ready;
            thread.context.save_from(cpu);
        }
        self.ready.push_back(tid);
        let switched = self.schedule(cpu);
        assert!(switched, "ready list lost the yielding thread");
    }

    /// Run the next ready thread. Returns false when the ready list is
    /// empty (the caller idles or halts). The current thread must not be
    /// `Running` when this is called; use `yield_current` for that.
    pub fn schedule(&mut self, cpu: &mut ember_machine::Cpu) -> bool {
        let Some(next) = self.ready.pop_front() else {
            return false;
        };
        let thread = self.thread_mut(next);
        assert_eq!(thread.state, ThreadState::Ready);
        thread.state = ThreadState::Running;
        thread.context.restore_to(cpu);
        self.current = next;
        debug!("switched to thread <{}:{next}>", self.name(next));
        true
    }

    /// Wait for a child to exit. If one already has, it is reaped
    /// immediately; otherwise the caller blocks on its own child-exit
    /// condition and the exiting child completes the join.
    pub fn join(&mut self, target: JoinTarget, cpu: &ember_machine::Cpu) -> JoinOutcome {
        let cur = self.current;

        if let JoinTarget::Thread(tid) = target {
            if tid == cur || self.get(tid).map(|t| t.parent) != Some(cur) {
                return JoinOutcome::NoChild;
            }
        }

        let mut childcnt = 0;
        for tid in 1..NTHR {
            let Some(thread) = self.get(tid) else { continue };
            if thread.parent != cur || !target.matches(tid) {
                continue;
            }
            if thread.state == ThreadState::Exited {
                self.recycle(tid);
                return JoinOutcome::Reaped(tid);
            }
            childcnt += 1;
        }
        if childcnt == 0 {
            return JoinOutcome::NoChild;
        }

        let thread = self.thread_mut(cur);
        assert_eq!(thread.state, ThreadState::Running);
        thread.state = ThreadState::Waiting;
        thread.context.save_from(cpu);
        thread.join_target = Some(target);
        thread.child_exit.waiters.push_back(cur);
        JoinOutcome::Blocked
    }

    /// Terminate the current thread. If the parent is waiting for this
    /// child, the join completes now: the parent becomes ready with the
    /// child's id in its saved `a0` and the child's slot is recycled;
    /// otherwise the thread lingers `Exited` until reaped.
    pub fn exit_current(&mut self) {
        let cur = self.current;
        self.thread_mut(cur).state = ThreadState::Exited;
        debug!("thread <{}:{cur}> exited", self.name(cur));

        let parent = self.thread(cur).parent;
        if parent == cur {
            return;
        }
        let completes = match self.get(parent) {
            Some(p) => {
                p.state == ThreadState::Waiting
                    && p.join_target.map(|t| t.matches(cur)).unwrap_or(false)
            }
            None => false,
        };
        if completes {
            let p = self.thread_mut(parent);
            p.join_target = None;
            p.child_exit.waiters.clear();
            p.state = ThreadState::Ready;
            p.context.set_a0(cur as u64);
            self.ready.push_back(parent);
            self.recycle(cur);
        }
    }

    /// Forcibly stop a thread (used when its process is terminated by
    /// another process). The thread leaves the ready list and its slot
    /// is recycled.
    pub fn stop(&mut self, tid: Tid) {
        if self.get(tid).is_none() || tid == self.current {
            return;
        }
        self.thread_mut(tid).state = ThreadState::Stopped;
        self.ready.retain(|&t| t != tid);
        self.recycle(tid);
    }

    /// Free a thread slot; surviving children are handed to the
    /// grandparent.
    fn recycle(&mut self, tid: Tid) {
        let parent = self.thread(tid).parent;
        for t in 1..NTHR {
            if let Some(thread) = self.threads[t].as_mut() {
                if thread.parent == tid {
                    thread.parent = parent;
                }
            }
        }
        self.threads[tid] = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_machine::Cpu;

    fn cpu() -> Cpu {
        Cpu::new(0x8000_0000)
    }

    #[test]
    fn yield_round_robins() {
        let mut tm = ThreadManager::new();
        let mut cpu = cpu();
        let a = tm.spawn("a", TrapContext::new_user(0x100, 0x200, 0), None);
        let b = tm.spawn("b", TrapContext::new_user(0x300, 0x400, 0), None);

        tm.yield_current(&mut cpu);
        assert_eq!(tm.current(), a);
        assert_eq!(cpu.pc, 0x100);
        tm.yield_current(&mut cpu);
        assert_eq!(tm.current(), b);
        tm.yield_current(&mut cpu);
        assert_eq!(tm.current(), MAIN_TID);
    }

    #[test]
    fn waiters_leave_the_ready_list() {
        let mut tm = ThreadManager::new();
        let mut cpu = cpu();
        let a = tm.spawn("a", TrapContext::new_user(0x100, 0x200, 0), None);
        tm.yield_current(&mut cpu);
        assert_eq!(tm.current(), a);

        let mut cond = Condition::new("test");
        tm.condition_wait(&mut cond, &cpu);
        assert_eq!(tm.get(a).unwrap().state, ThreadState::Waiting);
        assert!(!tm.ready.contains(&a));

        assert!(tm.schedule(&mut cpu));
        assert_eq!(tm.current(), MAIN_TID);

        tm.condition_broadcast(&mut cond);
        assert_eq!(tm.get(a).unwrap().state, ThreadState::Ready);
        assert!(tm.ready.contains(&a));
        assert!(!cond.has_waiters());
    }

    #[test]
    fn join_reaps_exited_child() {
        let mut tm = ThreadManager::new();
        let mut cpu = cpu();
        let a = tm.spawn("a", TrapContext::new_user(0x100, 0x200, 0), None);
        tm.yield_current(&mut cpu);
        assert_eq!(tm.current(), a);
        tm.exit_current();
        assert!(tm.schedule(&mut cpu));

        // Exited child still occupies its slot until joined.
        assert_eq!(tm.get(a).unwrap().state, ThreadState::Exited);
        assert_eq!(tm.join(JoinTarget::Thread(a), &cpu), JoinOutcome::Reaped(a));
        assert!(tm.get(a).is_none());
    }

    #[test]
    fn exit_completes_a_blocked_join() {
        let mut tm = ThreadManager::new();
        let mut cpu = cpu();
        let a = tm.spawn("a", TrapContext::new_user(0x100, 0x200, 0), None);

        assert_eq!(tm.join(JoinTarget::Thread(a), &cpu), JoinOutcome::Blocked);
        assert!(tm.schedule(&mut cpu));
        assert_eq!(tm.current(), a);

        tm.exit_current();
        assert!(tm.schedule(&mut cpu));
        assert_eq!(tm.current(), MAIN_TID);
        assert_eq!(cpu.read_reg(ember_machine::Register::A0), a as u64);
        assert!(tm.get(a).is_none());
    }

    #[test]
    fn join_without_children_fails() {
        let mut tm = ThreadManager::new();
        let cpu = cpu();
        assert_eq!(tm.join(JoinTarget::Any, &cpu), JoinOutcome::NoChild);
        assert_eq!(tm.join(JoinTarget::Thread(5), &cpu), JoinOutcome::NoChild);
    }

    #[test]
    fn recycled_threads_reparent_children() {
        let mut tm = ThreadManager::new();
        let mut cpu = cpu();
        let a = tm.spawn("a", TrapContext::new_user(0x100, 0x200, 0), None);
        tm.yield_current(&mut cpu);
        assert_eq!(tm.current(), a);
        let b = tm.spawn("b", TrapContext::new_user(0x100, 0x200, 0), None);
        tm.exit_current();
        assert!(tm.schedule(&mut cpu));
        // b now belongs to main once a is reaped.
        while tm.current() != MAIN_TID {
            tm.yield_current(&mut cpu);
        }
        assert_eq!(tm.join(JoinTarget::Thread(a), &cpu), JoinOutcome::Reaped(a));
        assert_eq!(tm.get(b).unwrap().parent, MAIN_TID);
    }
}
