//! User processes: the process table and the per-process file
//! descriptor table of strong stream references.

use crate::io::IoRef;
use crate::thread::{Pid, Tid};

/// Maximum number of processes.
pub const NPROC: usize = 16;

/// File descriptors per process.
pub const PROCESS_IOMAX: usize = 16;

pub const MAIN_PID: Pid = 0;

pub struct Process {
    pub id: Pid,
    pub tid: Tid,
    pub mtag: u64,
    pub iotab: [Option<IoRef>; PROCESS_IOMAX],
}

impl Process {
    pub fn new(id: Pid, tid: Tid, mtag: u64) -> Self {
        Self {
            id,
            tid,
            mtag,
            iotab: std::array::from_fn(|_| None),
        }
    }
}

#[derive(Default)]
pub struct ProcessTable {
    procs: Vec<Option<Process>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            procs: (0..NPROC).map(|_| None).collect(),
        }
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.procs.get(pid).and_then(|p| p.as_ref())
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.procs.get_mut(pid).and_then(|p| p.as_mut())
    }

    /// Lowest free process id.
    pub fn free_slot(&self) -> Option<Pid> {
        (0..NPROC).find(|&pid| self.procs[pid].is_none())
    }

    pub fn insert(&mut self, proc: Process) {
        let pid = proc.id;
        assert!(self.procs[pid].is_none(), "process slot {pid} occupied");
        self.procs[pid] = Some(proc);
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Process> {
        self.procs.get_mut(pid).and_then(|p| p.take())
    }

    pub fn count(&self) -> usize {
        self.procs.iter().flatten().count()
    }
}
