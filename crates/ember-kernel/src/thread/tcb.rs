use ember_machine::{Cpu, PrivilegeMode, Register, SSTATUS_SPIE, SSTATUS_SUM};

/// Saved guest execution context: the full trap frame plus the CSRs a
/// context switch swaps (`satp`, `sstatus`, privilege mode).
#[derive(Debug, Clone, Copy)]
pub struct TrapContext {
    pub regs: [u64; 32],
    pub sepc: u64,
    pub sstatus: u64,
    pub satp: u64,
    pub mode: PrivilegeMode,
}

impl TrapContext {
    /// A fresh user-mode context: entry point, stack pointer, address
    /// space; previous-interrupt-enable and SUM set the way `exec`
    /// leaves them.
    pub fn new_user(entry: u64, stack_top: u64, mtag: u64) -> Self {
        let mut regs = [0; 32];
        regs[Register::SP.val()] = stack_top;
        Self {
            regs,
            sepc: entry,
            sstatus: SSTATUS_SPIE | SSTATUS_SUM,
            satp: mtag,
            mode: PrivilegeMode::User,
        }
    }

    pub fn save_from(&mut self, cpu: &Cpu) {
        self.regs = cpu.regs;
        self.sepc = cpu.pc;
        self.sstatus = cpu.sstatus;
        self.satp = cpu.satp;
        self.mode = cpu.mode;
    }

    pub fn restore_to(&self, cpu: &mut Cpu) {
        cpu.regs = self.regs;
        cpu.pc = self.sepc;
        cpu.sstatus = self.sstatus;
        cpu.satp = self.satp;
        cpu.mode = self.mode;
    }

    pub fn set_a0(&mut self, val: u64) {
        self.regs[Register::A0.val()] = val;
    }

    pub fn a0(&self) -> u64 {
        self.regs[Register::A0.val()]
    }
}

impl Default for TrapContext {
    fn default() -> Self {
        Self {
            regs: [0; 32],
            sepc: 0,
            sstatus: SSTATUS_SUM,
            satp: 0,
            mode: PrivilegeMode::Supervisor,
        }
    }
}
