//! Hosted RISC-V rv64 machine: interpreter, Sv39 MMU, system bus and
//! devices. The kernel plugs in as a [`TrapHandler`]; the machine runs
//! guest code until the handler halts it.

pub mod cpu;
pub mod devices;
pub mod encode;
pub mod error;
pub mod instruction;
pub mod memory;
pub mod mmu;
pub mod system_bus;
pub mod trap;

pub use cpu::*;
pub use error::*;
pub use instruction::*;
pub use memory::*;
pub use system_bus::SystemBus;
pub use trap::*;

use mmu::AccessType;

/// Timer frequency the CLINT nominally counts at (QEMU's aclint value).
pub const TIMER_FREQ: u64 = 10_000_000;

pub struct MachineConfig {
    pub memory_size: usize,
    /// How far `mtime` advances per executed instruction.
    pub mtime_step: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            memory_size: 8 * 1024 * 1024,
            mtime_step: 100,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum ExitReason {
    Halt,
}

#[derive(Debug)]
enum StepResult {
    Continue,
    Trap(TrapCause),
}

pub struct Machine {
    pub cpu: Cpu,
    pub bus: SystemBus,
    pub handler: Box<dyn TrapHandler>,
    pub config: MachineConfig,
    pub instret: u64,
}

impl Machine {
    pub fn new(config: MachineConfig, bus: SystemBus, handler: Box<dyn TrapHandler>) -> Self {
        Self::from_parts(config, Cpu::new(RAM_START), bus, handler)
    }

    /// Assemble a machine from a CPU and bus a host-side boot sequence
    /// already initialized.
    pub fn from_parts(
        config: MachineConfig,
        cpu: Cpu,
        bus: SystemBus,
        handler: Box<dyn TrapHandler>,
    ) -> Self {
        Self {
            cpu,
            bus,
            handler,
            config,
            instret: 0,
        }
    }

    fn translate(&mut self, addr: VirtAddr, access: AccessType) -> Result<PhysAddr, TrapCause> {
        mmu::translate(
            addr,
            access,
            self.cpu.satp,
            self.cpu.mode,
            self.cpu.sstatus,
            &mut self.bus,
        )
    }

    /// Deliver one trap to the handler and resume at the address it
    /// returns.
    fn deliver(&mut self, cause: TrapCause) -> Result<Option<ExitReason>, MachineError> {
        match self
            .handler
            .handle_trap(cause, &mut self.cpu, &mut self.bus)
        {
            Ok(resume) => {
                self.cpu.pc = resume.val();
                Ok(None)
            }
            Err(TrapError::Halt) => Ok(Some(ExitReason::Halt)),
            Err(e) => Err(MachineError::Trap(e)),
        }
    }

    fn pending_interrupt(&mut self) -> Option<TrapCause> {
        self.bus.sync_irqs();
        if self.bus.plic.interrupt_pending() && self.cpu.sie & SIE_SEIE != 0 {
            return Some(TrapCause::ExternalInterrupt);
        }
        if self.bus.clint.timer_pending() && self.cpu.sie & SIE_STIE != 0 {
            return Some(TrapCause::TimerInterrupt);
        }
        None
    }

    pub fn run(&mut self) -> Result<ExitReason, MachineError> {
        loop {
            if let Some(cause) = self.pending_interrupt() {
                if let Some(exit) = self.deliver(cause)? {
                    return Ok(exit);
                }
                continue;
            }

            let result = self.step()?;
            self.instret += 1;
            self.bus.clint.mtime = self.bus.clint.mtime.wrapping_add(self.config.mtime_step);

            if let StepResult::Trap(cause) = result {
                if let Some(exit) = self.deliver(cause)? {
                    return Ok(exit);
                }
            }
        }
    }

    /// Load `size` bytes from a virtual address, translating each page.
    fn load(&mut self, addr: u64, size: u64) -> Result<u64, TrapCause> {
        let va = VirtAddr::new(addr);
        if (addr & 0xFFF) + size <= 0x1000 {
            let pa = self.translate(va, AccessType::Read)?;
            let read = match size {
                1 => self.bus.read_byte(pa).map(u64::from),
                2 => self.bus.read_half(pa).map(u64::from),
                4 => self.bus.read_word(pa).map(u64::from),
                8 => self.bus.read_dword(pa),
                _ => unreachable!(),
            };
            read.map_err(|_| TrapCause::LoadAccessFault { addr: va })
        } else {
            // Crosses a page boundary: translate byte by byte.
            let mut val = 0u64;
            for i in 0..size {
                let pa = self.translate(VirtAddr::new(addr + i), AccessType::Read)?;
                let b = self
                    .bus
                    .read_byte(pa)
                    .map_err(|_| TrapCause::LoadAccessFault { addr: va })?;
                val |= (b as u64) << (8 * i);
            }
            Ok(val)
        }
    }

    fn store(&mut self, addr: u64, size: u64, val: u64) -> Result<(), TrapCause> {
        let va = VirtAddr::new(addr);
        if (addr & 0xFFF) + size <= 0x1000 {
            let pa = self.translate(va, AccessType::Write)?;
            let wrote = match size {
                1 => self.bus.write_byte(pa, val as u8),
                2 => self.bus.write_half(pa, val as u16),
                4 => self.bus.write_word(pa, val as u32),
                8 => self.bus.write_dword(pa, val),
                _ => unreachable!(),
            };
            wrote.map_err(|_| TrapCause::StoreAccessFault { addr: va })
        } else {
            for i in 0..size {
                let pa = self.translate(VirtAddr::new(addr + i), AccessType::Write)?;
                self.bus
                    .write_byte(pa, (val >> (8 * i)) as u8)
                    .map_err(|_| TrapCause::StoreAccessFault { addr: va })?;
            }
            Ok(())
        }
    }

    fn step(&mut self) -> Result<StepResult, MachineError> {
        let pc = self.cpu.pc;

        if pc % 4 != 0 {
            return Ok(StepResult::Trap(TrapCause::InstructionMisaligned {
                addr: VirtAddr::new(pc),
            }));
        }

        let pc_phys = match self.translate(VirtAddr::new(pc), AccessType::Execute) {
            Ok(pa) => pa,
            Err(cause) => return Ok(StepResult::Trap(cause)),
        };
        let word = match self.bus.read_word(pc_phys) {
            Ok(w) => w,
            Err(_) => {
                return Ok(StepResult::Trap(TrapCause::InstructionAccessFault {
                    addr: VirtAddr::new(pc),
                }))
            }
        };
        let instruction = match Instruction::decode(word) {
            Ok(i) => i,
            Err(_) => {
                return Ok(StepResult::Trap(TrapCause::IllegalInstruction {
                    instruction: word,
                }))
            }
        };

        // Helper for memory operands; leaves pc at the faulting
        // instruction so the handler can retry it.
        macro_rules! mem {
            ($expr:expr) => {
                match $expr {
                    Ok(v) => v,
                    Err(cause) => return Ok(StepResult::Trap(cause)),
                }
            };
        }

        let mut next_pc = pc.wrapping_add(4);

        match instruction {
            Instruction::Lui { rd, imm } => self.cpu.write_reg(rd, imm as u64),
            Instruction::Auipc { rd, imm } => {
                self.cpu.write_reg(rd, pc.wrapping_add(imm as u64));
            }
            Instruction::Jal { rd, offset } => {
                self.cpu.write_reg(rd, pc.wrapping_add(4));
                next_pc = pc.wrapping_add(offset as u64);
            }
            Instruction::Jalr { rd, rs1, offset } => {
                let target = self.cpu.read_reg(rs1).wrapping_add(offset as u64) & !1;
                self.cpu.write_reg(rd, pc.wrapping_add(4));
                next_pc = target;
            }
            Instruction::Beq { rs1, rs2, offset } => {
                if self.cpu.read_reg(rs1) == self.cpu.read_reg(rs2) {
                    next_pc = pc.wrapping_add(offset as u64);
                }
            }
            Instruction::Bne { rs1, rs2, offset } => {
                if self.cpu.read_reg(rs1) != self.cpu.read_reg(rs2) {
                    next_pc = pc.wrapping_add(offset as u64);
                }
            }
            Instruction::Blt { rs1, rs2, offset } => {
                if (self.cpu.read_reg(rs1) as i64) < (self.cpu.read_reg(rs2) as i64) {
                    next_pc = pc.wrapping_add(offset as u64);
                }
            }
            Instruction::Bge { rs1, rs2, offset } => {
                if (self.cpu.read_reg(rs1) as i64) >= (self.cpu.read_reg(rs2) as i64) {
                    next_pc = pc.wrapping_add(offset as u64);
                }
            }
            Instruction::Bltu { rs1, rs2, offset } => {
                if self.cpu.read_reg(rs1) < self.cpu.read_reg(rs2) {
                    next_pc = pc.wrapping_add(offset as u64);
                }
            }
            Instruction::Bgeu { rs1, rs2, offset } => {
                if self.cpu.read_reg(rs1) >= self.cpu.read_reg(rs2) {
                    next_pc = pc.wrapping_add(offset as u64);
                }
            }
            Instruction::Lb { rd, rs1, offset } => {
                let addr = self.cpu.read_reg(rs1).wrapping_add(offset as u64);
                let val = mem!(self.load(addr, 1));
                self.cpu.write_reg(rd, val as i8 as i64 as u64);
            }
            Instruction::Lh { rd, rs1, offset } => {
                let addr = self.cpu.read_reg(rs1).wrapping_add(offset as u64);
                let val = mem!(self.load(addr, 2));
                self.cpu.write_reg(rd, val as i16 as i64 as u64);
            }
            Instruction::Lw { rd, rs1, offset } => {
                let addr = self.cpu.read_reg(rs1).wrapping_add(offset as u64);
                let val = mem!(self.load(addr, 4));
                self.cpu.write_reg(rd, val as i32 as i64 as u64);
            }
            Instruction::Ld { rd, rs1, offset } => {
                let addr = self.cpu.read_reg(rs1).wrapping_add(offset as u64);
                let val = mem!(self.load(addr, 8));
                self.cpu.write_reg(rd, val);
            }
            Instruction::Lbu { rd, rs1, offset } => {
                let addr = self.cpu.read_reg(rs1).wrapping_add(offset as u64);
                let val = mem!(self.load(addr, 1));
                self.cpu.write_reg(rd, val);
            }
            Instruction::Lhu { rd, rs1, offset } => {
                let addr = self.cpu.read_reg(rs1).wrapping_add(offset as u64);
                let val = mem!(self.load(addr, 2));
                self.cpu.write_reg(rd, val);
            }
            Instruction::Lwu { rd, rs1, offset } => {
                let addr = self.cpu.read_reg(rs1).wrapping_add(offset as u64);
                let val = mem!(self.load(addr, 4));
                self.cpu.write_reg(rd, val);
            }
            Instruction::Sb { rs1, rs2, offset } => {
                let addr = self.cpu.read_reg(rs1).wrapping_add(offset as u64);
                mem!(self.store(addr, 1, self.cpu.read_reg(rs2)));
            }
            Instruction::Sh { rs1, rs2, offset } => {
                let addr = self.cpu.read_reg(rs1).wrapping_add(offset as u64);
                mem!(self.store(addr, 2, self.cpu.read_reg(rs2)));
            }
            Instruction::Sw { rs1, rs2, offset } => {
                let addr = self.cpu.read_reg(rs1).wrapping_add(offset as u64);
                mem!(self.store(addr, 4, self.cpu.read_reg(rs2)));
            }
            Instruction::Sd { rs1, rs2, offset } => {
                let addr = self.cpu.read_reg(rs1).wrapping_add(offset as u64);
                mem!(self.store(addr, 8, self.cpu.read_reg(rs2)));
            }
            Instruction::Addi { rd, rs1, imm } => {
                self.cpu
                    .write_reg(rd, self.cpu.read_reg(rs1).wrapping_add(imm as u64));
            }
            Instruction::Slti { rd, rs1, imm } => {
                let val = ((self.cpu.read_reg(rs1) as i64) < imm) as u64;
                self.cpu.write_reg(rd, val);
            }
            Instruction::Sltiu { rd, rs1, imm } => {
                let val = (self.cpu.read_reg(rs1) < imm as u64) as u64;
                self.cpu.write_reg(rd, val);
            }
            Instruction::Xori { rd, rs1, imm } => {
                self.cpu.write_reg(rd, self.cpu.read_reg(rs1) ^ imm as u64);
            }
            Instruction::Ori { rd, rs1, imm } => {
                self.cpu.write_reg(rd, self.cpu.read_reg(rs1) | imm as u64);
            }
            Instruction::Andi { rd, rs1, imm } => {
                self.cpu.write_reg(rd, self.cpu.read_reg(rs1) & imm as u64);
            }
            Instruction::Slli { rd, rs1, shamt } => {
                self.cpu.write_reg(rd, self.cpu.read_reg(rs1) << shamt);
            }
            Instruction::Srli { rd, rs1, shamt } => {
                self.cpu.write_reg(rd, self.cpu.read_reg(rs1) >> shamt);
            }
            Instruction::Srai { rd, rs1, shamt } => {
                self.cpu
                    .write_reg(rd, ((self.cpu.read_reg(rs1) as i64) >> shamt) as u64);
            }
            Instruction::Addiw { rd, rs1, imm } => {
                let val = (self.cpu.read_reg(rs1) as i32).wrapping_add(imm as i32);
                self.cpu.write_reg(rd, val as i64 as u64);
            }
            Instruction::Slliw { rd, rs1, shamt } => {
                let val = (self.cpu.read_reg(rs1) as i32) << shamt;
                self.cpu.write_reg(rd, val as i64 as u64);
            }
            Instruction::Srliw { rd, rs1, shamt } => {
                let val = ((self.cpu.read_reg(rs1) as u32) >> shamt) as i32;
                self.cpu.write_reg(rd, val as i64 as u64);
            }
            Instruction::Sraiw { rd, rs1, shamt } => {
                let val = (self.cpu.read_reg(rs1) as i32) >> shamt;
                self.cpu.write_reg(rd, val as i64 as u64);
            }
            Instruction::Add { rd, rs1, rs2 } => {
                self.cpu.write_reg(
                    rd,
                    self.cpu.read_reg(rs1).wrapping_add(self.cpu.read_reg(rs2)),
                );
            }
            Instruction::Sub { rd, rs1, rs2 } => {
                self.cpu.write_reg(
                    rd,
                    self.cpu.read_reg(rs1).wrapping_sub(self.cpu.read_reg(rs2)),
                );
            }
            Instruction::Sll { rd, rs1, rs2 } => {
                let shamt = self.cpu.read_reg(rs2) & 0x3F;
                self.cpu.write_reg(rd, self.cpu.read_reg(rs1) << shamt);
            }
            Instruction::Slt { rd, rs1, rs2 } => {
                let val = ((self.cpu.read_reg(rs1) as i64) < (self.cpu.read_reg(rs2) as i64)) as u64;
                self.cpu.write_reg(rd, val);
            }
            Instruction::Sltu { rd, rs1, rs2 } => {
                let val = (self.cpu.read_reg(rs1) < self.cpu.read_reg(rs2)) as u64;
                self.cpu.write_reg(rd, val);
            }
            Instruction::Xor { rd, rs1, rs2 } => {
                self.cpu
                    .write_reg(rd, self.cpu.read_reg(rs1) ^ self.cpu.read_reg(rs2));
            }
            Instruction::Srl { rd, rs1, rs2 } => {
                let shamt = self.cpu.read_reg(rs2) & 0x3F;
                self.cpu.write_reg(rd, self.cpu.read_reg(rs1) >> shamt);
            }
            Instruction::Sra { rd, rs1, rs2 } => {
                let shamt = self.cpu.read_reg(rs2) & 0x3F;
                self.cpu
                    .write_reg(rd, ((self.cpu.read_reg(rs1) as i64) >> shamt) as u64);
            }
            Instruction::Or { rd, rs1, rs2 } => {
                self.cpu
                    .write_reg(rd, self.cpu.read_reg(rs1) | self.cpu.read_reg(rs2));
            }
            Instruction::And { rd, rs1, rs2 } => {
                self.cpu
                    .write_reg(rd, self.cpu.read_reg(rs1) & self.cpu.read_reg(rs2));
            }
            Instruction::Addw { rd, rs1, rs2 } => {
                let val = (self.cpu.read_reg(rs1) as i32).wrapping_add(self.cpu.read_reg(rs2) as i32);
                self.cpu.write_reg(rd, val as i64 as u64);
            }
            Instruction::Subw { rd, rs1, rs2 } => {
                let val = (self.cpu.read_reg(rs1) as i32).wrapping_sub(self.cpu.read_reg(rs2) as i32);
                self.cpu.write_reg(rd, val as i64 as u64);
            }
            Instruction::Sllw { rd, rs1, rs2 } => {
                let shamt = self.cpu.read_reg(rs2) & 0x1F;
                let val = (self.cpu.read_reg(rs1) as i32) << shamt;
                self.cpu.write_reg(rd, val as i64 as u64);
            }
            Instruction::Srlw { rd, rs1, rs2 } => {
                let shamt = self.cpu.read_reg(rs2) & 0x1F;
                let val = ((self.cpu.read_reg(rs1) as u32) >> shamt) as i32;
                self.cpu.write_reg(rd, val as i64 as u64);
            }
            Instruction::Sraw { rd, rs1, rs2 } => {
                let shamt = self.cpu.read_reg(rs2) & 0x1F;
                let val = (self.cpu.read_reg(rs1) as i32) >> shamt;
                self.cpu.write_reg(rd, val as i64 as u64);
            }
            Instruction::Fence => {}
            Instruction::Ecall => {
                let cause = match self.cpu.mode {
                    PrivilegeMode::User => TrapCause::EnvironmentCallFromU,
                    _ => TrapCause::EnvironmentCallFromS,
                };
                return Ok(StepResult::Trap(cause));
            }
            Instruction::Ebreak => {
                return Ok(StepResult::Trap(TrapCause::Breakpoint));
            }
        }

        self.cpu.pc = next_pc;
        Ok(StepResult::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Register;

    struct HaltOnEcall;

    impl TrapHandler for HaltOnEcall {
        fn handle_trap(
            &mut self,
            cause: TrapCause,
            _cpu: &mut Cpu,
            _memory: &mut dyn Memory,
        ) -> Result<VirtAddr, TrapError> {
            match cause {
                TrapCause::EnvironmentCallFromS | TrapCause::EnvironmentCallFromU => {
                    Err(TrapError::Halt)
                }
                other => Err(TrapError::Unhandled(other)),
            }
        }
    }

    fn run_program(words: &[u32]) -> Machine {
        let bus = SystemBus::new(64 * 1024, Vec::new());
        let mut machine = Machine::new(
            MachineConfig {
                memory_size: 64 * 1024,
                mtime_step: 1,
            },
            bus,
            Box::new(HaltOnEcall),
        );
        let mut bytes = Vec::new();
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        machine.bus.ram.load(PhysAddr::new(RAM_START), &bytes).unwrap();
        assert_eq!(machine.run().unwrap(), ExitReason::Halt);
        machine
    }

    #[test]
    fn arithmetic_and_branches_execute() {
        // a0 = 5; a1 = 7; a0 += a1; if a0 == 12 skip poison; ecall
        let a0 = Register::A0;
        let a1 = Register::A1;
        let t0 = Register::T0;
        let m = run_program(&[
            encode::addi(a0, Register::ZERO, 5),
            encode::addi(a1, Register::ZERO, 7),
            encode::add(a0, a0, a1),
            encode::addi(t0, Register::ZERO, 12),
            encode::beq(a0, t0, 8),
            encode::addi(a0, Register::ZERO, -1),
            encode::ecall(),
        ]);
        assert_eq!(m.cpu.read_reg(a0), 12);
    }

    #[test]
    fn loads_and_stores_round_trip() {
        let a0 = Register::A0;
        let a1 = Register::A1;
        // Store a sign-extended value, read it back as byte and dword.
        let mut program = vec![
            encode::addi(a0, Register::ZERO, -2), // 0xFFFF...FFFE
        ];
        program.extend(encode::li_va(a1, RAM_START + 0x800));
        program.extend([
            encode::sd(a1, a0, 0),
            encode::lbu(a0, a1, 0),
            encode::ecall(),
        ]);
        let m = run_program(&program);
        assert_eq!(m.cpu.read_reg(a0), 0xFE);
    }

    #[test]
    fn word_ops_sign_extend() {
        let a0 = Register::A0;
        let m = run_program(&[
            // addiw a0, x0, -1 -> 0xFFFF_FFFF_FFFF_FFFF
            encode::addiw(a0, Register::ZERO, -1),
            encode::ecall(),
        ]);
        assert_eq!(m.cpu.read_reg(a0), u64::MAX);
    }

    #[test]
    fn illegal_instructions_trap() {
        let bus = SystemBus::new(64 * 1024, Vec::new());
        let mut machine = Machine::new(MachineConfig::default(), bus, Box::new(HaltOnEcall));
        machine
            .bus
            .ram
            .load(PhysAddr::new(RAM_START), &0xFFFF_FFFFu32.to_le_bytes())
            .unwrap();
        let err = machine.run().unwrap_err();
        assert!(matches!(
            err,
            MachineError::Trap(TrapError::Unhandled(TrapCause::IllegalInstruction { .. }))
        ));
    }
}
