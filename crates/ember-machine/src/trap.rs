use crate::cpu::Cpu;
use crate::error::TrapError;
use crate::memory::{Memory, VirtAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapCause {
    // Exceptions
    InstructionMisaligned { addr: VirtAddr },
    InstructionAccessFault { addr: VirtAddr },
    IllegalInstruction { instruction: u32 },
    Breakpoint,
    LoadAddressMisaligned { addr: VirtAddr },
    LoadAccessFault { addr: VirtAddr },
    StoreAddressMisaligned { addr: VirtAddr },
    StoreAccessFault { addr: VirtAddr },

    // Environment calls
    EnvironmentCallFromU,
    EnvironmentCallFromS,

    // Page faults
    InstructionPageFault { addr: VirtAddr },
    LoadPageFault { addr: VirtAddr },
    StorePageFault { addr: VirtAddr },

    // Interrupts
    TimerInterrupt,
    ExternalInterrupt,
}

impl TrapCause {
    pub fn is_interrupt(&self) -> bool {
        matches!(
            self,
            TrapCause::TimerInterrupt | TrapCause::ExternalInterrupt
        )
    }
}

/// Implemented by the kernel. The machine invokes it for every trap with
/// the CPU state as of the faulting instruction (`cpu.pc` points at the
/// instruction itself, so returning the same address retries it).
pub trait TrapHandler {
    fn handle_trap(
        &mut self,
        cause: TrapCause,
        cpu: &mut Cpu,
        memory: &mut dyn Memory,
    ) -> Result<VirtAddr, TrapError>;
}
