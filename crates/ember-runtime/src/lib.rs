//! Assembles a machine with its devices, boots the kernel from a disk
//! image, and runs the result to completion.

use ember_kernel::error::KernelError;
use ember_kernel::memory::KernelLayout;
use ember_kernel::Kernel;
use ember_machine::{
    Cpu, ExitReason, Machine, MachineConfig, MachineError, SystemBus, RAM_START,
};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("boot failed: {0}")]
    Boot(#[from] KernelError),

    #[error("machine error: {0}")]
    Machine(#[from] MachineError),

    #[error("disk image error: {0}")]
    Disk(#[from] std::io::Error),
}

pub struct RuntimeConfig {
    pub memory_size: usize,
    /// mtime advance per executed instruction.
    pub mtime_step: u64,
    /// Name of the init executable on the filesystem image.
    pub init: String,
    /// Echo guest console output to stdout as it is produced.
    pub echo_console: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            memory_size: 8 * 1024 * 1024,
            mtime_step: 100,
            init: "init".to_string(),
            echo_console: true,
        }
    }
}

pub struct Runtime {
    machine: Machine,
}

impl Runtime {
    /// Build the bus, boot the kernel against it, and assemble the
    /// machine around the initialized CPU context.
    pub fn new(disk_image: Vec<u8>, config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let mut bus = SystemBus::new(config.memory_size, disk_image);
        bus.uart.echo = config.echo_console;
        let mut cpu = Cpu::new(RAM_START);

        let layout = KernelLayout::with_ram_end(RAM_START + config.memory_size as u64);
        let kernel = Kernel::boot(&mut cpu, &mut bus, layout, &config.init)?;

        let machine = Machine::from_parts(
            MachineConfig {
                memory_size: config.memory_size,
                mtime_step: config.mtime_step,
            },
            cpu,
            bus,
            Box::new(kernel),
        );
        Ok(Self { machine })
    }

    pub fn load_disk(path: &Path) -> Result<Vec<u8>, RuntimeError> {
        Ok(std::fs::read(path)?)
    }

    pub fn run(&mut self) -> Result<ExitReason, RuntimeError> {
        Ok(self.machine.run()?)
    }

    /// Console output accumulated so far.
    pub fn console_output(&mut self) -> Vec<u8> {
        self.machine.bus.uart.drain_output()
    }

    /// The disk image as the device sees it now.
    pub fn disk_image(&self) -> &[u8] {
        self.machine.bus.vioblk.image()
    }

    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }
}
