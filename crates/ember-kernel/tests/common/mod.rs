#![allow(dead_code)]

//! Shared test fixtures: a machine bus with an attached block device,
//! a kernel wired to it, and a minimal ELF64 writer for building user
//! images.

use ember_kernel::io::{IoCtx, IoRef};
use ember_kernel::memory::KernelLayout;
use ember_kernel::vioblk::VioBlkDevice;
use ember_kernel::Kernel;
use ember_machine::devices::{VIRT0_BASE, VIRT0_IRQ};
use ember_machine::{Cpu, PrivilegeMode, Register, SystemBus, TrapCause, TrapError, TrapHandler,
    RAM_START, SIE_SEIE, SIE_STIE, SSTATUS_SUM};

pub const RAM_SIZE: usize = 8 * 1024 * 1024;

pub struct Env {
    pub kernel: Kernel,
    pub bus: SystemBus,
    pub cpu: Cpu,
}

/// A kernel on a fresh machine with the block device attached; no
/// filesystem mounted yet.
pub fn env_with_disk(disk: Vec<u8>) -> Env {
    let mut bus = SystemBus::new(RAM_SIZE, disk);
    let mut cpu = Cpu::new(RAM_START);
    let layout = KernelLayout::with_ram_end(RAM_START + RAM_SIZE as u64);
    let mut kernel = Kernel::bare(&mut bus, layout);

    cpu.satp = kernel.memory.main_mtag;
    cpu.sstatus |= SSTATUS_SUM;
    cpu.sie |= SIE_STIE | SIE_SEIE;
    kernel.timer.init(&mut bus);
    kernel.intr.init(&mut bus);

    VioBlkDevice::attach(
        &mut bus,
        &mut kernel.memory,
        &mut kernel.intr,
        &mut kernel.devices,
        VIRT0_BASE,
        VIRT0_IRQ,
    )
    .expect("block device attach");

    Env { kernel, bus, cpu }
}

impl Env {
    pub fn open_blk(&mut self) -> Result<IoRef, ember_kernel::error::Errno> {
        let Kernel {
            devices, threads, ..
        } = &mut self.kernel;
        devices.open(
            &mut IoCtx {
                mem: &mut self.bus,
                threads,
            },
            "blk",
            0,
        )
    }

    pub fn with_ctx<R>(&mut self, f: impl FnOnce(&mut IoCtx) -> R) -> R {
        let Kernel { threads, .. } = &mut self.kernel;
        f(&mut IoCtx {
            mem: &mut self.bus,
            threads,
        })
    }

    pub fn mount_fs(&mut self) {
        let blkio = self.open_blk().expect("open blk0");
        let fs = self.with_ctx(|ctx| ember_kernel::fs::FileSystem::mount(ctx, blkio))
            .expect("mount");
        self.kernel.set_fs(fs);
    }

    /// Create process 0 on the main thread and exec `elf` into it, the
    /// way boot does.
    pub fn spawn_init(&mut self, elf: &[u8]) {
        use ember_kernel::process::{Process, MAIN_PID};
        use ember_kernel::thread::MAIN_TID;

        let mtag = self.kernel.memory.space_create(&mut self.bus, 0);
        self.kernel.memory.space_switch(mtag);
        self.cpu.satp = mtag;
        self.kernel.procs.insert(Process::new(MAIN_PID, MAIN_TID, mtag));
        self.kernel.threads.set_process(MAIN_TID, Some(MAIN_PID));

        let io = IoRef::new(ember_kernel::io::IoLit::new(elf.to_vec()));
        self.kernel
            .process_exec(&mut self.cpu, &mut self.bus, io)
            .expect("exec init");
    }

    /// Issue one system call the way the trap path would.
    pub fn syscall(&mut self, a7: u64, a0: u64, a1: u64, a2: u64) -> Result<i64, TrapError> {
        self.cpu.mode = PrivilegeMode::User;
        self.cpu.write_reg(Register::A7, a7);
        self.cpu.write_reg(Register::A0, a0);
        self.cpu.write_reg(Register::A1, a1);
        self.cpu.write_reg(Register::A2, a2);
        let resume =
            self.kernel
                .handle_trap(TrapCause::EnvironmentCallFromU, &mut self.cpu, &mut self.bus)?;
        self.cpu.pc = resume.val();
        Ok(self.cpu.read_reg(Register::A0) as i64)
    }
}

// Minimal ELF64 writer for test images.

pub const PF_X: u32 = 1 << 0;
pub const PF_W: u32 = 1 << 1;
pub const PF_R: u32 = 1 << 2;

pub struct Segment {
    pub vaddr: u64,
    pub data: Vec<u8>,
    pub memsz: u64,
    pub flags: u32,
}

pub fn build_elf(entry: u64, segments: &[Segment]) -> Vec<u8> {
    const EHSIZE: usize = 64;
    const PHENTSIZE: usize = 56;

    let mut out = Vec::new();
    out.extend_from_slice(&[
        0x7F, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    ]);
    out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    out.extend_from_slice(&243u16.to_le_bytes()); // EM_RISCV
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&entry.to_le_bytes());
    out.extend_from_slice(&(EHSIZE as u64).to_le_bytes()); // e_phoff
    out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    out.extend_from_slice(&(EHSIZE as u16).to_le_bytes());
    out.extend_from_slice(&(PHENTSIZE as u16).to_le_bytes());
    out.extend_from_slice(&(segments.len() as u16).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

    let mut offset = (EHSIZE + PHENTSIZE * segments.len()) as u64;
    for seg in segments {
        out.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        out.extend_from_slice(&seg.flags.to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&seg.vaddr.to_le_bytes());
        out.extend_from_slice(&seg.vaddr.to_le_bytes()); // p_paddr
        out.extend_from_slice(&(seg.data.len() as u64).to_le_bytes());
        out.extend_from_slice(&seg.memsz.max(seg.data.len() as u64).to_le_bytes());
        out.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align
        offset += seg.data.len() as u64;
    }
    for seg in segments {
        out.extend_from_slice(&seg.data);
    }
    out
}

/// One RWX segment at the user base holding `words` followed by `data`.
pub fn user_image(words: &[u32], data: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for w in words {
        bytes.extend_from_slice(&w.to_le_bytes());
    }
    bytes.extend_from_slice(data);
    build_elf(
        0xC000_0000,
        &[Segment {
            vaddr: 0xC000_0000,
            data: bytes,
            memsz: 0,
            flags: PF_R | PF_W | PF_X,
        }],
    )
}
