//! The Ember kernel: trap dispatch, system calls and the process life
//! cycle, tying together the memory manager, scheduler, drivers and
//! filesystem. The kernel runs as host code; the machine invokes
//! [`TrapHandler::handle_trap`] for every guest trap with the CPU parked
//! on the trapping instruction.

pub mod device;
pub mod error;
pub mod fs;
pub mod intr;
pub mod io;
pub mod loader;
pub mod memory;
pub mod process;
pub mod sync;
pub mod syscall;
pub mod thread;
pub mod timer;
pub mod vioblk;

use crate::device::DeviceManager;
use crate::error::{Errno, KResult, KernelError};
use crate::fs::FileSystem;
use crate::intr::IntrController;
use crate::io::{IoCtx, IoRef, IOCTL_GETBLKSZ, IOCTL_GETLEN, IOCTL_GETPOS, IOCTL_SETPOS};
use crate::memory::{FaultOutcome, KernelLayout, MemoryManager, Pte, USER_STACK_VMA};
use crate::process::{Process, ProcessTable, MAIN_PID, PROCESS_IOMAX};
use crate::syscall::Syscall;
use crate::thread::tcb::TrapContext;
use crate::thread::{JoinOutcome, JoinTarget, Pid, ThreadManager, MAIN_TID};
use crate::timer::Timer;
use crate::vioblk::VioBlkDevice;
use ember_machine::devices::{UART0_BASE, VIRT0_BASE, VIRT0_IRQ};
use ember_machine::{
    Cpu, Memory, PhysAddr, PrivilegeMode, Register, TrapCause, TrapError, TrapHandler, VirtAddr,
    SIE_SEIE, SIE_STIE, SSTATUS_SUM, TIMER_FREQ,
};
use log::{debug, info, warn};
use std::cell::RefCell;
use std::rc::Rc;

pub struct Kernel {
    pub memory: MemoryManager,
    pub threads: ThreadManager,
    pub timer: Timer,
    pub intr: IntrController,
    pub devices: DeviceManager,
    pub procs: ProcessTable,
    fs: Option<Rc<RefCell<FileSystem>>>,
}

impl Kernel {
    /// Bring the system up on a fresh machine: memory manager, timer,
    /// interrupt controller, block device, filesystem; then load the
    /// named init executable as process 0 on the main thread.
    pub fn boot(
        cpu: &mut Cpu,
        mem: &mut dyn Memory,
        layout: KernelLayout,
        init_name: &str,
    ) -> Result<Kernel, KernelError> {
        let memory = MemoryManager::init(mem, layout);
        cpu.satp = memory.main_mtag;
        cpu.sstatus |= SSTATUS_SUM;

        let mut timer = Timer::new();
        timer.init(mem);
        let mut intr = IntrController::new();
        intr.init(mem);
        cpu.sie |= SIE_STIE | SIE_SEIE;

        let mut kernel = Kernel {
            memory,
            threads: ThreadManager::new(),
            timer,
            intr,
            devices: DeviceManager::new(),
            procs: ProcessTable::new(),
            fs: None,
        };

        match VioBlkDevice::attach(
            mem,
            &mut kernel.memory,
            &mut kernel.intr,
            &mut kernel.devices,
            VIRT0_BASE,
            VIRT0_IRQ,
        ) {
            Ok(_) => {}
            Err(e) => warn!("no block device at {VIRT0_BASE:#x}: {e}"),
        }

        // Mount the filesystem on blk0.
        let blkio = {
            let Kernel {
                devices, threads, ..
            } = &mut kernel;
            devices
                .open(&mut IoCtx { mem: &mut *mem, threads }, "blk", 0)
                .map_err(KernelError::BootImage)?
        };
        let fs = {
            let Kernel { threads, .. } = &mut kernel;
            FileSystem::mount(&mut IoCtx { mem: &mut *mem, threads }, blkio)
                .map_err(KernelError::BootImage)?
        };
        kernel.fs = Some(Rc::clone(&fs));

        // Process 0 runs init on the main thread.
        let mtag = kernel.memory.space_create(mem, MAIN_PID as u16);
        kernel.memory.space_switch(mtag);
        cpu.satp = mtag;
        kernel.procs.insert(Process::new(MAIN_PID, MAIN_TID, mtag));
        kernel.threads.set_process(MAIN_TID, Some(MAIN_PID));

        let initio = {
            let Kernel { threads, .. } = &mut kernel;
            FileSystem::open(&fs, &mut IoCtx { mem: &mut *mem, threads }, init_name)
                .map_err(KernelError::BootImage)?
        };
        kernel
            .process_exec(cpu, mem, initio.clone())
            .map_err(KernelError::BootImage)?;
        {
            let Kernel { threads, .. } = &mut kernel;
            initio.close(&mut IoCtx { mem: &mut *mem, threads });
        }

        info!("boot complete, entering \"{init_name}\"");
        Ok(kernel)
    }

    /// A kernel without devices or filesystem, for exercising subsystems
    /// directly.
    pub fn bare(mem: &mut dyn Memory, layout: KernelLayout) -> Kernel {
        Kernel {
            memory: MemoryManager::init(mem, layout),
            threads: ThreadManager::new(),
            timer: Timer::new(),
            intr: IntrController::new(),
            devices: DeviceManager::new(),
            procs: ProcessTable::new(),
            fs: None,
        }
    }

    pub fn fs(&self) -> Option<Rc<RefCell<FileSystem>>> {
        self.fs.clone()
    }

    pub fn set_fs(&mut self, fs: Rc<RefCell<FileSystem>>) {
        self.fs = Some(fs);
    }

    fn console_write(&self, mem: &mut dyn Memory, s: &str) {
        for &b in s.as_bytes() {
            let _ = mem.write_byte(PhysAddr::new(UART0_BASE), b);
        }
    }

    fn current_pid(&self) -> Option<Pid> {
        self.threads.process_of(self.threads.current())
    }

    fn fd_entry(&self, fd: i64) -> KResult<IoRef> {
        if !(0..PROCESS_IOMAX as i64).contains(&fd) {
            return Err(Errno::BadFd);
        }
        let pid = self.current_pid().ok_or(Errno::BadFd)?;
        self.procs
            .get(pid)
            .and_then(|p| p.iotab[fd as usize].clone())
            .ok_or(Errno::BadFd)
    }

    /// Place a stream in the fd table: a non-negative `fd` names the
    /// slot (busy if occupied), a negative one picks the lowest free
    /// slot.
    fn install_fd(&mut self, fd: i64, io: IoRef) -> KResult<u64> {
        let pid = self.current_pid().ok_or(Errno::BadFd)?;
        let proc = self.procs.get_mut(pid).ok_or(Errno::BadFd)?;
        let slot = if fd >= 0 {
            if fd >= PROCESS_IOMAX as i64 {
                return Err(Errno::BadFd);
            }
            if proc.iotab[fd as usize].is_some() {
                return Err(Errno::Busy);
            }
            fd as usize
        } else {
            proc.iotab
                .iter()
                .position(|e| e.is_none())
                .ok_or(Errno::MFile)?
        };
        proc.iotab[slot] = Some(io);
        Ok(slot as u64)
    }

    /// Pick the next runnable guest context. With nothing ready the
    /// kernel idles the way the idle thread would: fast-forward time to
    /// the next alarm and service the timer. With no sleepers left
    /// either, the machine halts.
    fn schedule_next(&mut self, cpu: &mut Cpu, mem: &mut dyn Memory) -> Result<(), TrapError> {
        loop {
            if self.threads.schedule(cpu) {
                self.memory.set_active(cpu.satp);
                return Ok(());
            }
            if self.timer.fast_forward(mem) {
                self.timer.intr_handler(mem, &mut self.threads);
                continue;
            }
            debug!("no runnable threads and no sleepers; halting");
            return Err(TrapError::Halt);
        }
    }

    // Process life cycle

    /// Replace the current process image with the ELF read from `io`.
    /// The image is copied out of the stream before the user space is
    /// torn down.
    pub fn process_exec(
        &mut self,
        cpu: &mut Cpu,
        mem: &mut dyn Memory,
        io: IoRef,
    ) -> KResult<()> {
        let image = {
            let Kernel { threads, .. } = self;
            let mut ctx = IoCtx { mem: &mut *mem, threads };
            let len = io.ctl(&mut ctx, IOCTL_GETLEN, 0)?;
            io.seek(&mut ctx, 0)?;
            let mut image = vec![0u8; len as usize];
            if io.read_full(&mut ctx, &mut image)? != image.len() {
                return Err(Errno::Io);
            }
            image
        };

        self.memory.unmap_and_free_user(mem);
        let entry = loader::load_elf(&mut self.memory, mem, &image)?;

        // Enter user mode at the image entry with a clean register file
        // and the stack pointer at the top of the user range; the first
        // push demand-pages the stack.
        let context = TrapContext::new_user(entry, USER_STACK_VMA, self.memory.active_mtag());
        context.restore_to(cpu);
        Ok(())
    }

    /// Clone the current process: address space, fd table (adding a
    /// reference per entry) and a child thread resuming after the
    /// `ecall` with `a0` = 0.
    pub fn process_fork(&mut self, cpu: &Cpu, mem: &mut dyn Memory) -> KResult<u64> {
        let parent_pid = self.current_pid().ok_or(Errno::Inval)?;
        let pid = self.procs.free_slot().ok_or(Errno::Inval)?;

        let mtag = self.memory.space_clone(mem, pid as u16);

        let iotab: Vec<Option<IoRef>> = self.procs.get(parent_pid).unwrap().iotab.to_vec();
        for io in iotab.iter().flatten() {
            io.addref();
        }

        let mut context = TrapContext::default();
        context.save_from(cpu);
        context.sepc += 4;
        context.set_a0(0);
        context.satp = mtag;

        let name = format!("{}-fork", self.threads.name(self.threads.current()));
        let tid = self.threads.spawn(&name, context, Some(pid));

        let mut proc = Process::new(pid, tid, mtag);
        for (slot, io) in iotab.into_iter().enumerate() {
            proc.iotab[slot] = io;
        }
        self.procs.insert(proc);

        debug!("forked process {pid} (thread {tid}) from {parent_pid}");
        Ok(pid as u64)
    }

    /// Tear down the current process and switch to the next runnable
    /// thread; `Err(Halt)` when it was the last one.
    pub fn process_exit(&mut self, cpu: &mut Cpu, mem: &mut dyn Memory) -> Result<(), TrapError> {
        let tid = self.threads.current();
        let pid = self.current_pid();
        debug!("process {pid:?} (thread {tid}) exiting");

        self.memory.space_reclaim(mem);

        if let Some(pid) = pid {
            // Close every descriptor; the main kernel process keeps its
            // table slot.
            let iotab: Vec<IoRef> = if pid == MAIN_PID {
                self.procs
                    .get_mut(pid)
                    .map(|p| p.iotab.iter_mut().filter_map(|e| e.take()).collect())
                    .unwrap_or_default()
            } else {
                self.procs
                    .remove(pid)
                    .map(|p| p.iotab.into_iter().flatten().collect())
                    .unwrap_or_default()
            };
            let Kernel { threads, .. } = self;
            let mut ctx = IoCtx { mem: &mut *mem, threads };
            for io in &iotab {
                io.close(&mut ctx);
            }
        }

        self.threads.set_process(tid, None);
        self.threads.exit_current();
        self.schedule_next(cpu, mem)
    }

    /// Force the same steps on a target process. The caller keeps
    /// running; the victim's thread is stopped and its resources
    /// reclaimed.
    pub fn process_terminate(&mut self, mem: &mut dyn Memory, pid: Pid) -> KResult<()> {
        if self.current_pid() == Some(pid) {
            return Err(Errno::Inval);
        }
        let proc = self.procs.remove(pid).ok_or(Errno::Inval)?;

        // Reclaim the victim's space, then restore the caller's.
        let caller_mtag = self.memory.space_switch(proc.mtag);
        self.memory.space_reclaim(mem);
        self.memory.space_switch(caller_mtag);

        {
            let Kernel { threads, .. } = self;
            let mut ctx = IoCtx { mem: &mut *mem, threads };
            for io in proc.iotab.iter().flatten() {
                io.close(&mut ctx);
            }
        }

        self.timer.remove_waiter(proc.tid);
        self.threads.set_process(proc.tid, None);
        self.threads.stop(proc.tid);
        Ok(())
    }

    /// A fatal exception in user mode terminates the process; other
    /// processes keep running.
    fn fatal_user_exception(
        &mut self,
        cpu: &mut Cpu,
        mem: &mut dyn Memory,
        what: &str,
    ) -> Result<VirtAddr, TrapError> {
        warn!(
            "thread <{}:{}>: {what} at {:#x}, terminating process",
            self.threads.name(self.threads.current()),
            self.threads.current(),
            cpu.pc
        );
        self.process_exit(cpu, mem)?;
        Ok(VirtAddr::new(cpu.pc))
    }

    // System calls

    fn sys_msgout(&mut self, mem: &mut dyn Memory, msg: u64) -> KResult<u64> {
        self.memory.validate_vstr(mem, msg, Pte::U)?;
        let s = self.memory.read_user_cstr(mem, msg)?;
        let tid = self.threads.current();
        let line = format!("Thread <{}:{}> says: {}\n", self.threads.name(tid), tid, s);
        self.console_write(mem, &line);
        Ok(0)
    }

    fn sys_devopen(
        &mut self,
        mem: &mut dyn Memory,
        fd: i64,
        name: u64,
        instno: i64,
    ) -> KResult<u64> {
        self.memory.validate_vstr(mem, name, Pte::U)?;
        let name = self.memory.read_user_cstr(mem, name)?;
        if instno < 0 {
            return Err(Errno::Inval);
        }
        let io = {
            let Kernel {
                devices, threads, ..
            } = self;
            devices.open(&mut IoCtx { mem: &mut *mem, threads }, &name, instno as u32)?
        };
        self.install_fd(fd, io)
    }

    fn sys_fsopen(&mut self, mem: &mut dyn Memory, fd: i64, name: u64) -> KResult<u64> {
        self.memory.validate_vstr(mem, name, Pte::U)?;
        let name = self.memory.read_user_cstr(mem, name)?;
        let fs = self.fs.clone().ok_or(Errno::NoDev)?;
        let io = {
            let Kernel { threads, .. } = self;
            FileSystem::open(&fs, &mut IoCtx { mem: &mut *mem, threads }, &name)?
        };
        self.install_fd(fd, io)
    }

    fn sys_close(&mut self, mem: &mut dyn Memory, fd: i64) -> KResult<u64> {
        if !(0..PROCESS_IOMAX as i64).contains(&fd) {
            return Err(Errno::BadFd);
        }
        let pid = self.current_pid().ok_or(Errno::BadFd)?;
        let io = self
            .procs
            .get_mut(pid)
            .and_then(|p| p.iotab[fd as usize].take())
            .ok_or(Errno::BadFd)?;
        let Kernel { threads, .. } = self;
        io.close(&mut IoCtx { mem: &mut *mem, threads });
        Ok(0)
    }

    fn sys_read(&mut self, mem: &mut dyn Memory, fd: i64, buf: u64, len: u64) -> KResult<u64> {
        self.memory
            .validate_vptr_len(mem, buf, len, Pte::W | Pte::U)?;
        let io = self.fd_entry(fd)?;
        let mut data = vec![0u8; len as usize];
        let n = {
            let Kernel { threads, .. } = self;
            io.read_full(&mut IoCtx { mem: &mut *mem, threads }, &mut data)?
        };
        self.memory.copy_to_active(mem, buf, &data[..n])?;
        Ok(n as u64)
    }

    fn sys_write(&mut self, mem: &mut dyn Memory, fd: i64, buf: u64, len: u64) -> KResult<u64> {
        self.memory
            .validate_vptr_len(mem, buf, len, Pte::R | Pte::U)?;
        let io = self.fd_entry(fd)?;
        let mut data = vec![0u8; len as usize];
        self.memory.copy_from_active(mem, buf, &mut data)?;
        let Kernel { threads, .. } = self;
        let n = io.write_all(&mut IoCtx { mem: &mut *mem, threads }, &data)?;
        Ok(n as u64)
    }

    fn sys_ioctl(
        &mut self,
        mem: &mut dyn Memory,
        fd: i64,
        cmd: i32,
        arg: u64,
    ) -> KResult<u64> {
        let io = self.fd_entry(fd)?;
        match cmd {
            IOCTL_GETLEN | IOCTL_GETPOS | IOCTL_GETBLKSZ => {
                self.memory.validate_vptr_len(mem, arg, 8, Pte::W | Pte::U)?;
                let val = {
                    let Kernel { threads, .. } = self;
                    io.ctl(&mut IoCtx { mem: &mut *mem, threads }, cmd, 0)?
                };
                self.memory.copy_to_active(mem, arg, &val.to_le_bytes())?;
                Ok(0)
            }
            IOCTL_SETPOS => {
                self.memory.validate_vptr_len(mem, arg, 8, Pte::R | Pte::U)?;
                let mut bytes = [0u8; 8];
                self.memory.copy_from_active(mem, arg, &mut bytes)?;
                let Kernel { threads, .. } = self;
                io.ctl(&mut IoCtx { mem: &mut *mem, threads }, cmd, u64::from_le_bytes(bytes))?;
                Ok(0)
            }
            _ => {
                let Kernel { threads, .. } = self;
                io.ctl(&mut IoCtx { mem: &mut *mem, threads }, cmd, arg)?;
                Ok(0)
            }
        }
    }

    fn sys_exec(&mut self, cpu: &mut Cpu, mem: &mut dyn Memory, fd: i64) -> KResult<()> {
        let io = self.fd_entry(fd)?;
        self.process_exec(cpu, mem, io)
    }

    fn handle_syscall(
        &mut self,
        cpu: &mut Cpu,
        mem: &mut dyn Memory,
    ) -> Result<VirtAddr, TrapError> {
        let call = match Syscall::decode(cpu) {
            Ok(call) => call,
            Err(e) => {
                Syscall::encode_result(cpu, Err(e));
                return Ok(VirtAddr::new(cpu.pc + 4));
            }
        };
        debug!("syscall {:?} from thread {}", call, self.threads.current());

        match call {
            Syscall::Exit => {
                self.process_exit(cpu, mem)?;
                Ok(VirtAddr::new(cpu.pc))
            }
            Syscall::Exec { fd } => match self.sys_exec(cpu, mem, fd) {
                Ok(()) => Ok(VirtAddr::new(cpu.pc)),
                Err(e) => {
                    Syscall::encode_result(cpu, Err(e));
                    Ok(VirtAddr::new(cpu.pc + 4))
                }
            },
            Syscall::Wait { tid } => {
                let target = if tid == 0 {
                    JoinTarget::Any
                } else {
                    JoinTarget::Thread(tid as usize)
                };
                cpu.pc += 4;
                match self.threads.join(target, cpu) {
                    JoinOutcome::Reaped(t) => cpu.write_reg(Register::A0, t as u64),
                    JoinOutcome::Blocked => self.schedule_next(cpu, mem)?,
                    JoinOutcome::NoChild => {
                        cpu.write_reg(Register::A0, Errno::Inval.code() as u64)
                    }
                }
                Ok(VirtAddr::new(cpu.pc))
            }
            Syscall::Usleep { us } => {
                cpu.pc += 4;
                cpu.write_reg(Register::A0, 0);
                if us > 0 {
                    let ticks = us.saturating_mul(TIMER_FREQ / 1_000_000);
                    if self.timer.alarm_sleep(&mut self.threads, mem, cpu, ticks) {
                        self.schedule_next(cpu, mem)?;
                    }
                }
                Ok(VirtAddr::new(cpu.pc))
            }
            immediate => {
                let result = match immediate {
                    Syscall::Msgout { msg } => self.sys_msgout(mem, msg),
                    Syscall::DevOpen { fd, name, instno } => {
                        self.sys_devopen(mem, fd, name, instno)
                    }
                    Syscall::FsOpen { fd, name } => self.sys_fsopen(mem, fd, name),
                    Syscall::Close { fd } => self.sys_close(mem, fd),
                    Syscall::Read { fd, buf, len } => self.sys_read(mem, fd, buf, len),
                    Syscall::Write { fd, buf, len } => self.sys_write(mem, fd, buf, len),
                    Syscall::Ioctl { fd, cmd, arg } => self.sys_ioctl(mem, fd, cmd, arg),
                    Syscall::Fork => self.process_fork(cpu, mem),
                    _ => unreachable!(),
                };
                Syscall::encode_result(cpu, result);
                Ok(VirtAddr::new(cpu.pc + 4))
            }
        }
    }
}

impl TrapHandler for Kernel {
    fn handle_trap(
        &mut self,
        cause: TrapCause,
        cpu: &mut Cpu,
        mem: &mut dyn Memory,
    ) -> Result<VirtAddr, TrapError> {
        match cause {
            TrapCause::TimerInterrupt => {
                self.timer.intr_handler(mem, &mut self.threads);
                // Preemption point: interrupts that arrive in U mode
                // yield on the way back.
                if cpu.mode == PrivilegeMode::User {
                    self.threads.yield_current(cpu);
                    self.memory.set_active(cpu.satp);
                }
                Ok(VirtAddr::new(cpu.pc))
            }
            TrapCause::ExternalInterrupt => {
                self.intr.service(mem, &mut self.threads);
                if cpu.mode == PrivilegeMode::User {
                    self.threads.yield_current(cpu);
                    self.memory.set_active(cpu.satp);
                }
                Ok(VirtAddr::new(cpu.pc))
            }
            TrapCause::EnvironmentCallFromU => self.handle_syscall(cpu, mem),
            TrapCause::LoadPageFault { addr } | TrapCause::StorePageFault { addr }
                if cpu.mode == PrivilegeMode::User =>
            {
                match self.memory.handle_page_fault(mem, addr.val()) {
                    FaultOutcome::Mapped => Ok(VirtAddr::new(cpu.pc)),
                    FaultOutcome::Fatal => {
                        self.fatal_user_exception(cpu, mem, "page fault outside a mappable range")
                    }
                }
            }
            TrapCause::InstructionPageFault { .. }
            | TrapCause::InstructionMisaligned { .. }
            | TrapCause::InstructionAccessFault { .. }
            | TrapCause::IllegalInstruction { .. }
            | TrapCause::Breakpoint
            | TrapCause::LoadAddressMisaligned { .. }
            | TrapCause::LoadAccessFault { .. }
            | TrapCause::StoreAddressMisaligned { .. }
            | TrapCause::StoreAccessFault { .. }
                if cpu.mode == PrivilegeMode::User =>
            {
                self.fatal_user_exception(cpu, mem, "fatal user exception")
            }
            // A fatal exception in S mode halts the system.
            other => Err(TrapError::HandlerPanic(format!(
                "unrecoverable supervisor trap {other:?} at {:#x}",
                cpu.pc
            ))),
        }
    }
}
