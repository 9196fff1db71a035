//! Abstract stream interface for devices, files and in-memory buffers.
//!
//! Every concrete stream embeds an [`IoBase`] carrying its reference
//! count and implements [`Io`]. Handles are refcounted ([`IoRef`]):
//! closing a handle decrements the count and invokes the concrete close
//! only when it reaches zero. A stream's `read` may return fewer than the
//! requested bytes but at least one; zero signals end-of-file.

use crate::error::{Errno, KResult};
use crate::thread::ThreadManager;
use ember_machine::Memory;
use std::cell::RefCell;
use std::rc::Rc;

// IOCTL numbers (0..7 are reserved)
pub const IOCTL_GETLEN: i32 = 1;
pub const IOCTL_SETLEN: i32 = 2;
pub const IOCTL_GETPOS: i32 = 3;
pub const IOCTL_SETPOS: i32 = 4;
pub const IOCTL_FLUSH: i32 = 5;
pub const IOCTL_GETBLKSZ: i32 = 6;

/// Kernel context stream operations run in: the guest physical address
/// space (for MMIO and DMA buffers) and the scheduler (for blocking
/// waits and ISR wakeups).
pub struct IoCtx<'a> {
    pub mem: &'a mut dyn Memory,
    pub threads: &'a mut ThreadManager,
}

/// State embedded in every concrete stream.
#[derive(Default)]
pub struct IoBase {
    refcnt: u32,
}

impl IoBase {
    pub fn new() -> Self {
        Self { refcnt: 0 }
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt
    }

    /// Used by drivers whose open hands out the first reference.
    pub fn set_refcnt(&mut self, n: u32) {
        self.refcnt = n;
    }
}

pub trait Io {
    fn base_mut(&mut self) -> &mut IoBase;

    fn read(&mut self, _ctx: &mut IoCtx, _buf: &mut [u8]) -> KResult<usize> {
        Err(Errno::NotSup)
    }

    fn write(&mut self, _ctx: &mut IoCtx, _buf: &[u8]) -> KResult<usize> {
        Err(Errno::NotSup)
    }

    fn ctl(&mut self, _ctx: &mut IoCtx, _cmd: i32, _arg: u64) -> KResult<u64> {
        Err(Errno::NotSup)
    }

    fn close(&mut self, _ctx: &mut IoCtx) {}
}

/// Refcounted stream handle.
#[derive(Clone)]
pub struct IoRef(Rc<RefCell<dyn Io>>);

impl IoRef {
    /// Wrap a concrete stream with a reference count of one.
    pub fn new<T: Io + 'static>(io: T) -> Self {
        let this = IoRef(Rc::new(RefCell::new(io)));
        this.0.borrow_mut().base_mut().refcnt = 1;
        this
    }

    pub fn from_shared<T: Io + 'static>(io: Rc<RefCell<T>>) -> Self {
        IoRef(io)
    }

    pub fn refcnt(&self) -> u32 {
        self.0.borrow_mut().base_mut().refcnt
    }

    /// Add a reference (e.g. when `fork` duplicates an fd table entry).
    /// Returns the new count.
    pub fn addref(&self) -> u32 {
        let mut io = self.0.borrow_mut();
        io.base_mut().refcnt += 1;
        io.base_mut().refcnt
    }

    /// Drop one reference; the concrete close runs when the count hits
    /// zero.
    pub fn close(&self, ctx: &mut IoCtx) {
        let mut io = self.0.borrow_mut();
        let base = io.base_mut();
        if base.refcnt == 0 {
            return;
        }
        base.refcnt -= 1;
        if base.refcnt == 0 {
            io.close(ctx);
        }
    }

    pub fn read(&self, ctx: &mut IoCtx, buf: &mut [u8]) -> KResult<usize> {
        self.0.borrow_mut().read(ctx, buf)
    }

    pub fn write(&self, ctx: &mut IoCtx, buf: &[u8]) -> KResult<usize> {
        self.0.borrow_mut().write(ctx, buf)
    }

    pub fn ctl(&self, ctx: &mut IoCtx, cmd: i32, arg: u64) -> KResult<u64> {
        self.0.borrow_mut().ctl(ctx, cmd, arg)
    }

    /// Read until the buffer is full or end-of-file.
    pub fn read_full(&self, ctx: &mut IoCtx, buf: &mut [u8]) -> KResult<usize> {
        let mut acc = 0;
        while acc < buf.len() {
            let cnt = self.read(ctx, &mut buf[acc..])?;
            if cnt == 0 {
                return Ok(acc);
            }
            acc += cnt;
        }
        Ok(acc)
    }

    /// Write until everything is consumed or end-of-file.
    pub fn write_all(&self, ctx: &mut IoCtx, buf: &[u8]) -> KResult<usize> {
        let mut acc = 0;
        while acc < buf.len() {
            let cnt = self.write(ctx, &buf[acc..])?;
            if cnt == 0 {
                return Ok(acc);
            }
            acc += cnt;
        }
        Ok(acc)
    }

    pub fn seek(&self, ctx: &mut IoCtx, pos: u64) -> KResult<u64> {
        self.ctl(ctx, IOCTL_SETPOS, pos)
    }
}

/// A block of memory treated as a stream. Used to mount a filesystem
/// image without a block device and to load the initial image in tests.
pub struct IoLit {
    base: IoBase,
    data: Vec<u8>,
    pos: usize,
}

impl IoLit {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            base: IoBase::new(),
            data,
            pos: 0,
        }
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl Io for IoLit {
    fn base_mut(&mut self) -> &mut IoBase {
        &mut self.base
    }

    fn read(&mut self, _ctx: &mut IoCtx, buf: &mut [u8]) -> KResult<usize> {
        if self.pos >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn write(&mut self, _ctx: &mut IoCtx, buf: &[u8]) -> KResult<usize> {
        // The buffer cannot grow; writes clip at the end.
        if self.pos >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - self.pos);
        self.data[self.pos..self.pos + n].copy_from_slice(&buf[..n]);
        self.pos += n;
        Ok(n)
    }

    fn ctl(&mut self, _ctx: &mut IoCtx, cmd: i32, arg: u64) -> KResult<u64> {
        match cmd {
            IOCTL_GETLEN => Ok(self.data.len() as u64),
            IOCTL_GETPOS => Ok(self.pos as u64),
            IOCTL_SETPOS => {
                if arg > self.data.len() as u64 {
                    return Err(Errno::Inval);
                }
                self.pos = arg as usize;
                Ok(arg)
            }
            _ => Err(Errno::NotSup),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadManager;
    use ember_machine::GuestRam;

    fn with_ctx<R>(f: impl FnOnce(&mut IoCtx) -> R) -> R {
        let mut ram = GuestRam::new(4096);
        let mut threads = ThreadManager::new();
        let mut ctx = IoCtx {
            mem: &mut ram,
            threads: &mut threads,
        };
        f(&mut ctx)
    }

    #[test]
    fn lit_reads_clip_at_end() {
        with_ctx(|ctx| {
            let io = IoRef::new(IoLit::new(vec![1, 2, 3, 4, 5]));
            io.seek(ctx, 3).unwrap();
            let mut buf = [0u8; 8];
            assert_eq!(io.read(ctx, &mut buf).unwrap(), 2);
            assert_eq!(&buf[..2], &[4, 5]);
            assert_eq!(io.read(ctx, &mut buf).unwrap(), 0);
        });
    }

    #[test]
    fn lit_writes_do_not_grow() {
        with_ctx(|ctx| {
            let io = IoRef::new(IoLit::new(vec![0u8; 4]));
            io.seek(ctx, 2).unwrap();
            assert_eq!(io.write(ctx, &[9, 9, 9, 9]).unwrap(), 2);
            assert_eq!(io.ctl(ctx, IOCTL_GETLEN, 0).unwrap(), 4);
            assert_eq!(io.write(ctx, &[1]).unwrap(), 0);
        });
    }

    #[test]
    fn seek_past_end_is_invalid() {
        with_ctx(|ctx| {
            let io = IoRef::new(IoLit::new(vec![0u8; 4]));
            assert_eq!(io.seek(ctx, 5), Err(Errno::Inval));
        });
    }

    #[test]
    fn close_runs_only_at_zero_references() {
        with_ctx(|ctx| {
            let io = IoRef::new(IoLit::new(vec![0u8; 4]));
            assert_eq!(io.refcnt(), 1);
            assert_eq!(io.addref(), 2);
            io.close(ctx);
            assert_eq!(io.refcnt(), 1);
            io.close(ctx);
            assert_eq!(io.refcnt(), 0);
        });
    }

    #[test]
    fn read_full_loops_to_fill() {
        with_ctx(|ctx| {
            let io = IoRef::new(IoLit::new((0..10u8).collect()));
            let mut buf = [0u8; 10];
            assert_eq!(io.read_full(ctx, &mut buf).unwrap(), 10);
            assert_eq!(buf[9], 9);
        });
    }
}
