//! Flat read-mounted filesystem over a block stream.
//!
//! Mount reads the boot block and the whole inode table; files are
//! opened into a table of 32 slots carrying position, cached length and
//! inode number. All file I/O is serialised by one filesystem-wide sleep
//! lock. Writes overwrite data blocks in place and never change a file's
//! length.

use crate::error::{Errno, KResult};
use crate::io::{
    Io, IoBase, IoCtx, IoRef, IOCTL_GETBLKSZ, IOCTL_GETLEN, IOCTL_GETPOS, IOCTL_SETPOS,
};
use crate::sync::SleepLock;
use ember_fs::{data_block_offset, BootBlock, Inode, BLOCK_SIZE, MAX_DENTRIES};
use log::{debug, info};
use std::cell::RefCell;
use std::rc::Rc;
use zerocopy::FromBytes;

/// Up to 32 files can be open at once.
pub const MAX_OPENFILES: usize = 32;

struct OpenFile {
    in_use: bool,
    pos: u64,
    size: u64,
    inode: u32,
}

pub struct FileSystem {
    blkio: IoRef,
    boot: BootBlock,
    inodes: Vec<Inode>,
    open_files: Vec<OpenFile>,
    lock: SleepLock,
}

impl FileSystem {
    /// Mount the filesystem on a block stream: read the boot block,
    /// sanity-check it against the stream's block size, and load the
    /// inode table.
    pub fn mount(ctx: &mut IoCtx, blkio: IoRef) -> KResult<Rc<RefCell<FileSystem>>> {
        blkio.seek(ctx, 0)?;

        let mut buf = vec![0u8; BLOCK_SIZE];
        if blkio.read_full(ctx, &mut buf)? != BLOCK_SIZE {
            return Err(Errno::Io);
        }
        let boot = BootBlock::read_from(&buf[..]).ok_or(Errno::BadFmt)?;
        if boot.num_dentries.get() as usize > MAX_DENTRIES {
            return Err(Errno::BadFmt);
        }

        // The image is laid out in 4 KiB blocks; the backing stream's
        // block size must divide them evenly.
        match blkio.ctl(ctx, IOCTL_GETBLKSZ, 0) {
            Ok(devblksz) if devblksz == 0 || BLOCK_SIZE as u64 % devblksz != 0 => {
                return Err(Errno::BadFmt)
            }
            Ok(_) | Err(Errno::NotSup) => {}
            Err(e) => return Err(e),
        }

        let mut inodes = Vec::with_capacity(boot.num_inodes.get() as usize);
        for _ in 0..boot.num_inodes.get() {
            if blkio.read_full(ctx, &mut buf)? != BLOCK_SIZE {
                return Err(Errno::Io);
            }
            inodes.push(Inode::read_from(&buf[..]).ok_or(Errno::BadFmt)?);
        }

        info!(
            "mounted filesystem: {} files, {} data blocks",
            boot.num_dentries.get(),
            boot.num_blks.get()
        );

        let open_files = (0..MAX_OPENFILES)
            .map(|_| OpenFile {
                in_use: false,
                pos: 0,
                size: 0,
                inode: 0,
            })
            .collect();

        Ok(Rc::new(RefCell::new(FileSystem {
            blkio,
            boot,
            inodes,
            open_files,
            lock: SleepLock::new("openfile_lock"),
        })))
    }

    /// Open a named file: linear dentry search, then a free slot.
    pub fn open(fs: &Rc<RefCell<FileSystem>>, _ctx: &mut IoCtx, name: &str) -> KResult<IoRef> {
        let slot = {
            let mut vol = fs.borrow_mut();
            let inode = vol.boot.lookup(name).ok_or(Errno::NoEnt)?;
            if inode as usize >= vol.inodes.len() {
                return Err(Errno::BadFmt);
            }

            let slot = vol
                .open_files
                .iter()
                .position(|f| !f.in_use)
                .ok_or(Errno::Busy)?;

            let size = vol.inodes[inode as usize].len.get() as u64;
            vol.open_files[slot] = OpenFile {
                in_use: true,
                pos: 0,
                size,
                inode,
            };
            debug!("fs_open: \"{name}\" -> inode {inode}, slot {slot}");
            slot
        };

        Ok(IoRef::new(FsFile {
            base: IoBase::new(),
            volume: Rc::clone(fs),
            slot,
        }))
    }

    /// Absolute device offset of byte `pos` of the slot's file.
    fn device_offset(&self, slot: usize, pos: u64) -> u64 {
        let inode = &self.inodes[self.open_files[slot].inode as usize];
        let block_index = (pos / BLOCK_SIZE as u64) as usize;
        let block_offset = pos % BLOCK_SIZE as u64;
        data_block_offset(self.boot.num_inodes.get(), inode.blocks[block_index].get())
            + block_offset
    }

    fn file_read(&mut self, ctx: &mut IoCtx, slot: usize, buf: &mut [u8]) -> KResult<usize> {
        let (pos, size) = {
            let f = &self.open_files[slot];
            if !f.in_use {
                return Err(Errno::Inval);
            }
            (f.pos, f.size)
        };
        if pos >= size {
            return Ok(0);
        }
        let to_read = (buf.len() as u64).min(size - pos);

        self.lock.acquire(ctx.threads);
        let result = self.file_read_locked(ctx, slot, &mut buf[..to_read as usize]);
        self.lock.release(ctx.threads);
        result
    }

    fn file_read_locked(&mut self, ctx: &mut IoCtx, slot: usize, buf: &mut [u8]) -> KResult<usize> {
        let mut done = 0usize;
        while done < buf.len() {
            let pos = self.open_files[slot].pos;
            let block_offset = pos % BLOCK_SIZE as u64;
            let chunk = (buf.len() - done).min((BLOCK_SIZE as u64 - block_offset) as usize);

            let dev_off = self.device_offset(slot, pos);
            self.blkio.seek(ctx, dev_off)?;
            let n = self.blkio.read_full(ctx, &mut buf[done..done + chunk])?;
            if n == 0 {
                break;
            }
            done += n;
            self.open_files[slot].pos += n as u64;
        }
        Ok(done)
    }

    fn file_write(&mut self, ctx: &mut IoCtx, slot: usize, buf: &[u8]) -> KResult<usize> {
        let (pos, size) = {
            let f = &self.open_files[slot];
            if !f.in_use {
                return Err(Errno::Inval);
            }
            (f.pos, f.size)
        };
        // The file cannot grow: clamp at the recorded length.
        if pos >= size {
            return Ok(0);
        }
        let to_write = (buf.len() as u64).min(size - pos);

        self.lock.acquire(ctx.threads);
        let result = self.file_write_locked(ctx, slot, &buf[..to_write as usize]);
        self.lock.release(ctx.threads);
        result
    }

    fn file_write_locked(&mut self, ctx: &mut IoCtx, slot: usize, buf: &[u8]) -> KResult<usize> {
        let mut done = 0usize;
        while done < buf.len() {
            let pos = self.open_files[slot].pos;
            let block_offset = pos % BLOCK_SIZE as u64;
            let chunk = (buf.len() - done).min((BLOCK_SIZE as u64 - block_offset) as usize);

            let dev_off = self.device_offset(slot, pos);
            self.blkio.seek(ctx, dev_off)?;
            let n = self.blkio.write_all(ctx, &buf[done..done + chunk])?;
            if n == 0 {
                break;
            }
            done += n;
            self.open_files[slot].pos += n as u64;
        }
        Ok(done)
    }

    fn file_ctl(&mut self, slot: usize, cmd: i32, arg: u64) -> KResult<u64> {
        let f = &mut self.open_files[slot];
        if !f.in_use {
            return Err(Errno::Inval);
        }
        match cmd {
            IOCTL_GETLEN => Ok(f.size),
            IOCTL_GETPOS => Ok(f.pos),
            IOCTL_SETPOS => {
                if arg > f.size {
                    return Err(Errno::Inval);
                }
                f.pos = arg;
                Ok(arg)
            }
            IOCTL_GETBLKSZ => Ok(BLOCK_SIZE as u64),
            _ => Err(Errno::NotSup),
        }
    }

    #[cfg(test)]
    fn slot_in_use(&self, slot: usize) -> bool {
        self.open_files[slot].in_use
    }
}

/// An open file: a slot in the volume's open-file table behind the
/// stream interface.
pub struct FsFile {
    base: IoBase,
    volume: Rc<RefCell<FileSystem>>,
    slot: usize,
}

impl Io for FsFile {
    fn base_mut(&mut self) -> &mut IoBase {
        &mut self.base
    }

    fn read(&mut self, ctx: &mut IoCtx, buf: &mut [u8]) -> KResult<usize> {
        self.volume.borrow_mut().file_read(ctx, self.slot, buf)
    }

    fn write(&mut self, ctx: &mut IoCtx, buf: &[u8]) -> KResult<usize> {
        self.volume.borrow_mut().file_write(ctx, self.slot, buf)
    }

    fn ctl(&mut self, _ctx: &mut IoCtx, cmd: i32, arg: u64) -> KResult<u64> {
        self.volume.borrow_mut().file_ctl(self.slot, cmd, arg)
    }

    fn close(&mut self, _ctx: &mut IoCtx) {
        self.volume.borrow_mut().open_files[self.slot].in_use = false;
    }
}
