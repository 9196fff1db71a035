//! VirtIO block device driver (virtio-mmio, modern interface).
//!
//! One virtqueue with a single outstanding request: the descriptor
//! published in the rings is an indirect descriptor whose table holds
//! {header, data, status}. The queue structures, request header, status
//! byte and the block-sized bounce buffer live in guest RAM pages handed
//! out by the memory manager, so the device DMAs against the same memory
//! the kernel manipulates. A driver-wide sleep lock serialises reads and
//! writes; the ISR only acknowledges the device and broadcasts
//! `used_updated`.

use crate::error::{Errno, KResult};
use crate::intr::{self, IntrController, Isr};
use crate::io::{Io, IoBase, IoCtx, IoRef, IOCTL_GETBLKSZ, IOCTL_GETLEN, IOCTL_GETPOS, IOCTL_SETPOS};
use crate::memory::{self, MemoryManager, PAGE_SIZE};
use crate::sync::{Condition, SleepLock};
use crate::thread::ThreadManager;
use crate::device::DeviceManager;
use ember_machine::{Memory, PhysAddr};
use log::{debug, info, warn};
use std::cell::RefCell;
use std::rc::Rc;

const VIOBLK_IRQ_PRIO: u32 = 1;

// virtio-mmio register offsets
const MAGIC_VALUE: u64 = 0x000;
const VERSION: u64 = 0x004;
const DEVICE_ID: u64 = 0x008;
const DEVICE_FEATURES: u64 = 0x010;
const DEVICE_FEATURES_SEL: u64 = 0x014;
const DRIVER_FEATURES: u64 = 0x020;
const DRIVER_FEATURES_SEL: u64 = 0x024;
const QUEUE_SEL: u64 = 0x030;
const QUEUE_NUM_MAX: u64 = 0x034;
const QUEUE_NUM: u64 = 0x038;
const QUEUE_READY: u64 = 0x044;
const QUEUE_NOTIFY: u64 = 0x050;
const INTERRUPT_STATUS: u64 = 0x060;
const INTERRUPT_ACK: u64 = 0x064;
const STATUS: u64 = 0x070;
const QUEUE_DESC_LOW: u64 = 0x080;
const QUEUE_DESC_HIGH: u64 = 0x084;
const QUEUE_DRIVER_LOW: u64 = 0x090;
const QUEUE_DRIVER_HIGH: u64 = 0x094;
const QUEUE_DEVICE_LOW: u64 = 0x0A0;
const QUEUE_DEVICE_HIGH: u64 = 0x0A4;
const CONFIG_CAPACITY_LOW: u64 = 0x100;
const CONFIG_CAPACITY_HIGH: u64 = 0x104;
const CONFIG_BLK_SIZE: u64 = 0x114;

const VIRTIO_MAGIC: u32 = 0x7472_6976;
const VIRTIO_ID_BLOCK: u32 = 2;

// Device status bits
const STAT_ACKNOWLEDGE: u32 = 1;
const STAT_DRIVER: u32 = 2;
const STAT_DRIVER_OK: u32 = 4;
const STAT_FEATURES_OK: u32 = 8;

// Feature bit numbers
const VIRTIO_BLK_F_BLK_SIZE: u32 = 6;
const VIRTIO_BLK_F_TOPOLOGY: u32 = 10;
const VIRTIO_F_INDIRECT_DESC: u32 = 28;
const VIRTIO_F_RING_RESET: u32 = 40;

// Interrupt status bits
const USED_BUFFER_NOTICE: u32 = 1 << 0;
const CONFIG_CHANGE_NOTICE: u32 = 1 << 1;

// Descriptor flags
const VIRTQ_DESC_F_NEXT: u16 = 1;
const VIRTQ_DESC_F_WRITE: u16 = 2;
const VIRTQ_DESC_F_INDIRECT: u16 = 4;

// Request types and status byte values
const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_S_OK: u8 = 0;

// Virtqueue layout within the driver's queue page: the single main
// descriptor, the 3-entry indirect table, the one-element avail and used
// rings, the request header and the status byte.
const DESC0_OFF: u64 = 0x00;
const INDIRECT_OFF: u64 = 0x10;
const AVAIL_OFF: u64 = 0x40;
const USED_OFF: u64 = 0x80;
const HEADER_OFF: u64 = 0x90;
const STATUS_OFF: u64 = 0xA0;

/// Completion polls before the driver declares the device wedged.
const WAIT_SPINS: u32 = 64;

pub struct VioBlkDevice {
    base: IoBase,
    regs: u64,
    irqno: u32,
    pub instno: u32,
    opened: bool,

    // optimal block size
    blksz: u32,
    // current byte position
    pos: u64,
    // size of device in bytes
    size: u64,
    // size of device in blksz blocks
    blkcnt: u64,

    // guest pages holding the virtqueue and the bounce buffer
    vq_page: u64,
    buf_page: u64,
    // shadow of the avail index the driver publishes
    avail_idx: u16,

    // signaled from the ISR
    used_updated: Condition,
    lock: SleepLock,
}

fn reg_read(mem: &mut dyn Memory, base: u64, offset: u64) -> u32 {
    mem.read_word(PhysAddr::new(base + offset))
        .expect("virtio regs unreachable")
}

fn reg_write(mem: &mut dyn Memory, base: u64, offset: u64, val: u32) {
    mem.write_word(PhysAddr::new(base + offset), val)
        .expect("virtio regs unreachable")
}

/// Feature negotiation over the banked feature registers: every needed
/// bit must be offered; the driver requests the wanted set (a superset
/// of needed) intersected with the offer.
fn negotiate_features(
    mem: &mut dyn Memory,
    base: u64,
    wanted: [u32; 2],
    needed: [u32; 2],
) -> KResult<[u32; 2]> {
    let mut enabled = [0u32; 2];
    for bank in 0..2u32 {
        if needed[bank as usize] != 0 {
            reg_write(mem, base, DEVICE_FEATURES_SEL, bank);
            let offered = reg_read(mem, base, DEVICE_FEATURES);
            if offered & needed[bank as usize] != needed[bank as usize] {
                return Err(Errno::NotSup);
            }
        }
    }
    for bank in 0..2u32 {
        if wanted[bank as usize] != 0 {
            reg_write(mem, base, DEVICE_FEATURES_SEL, bank);
            reg_write(mem, base, DRIVER_FEATURES_SEL, bank);
            let offered = reg_read(mem, base, DEVICE_FEATURES);
            enabled[bank as usize] = offered & wanted[bank as usize];
            reg_write(mem, base, DRIVER_FEATURES, enabled[bank as usize]);
        }
    }
    Ok(enabled)
}

impl VioBlkDevice {
    /// Probe and initialize the block device behind a virtio-mmio slot,
    /// register its ISR and its named instance. Returns the shared
    /// device record.
    pub fn attach(
        mem: &mut dyn Memory,
        mm: &mut MemoryManager,
        intr: &mut IntrController,
        devices: &mut DeviceManager,
        regs: u64,
        irqno: u32,
    ) -> KResult<Rc<RefCell<VioBlkDevice>>> {
        if reg_read(mem, regs, MAGIC_VALUE) != VIRTIO_MAGIC {
            warn!("{regs:#x}: no virtio magic");
            return Err(Errno::NoDev);
        }
        if reg_read(mem, regs, VERSION) != 2 {
            warn!("{regs:#x}: unexpected virtio version");
            return Err(Errno::NoDev);
        }
        if reg_read(mem, regs, DEVICE_ID) != VIRTIO_ID_BLOCK {
            return Err(Errno::NoDev);
        }

        // Reset, acknowledge, driver.
        reg_write(mem, regs, STATUS, 0);
        reg_write(mem, regs, STATUS, STAT_ACKNOWLEDGE);
        reg_write(mem, regs, STATUS, STAT_ACKNOWLEDGE | STAT_DRIVER);

        // We need RING_RESET and INDIRECT_DESC; we want BLK_SIZE and
        // TOPOLOGY on top.
        let needed = [1 << VIRTIO_F_INDIRECT_DESC, 1 << (VIRTIO_F_RING_RESET - 32)];
        let wanted = [
            needed[0] | (1 << VIRTIO_BLK_F_BLK_SIZE) | (1 << VIRTIO_BLK_F_TOPOLOGY),
            needed[1],
        ];
        let enabled = negotiate_features(mem, regs, wanted, needed)?;

        let blksz = if enabled[0] & (1 << VIRTIO_BLK_F_BLK_SIZE) != 0 {
            reg_read(mem, regs, CONFIG_BLK_SIZE)
        } else {
            512
        };
        assert!(blksz as u64 <= PAGE_SIZE, "device block size exceeds a page");
        debug!("{regs:#x}: virtio block device block size is {blksz}");

        let blkcnt = reg_read(mem, regs, CONFIG_CAPACITY_LOW) as u64
            | ((reg_read(mem, regs, CONFIG_CAPACITY_HIGH) as u64) << 32);

        // Queue structures and bounce buffer in guest RAM.
        let vq_page = mm.alloc_page(mem);
        let buf_page = mm.alloc_page(mem);
        memory::zero_page(mem, vq_page);
        memory::zero_page(mem, buf_page);

        let dev = VioBlkDevice {
            base: IoBase::new(),
            regs,
            irqno,
            instno: 0,
            opened: false,
            blksz,
            pos: 0,
            size: blkcnt * blksz as u64,
            blkcnt,
            vq_page,
            buf_page,
            avail_idx: 0,
            used_updated: Condition::new("used_updated"),
            lock: SleepLock::new("vioblk_lock"),
        };
        dev.write_descriptors(mem);

        // Virtqueue 0: features-ok first, then the ring addresses.
        reg_write(mem, regs, QUEUE_SEL, 0);
        if reg_read(mem, regs, QUEUE_NUM_MAX) == 0 {
            warn!("{regs:#x}: device reports queue size 0");
            return Err(Errno::NoDev);
        }
        reg_write(mem, regs, QUEUE_NUM, 1);

        let status = reg_read(mem, regs, STATUS);
        reg_write(mem, regs, STATUS, status | STAT_FEATURES_OK);
        if reg_read(mem, regs, STATUS) & STAT_FEATURES_OK == 0 {
            warn!("{regs:#x}: virtio feature negotiation failed");
            return Err(Errno::NotSup);
        }

        reg_write(mem, regs, QUEUE_DESC_LOW, (vq_page + DESC0_OFF) as u32);
        reg_write(mem, regs, QUEUE_DESC_HIGH, (vq_page >> 32) as u32);
        reg_write(mem, regs, QUEUE_DRIVER_LOW, (vq_page + AVAIL_OFF) as u32);
        reg_write(mem, regs, QUEUE_DRIVER_HIGH, (vq_page >> 32) as u32);
        reg_write(mem, regs, QUEUE_DEVICE_LOW, (vq_page + USED_OFF) as u32);
        reg_write(mem, regs, QUEUE_DEVICE_HIGH, (vq_page >> 32) as u32);
        reg_write(mem, regs, QUEUE_READY, 1);

        let dev = Rc::new(RefCell::new(dev));
        intr.register_isr(irqno, VIOBLK_IRQ_PRIO, Rc::clone(&dev) as Rc<RefCell<dyn Isr>>);

        let open_dev = Rc::clone(&dev);
        let instno = devices.register(
            "blk",
            Box::new(move |ctx| VioBlkDevice::open(&open_dev, ctx)),
        );
        dev.borrow_mut().instno = instno;

        let status = reg_read(mem, regs, STATUS);
        reg_write(mem, regs, STATUS, status | STAT_DRIVER_OK);

        info!(
            "blk{instno}: {} blocks of {} bytes",
            dev.borrow().blkcnt,
            blksz
        );
        Ok(dev)
    }

    /// The first descriptor is the indirect one published in the rings;
    /// its table holds header, data and status descriptors.
    fn write_descriptors(&self, mem: &mut dyn Memory) {
        let vq = self.vq_page;
        write_desc(
            mem,
            vq + DESC0_OFF,
            vq + INDIRECT_OFF,
            3 * 16,
            VIRTQ_DESC_F_INDIRECT,
            0,
        );
        write_desc(
            mem,
            vq + INDIRECT_OFF,
            vq + HEADER_OFF,
            16,
            VIRTQ_DESC_F_NEXT,
            1,
        );
        write_desc(
            mem,
            vq + INDIRECT_OFF + 16,
            self.buf_page,
            self.blksz,
            VIRTQ_DESC_F_NEXT,
            2,
        );
        write_desc(
            mem,
            vq + INDIRECT_OFF + 32,
            vq + STATUS_OFF,
            1,
            VIRTQ_DESC_F_WRITE,
            0,
        );
    }

    /// Open the registered instance: refuses while already open or while
    /// another live handle exists; re-enables the ring and unmasks the
    /// interrupt line.
    pub fn open(dev: &Rc<RefCell<VioBlkDevice>>, ctx: &mut IoCtx) -> KResult<IoRef> {
        {
            let mut d = dev.borrow_mut();
            if d.opened || d.base.refcnt() != 0 {
                return Err(Errno::Busy);
            }
            reg_write(ctx.mem, d.regs, QUEUE_SEL, 0);
            if reg_read(ctx.mem, d.regs, QUEUE_NUM_MAX) == 0 {
                return Err(Errno::NoDev);
            }
            reg_write(ctx.mem, d.regs, QUEUE_READY, 1);
            intr::plic_enable_irq(ctx.mem, d.irqno, VIOBLK_IRQ_PRIO);
            d.avail_idx = 0;
            d.pos = 0;
            d.opened = true;
            d.base.set_refcnt(1);
        }
        Ok(IoRef::from_shared(Rc::clone(dev)))
    }

    /// One submit/complete cycle: fill the header, direct the data
    /// descriptor, publish the chain and wait for the used index.
    fn transfer(&mut self, ctx: &mut IoCtx, req_type: u32, sector: u64) -> KResult<()> {
        let vq = self.vq_page;
        ctx.mem
            .write_word(PhysAddr::new(vq + HEADER_OFF), req_type)
            .map_err(|_| Errno::Io)?;
        ctx.mem
            .write_word(PhysAddr::new(vq + HEADER_OFF + 4), 0)
            .map_err(|_| Errno::Io)?;
        ctx.mem
            .write_dword(PhysAddr::new(vq + HEADER_OFF + 8), sector)
            .map_err(|_| Errno::Io)?;

        // Only the data descriptor's direction changes per request; the
        // indirect arrangement is fixed at init.
        let data_flags = if req_type == VIRTIO_BLK_T_IN {
            VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE
        } else {
            VIRTQ_DESC_F_NEXT
        };
        ctx.mem
            .write_half(PhysAddr::new(vq + INDIRECT_OFF + 16 + 12), data_flags)
            .map_err(|_| Errno::Io)?;

        // Publish one avail entry (queue length is 1) and notify.
        ctx.mem
            .write_half(PhysAddr::new(vq + AVAIL_OFF + 4), 0)
            .map_err(|_| Errno::Io)?;
        self.avail_idx = self.avail_idx.wrapping_add(1);
        ctx.mem
            .write_half(PhysAddr::new(vq + AVAIL_OFF + 2), self.avail_idx)
            .map_err(|_| Errno::Io)?;
        reg_write(ctx.mem, self.regs, QUEUE_NOTIFY, 0);

        self.wait_used(ctx)
    }

    /// Wait until the used ring catches up with the published index,
    /// servicing the device's interrupt inline (completion is signalled
    /// through `used_updated` exactly as from the registered ISR).
    fn wait_used(&mut self, ctx: &mut IoCtx) -> KResult<()> {
        for _ in 0..WAIT_SPINS {
            self.service_interrupt(ctx.mem, ctx.threads);
            let used_idx = ctx
                .mem
                .read_half(PhysAddr::new(self.vq_page + USED_OFF + 2))
                .map_err(|_| Errno::Io)?;
            if used_idx == self.avail_idx {
                return Ok(());
            }
        }
        warn!("blk{}: request did not complete", self.instno);
        Err(Errno::Io)
    }

    /// ISR body: acknowledge configuration changes; on a used-buffer
    /// notice wake every waiter, then acknowledge.
    fn service_interrupt(&mut self, mem: &mut dyn Memory, threads: &mut ThreadManager) {
        let status = reg_read(mem, self.regs, INTERRUPT_STATUS);
        if status & CONFIG_CHANGE_NOTICE != 0 {
            reg_write(mem, self.regs, INTERRUPT_ACK, CONFIG_CHANGE_NOTICE);
        }
        if status & USED_BUFFER_NOTICE != 0 {
            threads.condition_broadcast(&mut self.used_updated);
            reg_write(mem, self.regs, INTERRUPT_ACK, USED_BUFFER_NOTICE);
        }
    }

    fn req_status(&self, mem: &mut dyn Memory) -> u8 {
        mem.read_byte(PhysAddr::new(self.vq_page + STATUS_OFF))
            .unwrap_or(u8::MAX)
    }

    fn zero_bounce(&self, mem: &mut dyn Memory) {
        memory::zero_page(mem, self.buf_page);
    }

    fn read_locked(&mut self, ctx: &mut IoCtx, buf: &mut [u8]) -> KResult<usize> {
        let mut bufsz = buf.len() as u64;
        if self.pos + bufsz > self.size {
            bufsz = self.size - self.pos;
        }

        let mut total = 0u64;
        let mut remaining = bufsz;
        while remaining > 0 {
            let sector = self.pos / self.blksz as u64;
            self.transfer(ctx, VIRTIO_BLK_T_IN, sector)?;

            let blk_off = self.pos % self.blksz as u64;
            let to_copy = remaining.min(self.blksz as u64 - blk_off);
            ctx.mem
                .read_into(
                    PhysAddr::new(self.buf_page + blk_off),
                    &mut buf[total as usize..(total + to_copy) as usize],
                )
                .map_err(|_| Errno::Io)?;

            total += to_copy;
            remaining -= to_copy;
            self.pos += to_copy;
        }
        Ok(total as usize)
    }

    fn write_locked(&mut self, ctx: &mut IoCtx, buf: &[u8]) -> KResult<usize> {
        let mut n = buf.len() as u64;
        if self.pos + n > self.size {
            n = self.size - self.pos;
        }

        let mut total = 0u64;
        let mut remaining = n;
        while remaining > 0 {
            let sector = self.pos / self.blksz as u64;
            let blk_off = self.pos % self.blksz as u64;
            let to_copy = remaining.min(self.blksz as u64 - blk_off);

            if blk_off != 0 || to_copy < self.blksz as u64 {
                // Partial block: populate the bounce buffer first so the
                // bytes around the payload survive.
                self.transfer(ctx, VIRTIO_BLK_T_IN, sector)?;
                if self.req_status(ctx.mem) != VIRTIO_BLK_S_OK {
                    return Err(Errno::Io);
                }
            } else {
                self.zero_bounce(ctx.mem);
            }

            ctx.mem
                .write_from(
                    PhysAddr::new(self.buf_page + blk_off),
                    &buf[total as usize..(total + to_copy) as usize],
                )
                .map_err(|_| Errno::Io)?;

            self.transfer(ctx, VIRTIO_BLK_T_OUT, sector)?;
            if self.req_status(ctx.mem) != VIRTIO_BLK_S_OK {
                return Err(Errno::Io);
            }

            total += to_copy;
            remaining -= to_copy;
            self.pos += to_copy;
        }
        Ok(total as usize)
    }
}

fn write_desc(mem: &mut dyn Memory, at: u64, addr: u64, len: u32, flags: u16, next: u16) {
    mem.write_dword(PhysAddr::new(at), addr).expect("vq out of RAM");
    mem.write_word(PhysAddr::new(at + 8), len).expect("vq out of RAM");
    mem.write_half(PhysAddr::new(at + 12), flags).expect("vq out of RAM");
    mem.write_half(PhysAddr::new(at + 14), next).expect("vq out of RAM");
}

impl Io for VioBlkDevice {
    fn base_mut(&mut self) -> &mut IoBase {
        &mut self.base
    }

    fn read(&mut self, ctx: &mut IoCtx, buf: &mut [u8]) -> KResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos >= self.size {
            return Ok(0);
        }
        self.lock.acquire(ctx.threads);
        let result = self.read_locked(ctx, buf);
        self.lock.release(ctx.threads);
        result
    }

    fn write(&mut self, ctx: &mut IoCtx, buf: &[u8]) -> KResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos >= self.size {
            return Ok(0);
        }
        self.lock.acquire(ctx.threads);
        let result = self.write_locked(ctx, buf);
        self.lock.release(ctx.threads);
        result
    }

    fn ctl(&mut self, _ctx: &mut IoCtx, cmd: i32, arg: u64) -> KResult<u64> {
        match cmd {
            IOCTL_GETLEN => Ok(self.size),
            IOCTL_GETPOS => Ok(self.pos),
            IOCTL_SETPOS => {
                if arg > self.size {
                    return Err(Errno::Inval);
                }
                self.pos = arg;
                Ok(arg)
            }
            IOCTL_GETBLKSZ => Ok(self.blksz as u64),
            _ => Err(Errno::NotSup),
        }
    }

    /// Mask the device and external interrupt, reset the ring indices
    /// and clear the open flag.
    fn close(&mut self, ctx: &mut IoCtx) {
        if !self.opened {
            return;
        }
        reg_write(ctx.mem, self.regs, QUEUE_SEL, 0);
        reg_write(ctx.mem, self.regs, QUEUE_READY, 0);
        let _ = ctx
            .mem
            .write_half(PhysAddr::new(self.vq_page + AVAIL_OFF + 2), 0);
        let _ = ctx
            .mem
            .write_half(PhysAddr::new(self.vq_page + USED_OFF + 2), 0);
        self.avail_idx = 0;
        intr::plic_disable_irq(ctx.mem, self.irqno);
        self.opened = false;
    }
}

impl Isr for VioBlkDevice {
    fn isr(&mut self, _irqno: u32, mem: &mut dyn Memory, threads: &mut ThreadManager) {
        self.service_interrupt(mem, threads);
    }
}
