//! VirtIO block device model: virtio-mmio version 2 register file with one
//! virtqueue. The driver publishes an indirect descriptor chain of
//! {header, data, status}; on queue notify the device performs the
//! transfer against its backing image, writes the used ring, and raises
//! its level-triggered interrupt until acknowledged.

use crate::memory::{GuestRam, Memory, PhysAddr};
use log::{debug, warn};

pub const VIRT0_BASE: u64 = 0x1000_1000;
pub const VIRT_SIZE: u64 = 0x1000;
pub const VIRT0_IRQ: u32 = 1;

pub const VIRTIO_MAGIC: u32 = 0x7472_6976;
pub const VIRTIO_VERSION: u32 = 2;
pub const VIRTIO_ID_BLOCK: u32 = 2;
const VIRTIO_VENDOR_QEMU: u32 = 0x554d_4551;

// Register offsets (virtio-mmio v2)
const MAGIC_VALUE: u64 = 0x000;
const VERSION: u64 = 0x004;
const DEVICE_ID: u64 = 0x008;
const VENDOR_ID: u64 = 0x00C;
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

// Feature bits (bit numbers, not masks)
pub const VIRTIO_BLK_F_BLK_SIZE: u32 = 6;
pub const VIRTIO_BLK_F_TOPOLOGY: u32 = 10;
pub const VIRTIO_F_INDIRECT_DESC: u32 = 28;
pub const VIRTIO_F_VERSION_1: u32 = 32;
pub const VIRTIO_F_RING_RESET: u32 = 40;

// Interrupt status bits
pub const INTR_USED_BUFFER: u32 = 1 << 0;
pub const INTR_CONFIG_CHANGE: u32 = 1 << 1;

// Descriptor flags
const DESC_F_NEXT: u16 = 1;
const DESC_F_WRITE: u16 = 2;
const DESC_F_INDIRECT: u16 = 4;

// Request types and status byte values
const BLK_T_IN: u32 = 0;
const BLK_T_OUT: u32 = 1;
const BLK_S_OK: u8 = 0;
const BLK_S_IOERR: u8 = 1;
const BLK_S_UNSUPP: u8 = 2;

const QUEUE_MAX: u32 = 8;

pub struct VirtioBlock {
    image: Vec<u8>,
    blk_size: u32,

    status: u32,
    device_features_sel: u32,
    driver_features_sel: u32,
    driver_features: [u32; 2],
    queue_sel: u32,
    queue_num: u32,
    queue_ready: u32,
    queue_desc: u64,
    queue_driver: u64,
    queue_device: u64,
    interrupt_status: u32,
    last_avail_idx: u16,
}

impl VirtioBlock {
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            image,
            blk_size: 512,
            status: 0,
            device_features_sel: 0,
            driver_features_sel: 0,
            driver_features: [0; 2],
            queue_sel: 0,
            queue_num: 0,
            queue_ready: 0,
            queue_desc: 0,
            queue_driver: 0,
            queue_device: 0,
            interrupt_status: 0,
            last_avail_idx: 0,
        }
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut Vec<u8> {
        &mut self.image
    }

    pub fn blk_size(&self) -> u32 {
        self.blk_size
    }

    /// Capacity in blk_size-sized blocks.
    fn capacity(&self) -> u64 {
        self.image.len() as u64 / self.blk_size as u64
    }

    pub fn irq_asserted(&self) -> bool {
        self.interrupt_status != 0
    }

    fn device_features(&self) -> u32 {
        match self.device_features_sel {
            0 => (1 << VIRTIO_BLK_F_BLK_SIZE) | (1 << VIRTIO_BLK_F_TOPOLOGY) | (1 << VIRTIO_F_INDIRECT_DESC),
            1 => (1 << (VIRTIO_F_VERSION_1 - 32)) | (1 << (VIRTIO_F_RING_RESET - 32)),
            _ => 0,
        }
    }

    fn reset(&mut self) {
        self.status = 0;
        self.driver_features = [0; 2];
        self.queue_num = 0;
        self.queue_ready = 0;
        self.interrupt_status = 0;
        self.last_avail_idx = 0;
    }

    pub fn read_word(&mut self, offset: u64) -> u32 {
        match offset {
            MAGIC_VALUE => VIRTIO_MAGIC,
            VERSION => VIRTIO_VERSION,
            DEVICE_ID => VIRTIO_ID_BLOCK,
            VENDOR_ID => VIRTIO_VENDOR_QEMU,
            DEVICE_FEATURES => self.device_features(),
            QUEUE_NUM_MAX => {
                if self.queue_sel == 0 {
                    QUEUE_MAX
                } else {
                    0
                }
            }
            QUEUE_READY => self.queue_ready,
            INTERRUPT_STATUS => self.interrupt_status,
            STATUS => self.status,
            CONFIG_CAPACITY_LOW => self.capacity() as u32,
            CONFIG_CAPACITY_HIGH => (self.capacity() >> 32) as u32,
            CONFIG_BLK_SIZE => self.blk_size,
            _ => 0,
        }
    }

    pub fn write_word(&mut self, offset: u64, value: u32, ram: &mut GuestRam) {
        match offset {
            DEVICE_FEATURES_SEL => self.device_features_sel = value,
            DRIVER_FEATURES_SEL => self.driver_features_sel = value,
            DRIVER_FEATURES => {
                if (self.driver_features_sel as usize) < 2 {
                    self.driver_features[self.driver_features_sel as usize] = value;
                }
            }
            QUEUE_SEL => self.queue_sel = value,
            QUEUE_NUM => self.queue_num = value,
            QUEUE_READY => {
                self.queue_ready = value;
                if value == 0 {
                    // Ring reset: the driver may re-enable with fresh
                    // indices.
                    self.last_avail_idx = 0;
                }
            }
            QUEUE_NOTIFY => self.process_queue(ram),
            INTERRUPT_ACK => self.interrupt_status &= !value,
            STATUS => {
                if value == 0 {
                    self.reset();
                } else {
                    self.status = value;
                }
            }
            QUEUE_DESC_LOW => self.queue_desc = (self.queue_desc & !0xFFFF_FFFF) | value as u64,
            QUEUE_DESC_HIGH => {
                self.queue_desc = (self.queue_desc & 0xFFFF_FFFF) | ((value as u64) << 32)
            }
            QUEUE_DRIVER_LOW => {
                self.queue_driver = (self.queue_driver & !0xFFFF_FFFF) | value as u64
            }
            QUEUE_DRIVER_HIGH => {
                self.queue_driver = (self.queue_driver & 0xFFFF_FFFF) | ((value as u64) << 32)
            }
            QUEUE_DEVICE_LOW => {
                self.queue_device = (self.queue_device & !0xFFFF_FFFF) | value as u64
            }
            QUEUE_DEVICE_HIGH => {
                self.queue_device = (self.queue_device & 0xFFFF_FFFF) | ((value as u64) << 32)
            }
            _ => {}
        }
    }

    fn read_desc(&self, ram: &mut GuestRam, table: u64, idx: u16) -> Option<(u64, u32, u16, u16)> {
        let base = PhysAddr::new(table + idx as u64 * 16);
        let addr = ram.read_dword(base).ok()?;
        let len = ram.read_word(base + 8).ok()?;
        let flags = ram.read_half(base + 12).ok()?;
        let next = ram.read_half(base + 14).ok()?;
        Some((addr, len, flags, next))
    }

    /// Consume every new avail-ring entry. Each head must be an indirect
    /// descriptor whose table holds the {header, data, status} chain.
    fn process_queue(&mut self, ram: &mut GuestRam) {
        if self.queue_ready == 0 || self.queue_num == 0 {
            return;
        }
        let qnum = self.queue_num as u64;

        loop {
            let avail_idx = match ram.read_half(PhysAddr::new(self.queue_driver + 2)) {
                Ok(v) => v,
                Err(_) => return,
            };
            if avail_idx == self.last_avail_idx {
                break;
            }

            let slot = (self.last_avail_idx as u64) % qnum;
            let head = ram
                .read_half(PhysAddr::new(self.queue_driver + 4 + slot * 2))
                .unwrap_or(0);
            let written = self.execute(ram, head);
            self.last_avail_idx = self.last_avail_idx.wrapping_add(1);

            // Publish the used element and advance the used index.
            let used_idx = ram
                .read_half(PhysAddr::new(self.queue_device + 2))
                .unwrap_or(0);
            let uslot = (used_idx as u64) % qnum;
            let elem = PhysAddr::new(self.queue_device + 4 + uslot * 8);
            let _ = ram.write_word(elem, head as u32);
            let _ = ram.write_word(elem + 4, written);
            let _ = ram.write_half(
                PhysAddr::new(self.queue_device + 2),
                used_idx.wrapping_add(1),
            );

            self.interrupt_status |= INTR_USED_BUFFER;
        }
    }

    /// Execute one request chain; returns the number of bytes the device
    /// wrote into descriptor buffers.
    fn execute(&mut self, ram: &mut GuestRam, head: u16) -> u32 {
        let Some((ind_addr, ind_len, ind_flags, _)) = self.read_desc(ram, self.queue_desc, head)
        else {
            return 0;
        };
        if ind_flags & DESC_F_INDIRECT == 0 {
            warn!("vioblk: head descriptor is not indirect, dropping request");
            return 0;
        }

        // Gather the chain from the indirect table.
        let count = (ind_len / 16) as u16;
        let mut chain = Vec::new();
        let mut idx = 0u16;
        loop {
            let Some(desc) = self.read_desc(ram, ind_addr, idx) else {
                return 0;
            };
            chain.push(desc);
            if desc.2 & DESC_F_NEXT == 0 {
                break;
            }
            idx = desc.3;
            if idx >= count || chain.len() > count as usize {
                warn!("vioblk: malformed descriptor chain");
                return 0;
            }
        }
        if chain.len() != 3 {
            warn!("vioblk: expected 3 descriptors, got {}", chain.len());
            return 0;
        }
        let (hdr_addr, _, _, _) = chain[0];
        let (data_addr, data_len, data_flags, _) = chain[1];
        let (status_addr, _, _, _) = chain[2];

        let req_type = ram.read_word(PhysAddr::new(hdr_addr)).unwrap_or(u32::MAX);
        let sector = ram.read_dword(PhysAddr::new(hdr_addr + 8)).unwrap_or(0);
        let offset = sector.saturating_mul(self.blk_size as u64) as usize;

        let mut written = 0u32;
        let status = match req_type {
            BLK_T_IN => {
                if offset + data_len as usize <= self.image.len()
                    && data_flags & DESC_F_WRITE != 0
                {
                    let chunk = self.image[offset..offset + data_len as usize].to_vec();
                    if ram.write_from(PhysAddr::new(data_addr), &chunk).is_ok() {
                        written += data_len;
                        BLK_S_OK
                    } else {
                        BLK_S_IOERR
                    }
                } else {
                    BLK_S_IOERR
                }
            }
            BLK_T_OUT => {
                if offset + data_len as usize <= self.image.len() {
                    let mut chunk = vec![0u8; data_len as usize];
                    if ram.read_into(PhysAddr::new(data_addr), &mut chunk).is_ok() {
                        self.image[offset..offset + data_len as usize].copy_from_slice(&chunk);
                        BLK_S_OK
                    } else {
                        BLK_S_IOERR
                    }
                } else {
                    BLK_S_IOERR
                }
            }
            _ => BLK_S_UNSUPP,
        };

        debug!(
            "vioblk: type={} sector={} len={} -> status={}",
            req_type, sector, data_len, status
        );
        let _ = ram.write_byte(PhysAddr::new(status_addr), status);
        written + 1
    }
}
