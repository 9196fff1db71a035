//! Guest physical address space: RAM above `RAM_START`, MMIO windows
//! below it. The bus routes accesses and keeps the PLIC's pending bits in
//! sync with each device's level-triggered line.

use crate::devices::{
    Clint, Plic, Uart, VirtioBlock, CLINT_BASE, CLINT_SIZE, PLIC_BASE, PLIC_SIZE, UART0_BASE,
    UART_SIZE, VIRT0_BASE, VIRT0_IRQ, VIRT_SIZE,
};
use crate::error::MemoryError;
use crate::memory::{GuestRam, Memory, PhysAddr, RAM_START};

pub struct SystemBus {
    pub ram: GuestRam,
    pub uart: Uart,
    pub plic: Plic,
    pub clint: Clint,
    pub vioblk: VirtioBlock,
}

impl SystemBus {
    pub fn new(memory_size: usize, disk_image: Vec<u8>) -> Self {
        Self {
            ram: GuestRam::new(memory_size),
            uart: Uart::new(),
            plic: Plic::new(),
            clint: Clint::new(),
            vioblk: VirtioBlock::new(disk_image),
        }
    }

    pub fn sync_irqs(&mut self) {
        self.plic.latch(VIRT0_IRQ, self.vioblk.irq_asserted());
    }

    fn in_window(addr: u64, base: u64, size: u64) -> bool {
        addr >= base && addr < base + size
    }

    fn mmio_read_word(&mut self, addr: u64) -> Result<u32, MemoryError> {
        let val = if Self::in_window(addr, UART0_BASE, UART_SIZE) {
            self.uart.read(addr - UART0_BASE) as u32
        } else if Self::in_window(addr, VIRT0_BASE, VIRT_SIZE) {
            self.vioblk.read_word(addr - VIRT0_BASE)
        } else if Self::in_window(addr, CLINT_BASE, CLINT_SIZE) {
            self.clint.read_dword(addr - CLINT_BASE) as u32
        } else if Self::in_window(addr, PLIC_BASE, PLIC_SIZE) {
            self.plic.read_word(addr - PLIC_BASE)
        } else {
            return Err(MemoryError::Unmapped(addr));
        };
        self.sync_irqs();
        Ok(val)
    }

    fn mmio_write_word(&mut self, addr: u64, val: u32) -> Result<(), MemoryError> {
        if Self::in_window(addr, UART0_BASE, UART_SIZE) {
            self.uart.write(addr - UART0_BASE, val as u8);
        } else if Self::in_window(addr, VIRT0_BASE, VIRT_SIZE) {
            self.vioblk.write_word(addr - VIRT0_BASE, val, &mut self.ram);
        } else if Self::in_window(addr, CLINT_BASE, CLINT_SIZE) {
            self.clint.write_dword(addr - CLINT_BASE, val as u64);
        } else if Self::in_window(addr, PLIC_BASE, PLIC_SIZE) {
            self.plic.write_word(addr - PLIC_BASE, val);
        } else {
            return Err(MemoryError::Unmapped(addr));
        }
        self.sync_irqs();
        Ok(())
    }
}

impl Memory for SystemBus {
    fn read_byte(&mut self, addr: PhysAddr) -> Result<u8, MemoryError> {
        if addr.val() >= RAM_START {
            self.ram.read_byte(addr)
        } else if Self::in_window(addr.val(), UART0_BASE, UART_SIZE) {
            Ok(self.uart.read(addr.val() - UART0_BASE))
        } else {
            Ok(self.mmio_read_word(addr.val() & !3)? as u8)
        }
    }

    fn write_byte(&mut self, addr: PhysAddr, val: u8) -> Result<(), MemoryError> {
        if addr.val() >= RAM_START {
            self.ram.write_byte(addr, val)
        } else if Self::in_window(addr.val(), UART0_BASE, UART_SIZE) {
            self.uart.write(addr.val() - UART0_BASE, val);
            Ok(())
        } else {
            self.mmio_write_word(addr.val() & !3, val as u32)
        }
    }

    fn read_word(&mut self, addr: PhysAddr) -> Result<u32, MemoryError> {
        if addr.val() >= RAM_START {
            self.ram.read_word(addr)
        } else {
            self.mmio_read_word(addr.val())
        }
    }

    fn write_word(&mut self, addr: PhysAddr, val: u32) -> Result<(), MemoryError> {
        if addr.val() >= RAM_START {
            self.ram.write_word(addr, val)
        } else {
            self.mmio_write_word(addr.val(), val)
        }
    }

    fn read_dword(&mut self, addr: PhysAddr) -> Result<u64, MemoryError> {
        if addr.val() >= RAM_START {
            self.ram.read_dword(addr)
        } else if Self::in_window(addr.val(), CLINT_BASE, CLINT_SIZE) {
            Ok(self.clint.read_dword(addr.val() - CLINT_BASE))
        } else {
            let lo = self.mmio_read_word(addr.val())? as u64;
            let hi = self.mmio_read_word(addr.val() + 4)? as u64;
            Ok(lo | (hi << 32))
        }
    }

    fn write_dword(&mut self, addr: PhysAddr, val: u64) -> Result<(), MemoryError> {
        if addr.val() >= RAM_START {
            self.ram.write_dword(addr, val)
        } else if Self::in_window(addr.val(), CLINT_BASE, CLINT_SIZE) {
            self.clint.write_dword(addr.val() - CLINT_BASE, val);
            Ok(())
        } else {
            self.mmio_write_word(addr.val(), val as u32)?;
            self.mmio_write_word(addr.val() + 4, (val >> 32) as u32)
        }
    }
}
