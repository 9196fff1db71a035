//! External interrupt management: a table of interrupt service routines
//! keyed by IRQ number, and the thin PLIC wrapper the kernel and drivers
//! drive over MMIO. ISRs only acknowledge their device and wake waiters;
//! no data moves in interrupt context.

use crate::thread::ThreadManager;
use ember_machine::devices::plic::{CLAIM, ENABLE, PLIC_BASE, PRIORITY_BASE, THRESHOLD};
use ember_machine::{Memory, PhysAddr};
use std::cell::RefCell;
use std::rc::Rc;

pub const NIRQ: usize = 32;

/// Implemented by drivers that service an interrupt line.
pub trait Isr {
    fn isr(&mut self, irqno: u32, mem: &mut dyn Memory, threads: &mut ThreadManager);
}

struct IsrEntry {
    prio: u32,
    handler: Rc<RefCell<dyn Isr>>,
}

#[derive(Default)]
pub struct IntrController {
    isrtab: Vec<Option<IsrEntry>>,
}

fn plic_word(mem: &mut dyn Memory, offset: u64) -> u32 {
    mem.read_word(PhysAddr::new(PLIC_BASE + offset))
        .expect("plic unreachable")
}

fn plic_write(mem: &mut dyn Memory, offset: u64, val: u32) {
    mem.write_word(PhysAddr::new(PLIC_BASE + offset), val)
        .expect("plic unreachable")
}

pub fn plic_enable_irq(mem: &mut dyn Memory, irqno: u32, prio: u32) {
    plic_write(mem, PRIORITY_BASE + 4 * irqno as u64, prio);
    let enabled = plic_word(mem, ENABLE);
    plic_write(mem, ENABLE, enabled | (1 << irqno));
}

pub fn plic_disable_irq(mem: &mut dyn Memory, irqno: u32) {
    let enabled = plic_word(mem, ENABLE);
    plic_write(mem, ENABLE, enabled & !(1 << irqno));
}

pub fn plic_claim_irq(mem: &mut dyn Memory) -> u32 {
    plic_word(mem, CLAIM)
}

pub fn plic_close_irq(mem: &mut dyn Memory, irqno: u32) {
    plic_write(mem, CLAIM, irqno);
}

impl IntrController {
    pub fn new() -> Self {
        Self {
            isrtab: (0..NIRQ).map(|_| None).collect(),
        }
    }

    pub fn init(&mut self, mem: &mut dyn Memory) {
        plic_write(mem, THRESHOLD, 0);
    }

    /// Register a driver's service routine for an IRQ line. A
    /// non-positive priority is promoted to 1.
    pub fn register_isr(&mut self, irqno: u32, prio: u32, handler: Rc<RefCell<dyn Isr>>) {
        assert!((irqno as usize) < NIRQ, "irqno out of bounds");
        let prio = prio.max(1);
        self.isrtab[irqno as usize] = Some(IsrEntry { prio, handler });
    }

    pub fn enable_irq(&self, mem: &mut dyn Memory, irqno: u32) {
        let entry = self.isrtab[irqno as usize]
            .as_ref()
            .expect("enable_irq with no isr");
        plic_enable_irq(mem, irqno, entry.prio);
    }

    pub fn disable_irq(&self, mem: &mut dyn Memory, irqno: u32) {
        plic_disable_irq(mem, irqno);
    }

    /// Claim and dispatch one pending external interrupt.
    pub fn service(&mut self, mem: &mut dyn Memory, threads: &mut ThreadManager) {
        let irqno = plic_claim_irq(mem);
        if irqno == 0 {
            return;
        }
        assert!((irqno as usize) < NIRQ, "invalid irq");
        let handler = match &self.isrtab[irqno as usize] {
            Some(entry) => Rc::clone(&entry.handler),
            None => panic!("unhandled irq {irqno}"),
        };
        handler.borrow_mut().isr(irqno, mem, threads);
        plic_close_irq(mem, irqno);
    }
}
