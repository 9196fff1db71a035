//! Physical page allocator and Sv39 virtual memory manager.
//!
//! All page tables and the page freelist live in guest RAM and are
//! manipulated through the `Memory` trait, so the machine's MMU walks
//! exactly the structures built here. A free page carries the physical
//! address of the next free page in its first doubleword.
//!
//! Address space layout: the MMIO range [0, RAM_START) is identity
//! mapped as two RW gigapages; the first megapage of RAM is mapped as
//! 4 KiB leaves with permissions following the kernel image regions; the
//! rest of RAM is identity mapped as RW megapages. All kernel mappings
//! carry the Global bit and are shared between address spaces through
//! the kernel's level-1 table. User mappings occupy
//! [USER_START_VMA, USER_END_VMA) and are private per process.

use crate::error::{Errno, KResult};
use bitflags::bitflags;
use ember_machine::{Memory, PhysAddr, RAM_START};
use log::{debug, info};

pub const PAGE_ORDER: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_ORDER;
pub const MEGA_SIZE: u64 = 512 * PAGE_SIZE;
pub const GIGA_SIZE: u64 = 512 * MEGA_SIZE;

/// Number of PTEs per page table.
pub const PTE_CNT: u64 = PAGE_SIZE / 8;

pub const USER_START_VMA: u64 = 0xC000_0000;
pub const USER_END_VMA: u64 = 0xD000_0000;
pub const USER_STACK_VMA: u64 = USER_END_VMA;

const SATP_MODE_SV39: u64 = 8;
const SATP_MODE_SHIFT: u32 = 60;
const SATP_ASID_SHIFT: u32 = 44;
const PPN_MASK: u64 = (1 << 44) - 1;

bitflags! {
    /// PTE permission and status bits. V, A and D are managed
    /// internally; callers pass combinations of R, W, X, U and G.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Pte: u64 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

impl Pte {
    const LEAF: Pte = Pte::R.union(Pte::W).union(Pte::X);
}

fn leaf_pte(pa: u64, flags: Pte) -> u64 {
    ((pa >> PAGE_ORDER) << 10) | (flags | Pte::A | Pte::D | Pte::V).bits()
}

fn ptab_pte(pa: u64, g_flag: Pte) -> u64 {
    ((pa >> PAGE_ORDER) << 10) | (g_flag | Pte::V).bits()
}

fn pte_flags(word: u64) -> Pte {
    Pte::from_bits_truncate(word)
}

fn pte_pa(word: u64) -> u64 {
    ((word >> 10) & PPN_MASK) << PAGE_ORDER
}

fn vpn2(va: u64) -> u64 {
    (va >> 30) & 0x1FF
}

fn vpn1(va: u64) -> u64 {
    (va >> 21) & 0x1FF
}

fn vpn0(va: u64) -> u64 {
    (va >> 12) & 0x1FF
}

fn round_up(addr: u64, blksz: u64) -> u64 {
    addr.div_ceil(blksz) * blksz
}

fn round_down(addr: u64, blksz: u64) -> u64 {
    addr / blksz * blksz
}

/// Where the kernel image regions end; drives the permissions of the
/// first RAM megapage.
#[derive(Debug, Clone, Copy)]
pub struct KernelLayout {
    pub kimg_start: u64,
    pub text_end: u64,
    pub rodata_end: u64,
    pub kimg_end: u64,
    pub ram_end: u64,
}

impl KernelLayout {
    /// Default layout: a small reserved image region at the bottom of
    /// RAM.
    pub fn with_ram_end(ram_end: u64) -> Self {
        Self {
            kimg_start: RAM_START,
            text_end: RAM_START + 0x4000,
            rodata_end: RAM_START + 0x6000,
            kimg_end: RAM_START + 0x8000,
            ram_end,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A fresh zero page was mapped; retry the faulting access.
    Mapped,
    /// The fault is not demand-pageable; the process must die.
    Fatal,
}

pub struct MemoryManager {
    layout: KernelLayout,
    pub main_mtag: u64,
    active_mtag: u64,
    main_pt1: u64,
    free_head: u64,
    free_pages: usize,
}

impl MemoryManager {
    /// Build the main address space, seed the freelist with every page
    /// above the kernel reservation, and make the main space active.
    pub fn init(mem: &mut dyn Memory, layout: KernelLayout) -> Self {
        assert!(layout.kimg_end - layout.kimg_start <= MEGA_SIZE, "kernel too large");
        assert_eq!(layout.kimg_end % PAGE_SIZE, 0);

        let pt2 = layout.kimg_end;
        let pt1 = pt2 + PAGE_SIZE;
        let pt0 = pt1 + PAGE_SIZE;
        for table in [pt2, pt1, pt0] {
            zero_page(mem, table);
        }

        info!(
            "RAM: [{:#x},{:#x}): {} MB",
            RAM_START,
            layout.ram_end,
            (layout.ram_end - RAM_START) / 1024 / 1024
        );
        info!("kernel image: [{:#x},{:#x})", layout.kimg_start, layout.kimg_end);

        // Identity map the MMIO range as two gigapages.
        let mut pma = 0;
        while pma < RAM_START {
            pte_write(mem, pt2, vpn2(pma), leaf_pte(pma, Pte::R | Pte::W | Pte::G));
            pma += GIGA_SIZE;
        }

        // The RAM gigarange goes through the shared kernel tables.
        pte_write(mem, pt2, vpn2(RAM_START), ptab_pte(pt1, Pte::G));
        pte_write(mem, pt1, vpn1(RAM_START), ptab_pte(pt0, Pte::G));

        // First megapage of RAM as 4 KiB leaves with region permissions.
        let mut pp = layout.kimg_start;
        while pp < layout.text_end {
            pte_write(mem, pt0, vpn0(pp), leaf_pte(pp, Pte::R | Pte::X | Pte::G));
            pp += PAGE_SIZE;
        }
        while pp < layout.rodata_end {
            pte_write(mem, pt0, vpn0(pp), leaf_pte(pp, Pte::R | Pte::G));
            pp += PAGE_SIZE;
        }
        while pp < RAM_START + MEGA_SIZE {
            pte_write(mem, pt0, vpn0(pp), leaf_pte(pp, Pte::R | Pte::W | Pte::G));
            pp += PAGE_SIZE;
        }

        // Remaining RAM as RW megapages.
        let mut pp = RAM_START + MEGA_SIZE;
        while pp < layout.ram_end {
            pte_write(mem, pt1, vpn1(pp), leaf_pte(pp, Pte::R | Pte::W | Pte::G));
            pp += MEGA_SIZE;
        }

        let main_mtag = (SATP_MODE_SV39 << SATP_MODE_SHIFT) | (pt2 >> PAGE_ORDER);

        // Thread every page above the page tables onto the freelist.
        let free_start = pt0 + PAGE_SIZE;
        let mut free_pages = 0;
        let mut pp = free_start;
        while pp < layout.ram_end {
            let next = if pp + PAGE_SIZE < layout.ram_end {
                pp + PAGE_SIZE
            } else {
                0
            };
            mem.write_dword(PhysAddr::new(pp), next)
                .expect("freelist out of RAM");
            free_pages += 1;
            pp += PAGE_SIZE;
        }

        info!(
            "page allocator: [{:#x},{:#x}): {} pages free",
            free_start, layout.ram_end, free_pages
        );

        Self {
            layout,
            main_mtag,
            active_mtag: main_mtag,
            main_pt1: pt1,
            free_head: free_start,
            free_pages,
        }
    }

    pub fn free_pages(&self) -> usize {
        self.free_pages
    }

    pub fn active_mtag(&self) -> u64 {
        self.active_mtag
    }

    /// Record the active space after a context switch restored `satp`.
    pub fn set_active(&mut self, mtag: u64) {
        self.active_mtag = mtag;
    }

    fn active_root(&self) -> u64 {
        mtag_to_root(self.active_mtag)
    }

    /// Detach the freelist head. Panics when memory is exhausted.
    pub fn alloc_page(&mut self, mem: &mut dyn Memory) -> u64 {
        if self.free_head == 0 {
            panic!("out of physical pages");
        }
        let page = self.free_head;
        self.free_head = mem
            .read_dword(PhysAddr::new(page))
            .expect("freelist corrupted");
        self.free_pages -= 1;
        page
    }

    /// Relink a page at the freelist head. No coalescing.
    pub fn free_page(&mut self, mem: &mut dyn Memory, page: u64) {
        mem.write_dword(PhysAddr::new(page), self.free_head)
            .expect("freelist out of RAM");
        self.free_head = page;
        self.free_pages += 1;
    }

    fn alloc_zeroed(&mut self, mem: &mut dyn Memory) -> u64 {
        let page = self.alloc_page(mem);
        zero_page(mem, page);
        page
    }

    /// Create a new space sharing the kernel mapping: identity MMIO
    /// gigapages plus the kernel's level-1 table, all Global so TLB
    /// entries survive ASID changes.
    pub fn space_create(&mut self, mem: &mut dyn Memory, asid: u16) -> u64 {
        let root = self.alloc_zeroed(mem);
        let mut pma = 0;
        while pma < RAM_START {
            pte_write(mem, root, vpn2(pma), leaf_pte(pma, Pte::R | Pte::W | Pte::G));
            pma += GIGA_SIZE;
        }
        pte_write(mem, root, vpn2(RAM_START), ptab_pte(self.main_pt1, Pte::G));
        mtag(asid, root)
    }

    /// Clone the active space: same kernel mapping, and a private copy
    /// of every mapped user page with the original's flags and contents.
    pub fn space_clone(&mut self, mem: &mut dyn Memory, asid: u16) -> u64 {
        let new_mtag = self.space_create(mem, asid);
        let new_root = mtag_to_root(new_mtag);
        let old_root = self.active_root();

        let mut vma = USER_START_VMA;
        while vma < USER_END_VMA {
            if let Some(src_addr) = walk_existing(mem, old_root, vma) {
                let src = pte_read(mem, src_addr);
                // Only kernel mappings are Global; the reclaim path
                // depends on user mappings never being so.
                assert!(
                    !pte_flags(src).contains(Pte::G),
                    "user mapping at {vma:#x} is global"
                );
                let dst_addr = self.walk_or_create(mem, new_root, vma);
                let dst = pte_read(mem, dst_addr);
                let dst_page = pte_pa(dst);
                pte_write_raw(mem, dst_addr, leaf_pte(dst_page, pte_flags(src) & !Pte::V));
                copy_page(mem, pte_pa(src), dst_page);
            }
            vma += PAGE_SIZE;
        }
        new_mtag
    }

    /// Switch to the main space and reclaim the one active on entry:
    /// every non-Global page reachable through its user mappings goes
    /// back to the allocator, then the tables themselves, then the root.
    pub fn space_reclaim(&mut self, mem: &mut dyn Memory) {
        let prev = self.space_switch(self.main_mtag);
        if prev == self.main_mtag {
            return;
        }
        let root = mtag_to_root(prev);

        for i in 0..PTE_CNT {
            let word2 = pte_read(mem, root + i * 8);
            let flags2 = pte_flags(word2);
            if !flags2.contains(Pte::V) || flags2.contains(Pte::G) {
                continue;
            }
            if flags2.intersects(Pte::LEAF) {
                continue;
            }
            let pt1 = pte_pa(word2);
            for j in 0..PTE_CNT {
                let word1 = pte_read(mem, pt1 + j * 8);
                let flags1 = pte_flags(word1);
                if !flags1.contains(Pte::V) || flags1.contains(Pte::G) {
                    continue;
                }
                if flags1.intersects(Pte::LEAF) {
                    continue;
                }
                let pt0 = pte_pa(word1);
                for k in 0..PTE_CNT {
                    let word0 = pte_read(mem, pt0 + k * 8);
                    let flags0 = pte_flags(word0);
                    if !flags0.contains(Pte::V) || flags0.contains(Pte::G) {
                        continue;
                    }
                    let page = pte_pa(word0);
                    if page > self.layout.kimg_end && page < self.layout.ram_end {
                        self.free_page(mem, page);
                    }
                }
                self.free_page(mem, pt0);
            }
            self.free_page(mem, pt1);
        }
        self.free_page(mem, root);
    }

    /// Make `mtag` the active space; returns the previously active one.
    pub fn space_switch(&mut self, mtag: u64) -> u64 {
        std::mem::replace(&mut self.active_mtag, mtag)
    }

    /// Descend to the level-0 PTE for `vma`, creating tables (and a
    /// zeroed backing page for the leaf) on demand. Panics if the walk
    /// meets a mega- or gigapage leaf.
    fn walk_or_create(&mut self, mem: &mut dyn Memory, root: u64, vma: u64) -> u64 {
        let mut table = root;
        for idx in [vpn2(vma), vpn1(vma)] {
            let addr = table + idx * 8;
            let word = pte_read(mem, addr);
            let flags = pte_flags(word);
            if !flags.contains(Pte::V) {
                let new_table = self.alloc_zeroed(mem);
                pte_write_raw(mem, addr, ptab_pte(new_table, Pte::empty()));
                table = new_table;
            } else {
                assert!(
                    !flags.intersects(Pte::LEAF),
                    "page walk for {vma:#x} hit a superpage leaf"
                );
                table = pte_pa(word);
            }
        }
        let addr = table + vpn0(vma) * 8;
        let word = pte_read(mem, addr);
        if !pte_flags(word).contains(Pte::V) {
            let page = self.alloc_zeroed(mem);
            pte_write_raw(mem, addr, leaf_pte(page, Pte::empty()));
        }
        addr
    }

    /// Allocate a fresh page and map it at `vma` in the active space.
    pub fn alloc_and_map_page(&mut self, mem: &mut dyn Memory, vma: u64, flags: Pte) -> u64 {
        let root = self.active_root();
        let pte_addr = self.walk_or_create(mem, root, round_down(vma, PAGE_SIZE));
        let word = pte_read(mem, pte_addr);
        pte_write_raw(mem, pte_addr, leaf_pte(pte_pa(word), flags));
        vma
    }

    /// Map every page covering `[vma, vma + size)`.
    pub fn alloc_and_map_range(&mut self, mem: &mut dyn Memory, vma: u64, size: u64, flags: Pte) -> u64 {
        let mut page = round_down(vma, PAGE_SIZE);
        let end = round_up(vma + size, PAGE_SIZE);
        while page < end {
            self.alloc_and_map_page(mem, page, flags);
            page += PAGE_SIZE;
        }
        vma
    }

    /// Overwrite the permission bits of one mapped leaf; A, D and V are
    /// re-asserted, the physical mapping is preserved.
    pub fn set_page_flags(&mut self, mem: &mut dyn Memory, vma: u64, flags: Pte) {
        let root = self.active_root();
        if let Some(pte_addr) = walk_existing(mem, root, round_down(vma, PAGE_SIZE)) {
            let word = pte_read(mem, pte_addr);
            pte_write_raw(mem, pte_addr, leaf_pte(pte_pa(word), flags));
        }
    }

    pub fn set_range_flags(&mut self, mem: &mut dyn Memory, vma: u64, size: u64, flags: Pte) {
        let mut page = round_down(vma, PAGE_SIZE);
        let end = round_up(vma + size, PAGE_SIZE);
        while page < end {
            self.set_page_flags(mem, page, flags);
            page += PAGE_SIZE;
        }
    }

    /// Free the backing page of every user-range leaf in the active
    /// space and null the PTE. Used by `exec` before loading a new
    /// image.
    pub fn unmap_and_free_user(&mut self, mem: &mut dyn Memory) {
        let root = self.active_root();
        let mut vma = USER_START_VMA;
        while vma < USER_END_VMA {
            if let Some(pte_addr) = walk_existing(mem, root, vma) {
                let word = pte_read(mem, pte_addr);
                self.free_page(mem, pte_pa(word));
                pte_write_raw(mem, pte_addr, 0);
            }
            vma += PAGE_SIZE;
        }
    }

    /// Every page covering `[vp, vp + len)` must be mapped in the active
    /// space with at least `flags`.
    pub fn validate_vptr_len(&self, mem: &mut dyn Memory, vp: u64, len: u64, flags: Pte) -> KResult<()> {
        if len == 0 {
            return Ok(());
        }
        let root = self.active_root();
        let mut page = round_down(vp, PAGE_SIZE);
        let end = round_up(vp + len, PAGE_SIZE);
        while page < end {
            let pte_addr = walk_existing(mem, root, page).ok_or(Errno::Inval)?;
            let word = pte_read(mem, pte_addr);
            if !pte_flags(word).contains(flags | Pte::V) {
                return Err(Errno::Inval);
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }

    /// Walk a user string byte by byte until NUL, re-validating at every
    /// page boundary.
    pub fn validate_vstr(&self, mem: &mut dyn Memory, vs: u64, flags: Pte) -> KResult<()> {
        let root = self.active_root();
        let mut va = vs;
        let mut page_pa = 0;
        loop {
            if va == vs || va % PAGE_SIZE == 0 {
                let pte_addr = walk_existing(mem, root, va).ok_or(Errno::Inval)?;
                let word = pte_read(mem, pte_addr);
                if !pte_flags(word).contains(flags | Pte::V) {
                    return Err(Errno::Inval);
                }
                page_pa = pte_pa(word);
            }
            let byte = mem
                .read_byte(PhysAddr::new(page_pa + va % PAGE_SIZE))
                .map_err(|_| Errno::Inval)?;
            if byte == 0 {
                return Ok(());
            }
            va += 1;
            if va >= USER_END_VMA {
                return Err(Errno::Inval);
            }
        }
    }

    /// Read a NUL-terminated string from the active space. Validate
    /// first.
    pub fn read_user_cstr(&self, mem: &mut dyn Memory, vs: u64) -> KResult<String> {
        let root = self.active_root();
        let mut bytes = Vec::new();
        let mut va = vs;
        loop {
            let pte_addr = walk_existing(mem, root, va).ok_or(Errno::Inval)?;
            let page_pa = pte_pa(pte_read(mem, pte_addr));
            loop {
                let byte = mem
                    .read_byte(PhysAddr::new(page_pa + va % PAGE_SIZE))
                    .map_err(|_| Errno::Inval)?;
                if byte == 0 {
                    return String::from_utf8(bytes).map_err(|_| Errno::Inval);
                }
                bytes.push(byte);
                va += 1;
                if va % PAGE_SIZE == 0 {
                    break;
                }
            }
        }
    }

    /// Copy into the active space through its page tables, page by page.
    pub fn copy_to_active(&self, mem: &mut dyn Memory, va: u64, bytes: &[u8]) -> KResult<()> {
        let root = self.active_root();
        let mut off = 0usize;
        while off < bytes.len() {
            let va_cur = va + off as u64;
            let pte_addr = walk_existing(mem, root, va_cur).ok_or(Errno::Inval)?;
            let page_pa = pte_pa(pte_read(mem, pte_addr));
            let in_page = (PAGE_SIZE - va_cur % PAGE_SIZE) as usize;
            let n = in_page.min(bytes.len() - off);
            mem.write_from(
                PhysAddr::new(page_pa + va_cur % PAGE_SIZE),
                &bytes[off..off + n],
            )
            .map_err(|_| Errno::Inval)?;
            off += n;
        }
        Ok(())
    }

    pub fn copy_from_active(&self, mem: &mut dyn Memory, va: u64, buf: &mut [u8]) -> KResult<()> {
        let root = self.active_root();
        let mut off = 0usize;
        while off < buf.len() {
            let va_cur = va + off as u64;
            let pte_addr = walk_existing(mem, root, va_cur).ok_or(Errno::Inval)?;
            let page_pa = pte_pa(pte_read(mem, pte_addr));
            let in_page = (PAGE_SIZE - va_cur % PAGE_SIZE) as usize;
            let n = in_page.min(buf.len() - off);
            mem.read_into(
                PhysAddr::new(page_pa + va_cur % PAGE_SIZE),
                &mut buf[off..off + n],
            )
            .map_err(|_| Errno::Inval)?;
            off += n;
        }
        Ok(())
    }

    /// Page-fault policy: an unmapped user-range page is demand paged
    /// with a fresh zero page; a mapped page that still faulted is a
    /// protection violation and kills the process, as is any fault
    /// outside the user range.
    pub fn handle_page_fault(&mut self, mem: &mut dyn Memory, vaddr: u64) -> FaultOutcome {
        if !(USER_START_VMA..USER_END_VMA).contains(&vaddr) {
            return FaultOutcome::Fatal;
        }
        let root = self.active_root();
        if walk_existing(mem, root, vaddr).is_some() {
            return FaultOutcome::Fatal;
        }
        debug!("demand paging {:#x}", vaddr);
        self.alloc_and_map_page(mem, round_down(vaddr, PAGE_SIZE), Pte::R | Pte::W | Pte::U);
        FaultOutcome::Mapped
    }
}

fn mtag(asid: u16, root_pa: u64) -> u64 {
    (SATP_MODE_SV39 << SATP_MODE_SHIFT)
        | ((asid as u64) << SATP_ASID_SHIFT)
        | (root_pa >> PAGE_ORDER)
}

pub fn mtag_to_root(mtag: u64) -> u64 {
    (mtag & PPN_MASK) << PAGE_ORDER
}

fn pte_read(mem: &mut dyn Memory, addr: u64) -> u64 {
    mem.read_dword(PhysAddr::new(addr)).expect("page table out of RAM")
}

fn pte_write(mem: &mut dyn Memory, table: u64, idx: u64, word: u64) {
    pte_write_raw(mem, table + idx * 8, word);
}

fn pte_write_raw(mem: &mut dyn Memory, addr: u64, word: u64) {
    mem.write_dword(PhysAddr::new(addr), word)
        .expect("page table out of RAM")
}

pub(crate) fn zero_page(mem: &mut dyn Memory, pa: u64) {
    for i in 0..PTE_CNT {
        mem.write_dword(PhysAddr::new(pa + i * 8), 0)
            .expect("page out of RAM");
    }
}

fn copy_page(mem: &mut dyn Memory, src: u64, dst: u64) {
    for i in 0..PTE_CNT {
        let word = mem
            .read_dword(PhysAddr::new(src + i * 8))
            .expect("page out of RAM");
        mem.write_dword(PhysAddr::new(dst + i * 8), word)
            .expect("page out of RAM");
    }
}

/// Descend to the level-0 PTE for `vma` without creating anything.
/// Returns the PTE's physical address only when the leaf is valid.
/// Panics if the walk meets a mega- or gigapage leaf.
fn walk_existing(mem: &mut dyn Memory, root: u64, vma: u64) -> Option<u64> {
    let mut table = root;
    for idx in [vpn2(vma), vpn1(vma)] {
        let word = pte_read(mem, table + idx * 8);
        let flags = pte_flags(word);
        if !flags.contains(Pte::V) {
            return None;
        }
        assert!(
            !flags.intersects(Pte::LEAF),
            "page walk for {vma:#x} hit a superpage leaf"
        );
        table = pte_pa(word);
    }
    let addr = table + vpn0(vma) * 8;
    let word = pte_read(mem, addr);
    pte_flags(word).contains(Pte::V).then_some(addr)
}
