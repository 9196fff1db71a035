//! Sv39 address translation for guest execution. The kernel builds page
//! tables in guest RAM; this walker interprets them exactly as the MMU
//! would, including 1 GiB and 2 MiB leaves, U-bit enforcement and SUM.

use crate::cpu::{PrivilegeMode, SSTATUS_SUM};
use crate::memory::{Memory, PhysAddr, VirtAddr};
use crate::trap::TrapCause;

pub const PTE_V: u64 = 1 << 0;
pub const PTE_R: u64 = 1 << 1;
pub const PTE_W: u64 = 1 << 2;
pub const PTE_X: u64 = 1 << 3;
pub const PTE_U: u64 = 1 << 4;

const SATP_MODE_SHIFT: u32 = 60;
const SATP_PPN_MASK: u64 = (1 << 44) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

fn fault(access: AccessType, addr: VirtAddr) -> TrapCause {
    match access {
        AccessType::Read => TrapCause::LoadPageFault { addr },
        AccessType::Write => TrapCause::StorePageFault { addr },
        AccessType::Execute => TrapCause::InstructionPageFault { addr },
    }
}

pub fn translate(
    addr: VirtAddr,
    access: AccessType,
    satp: u64,
    mode: PrivilegeMode,
    sstatus: u64,
    mem: &mut dyn Memory,
) -> Result<PhysAddr, TrapCause> {
    let va = addr.val();

    // Bare mode, and M mode, bypass translation.
    if mode == PrivilegeMode::Machine || satp >> SATP_MODE_SHIFT == 0 {
        return Ok(PhysAddr::new(va));
    }

    // Sv39 requires bits 63:39 to replicate bit 38.
    if ((va as i64) << 25 >> 25) as u64 != va {
        return Err(fault(access, addr));
    }

    let mut table = (satp & SATP_PPN_MASK) << 12;
    for level in (0..3u32).rev() {
        let idx = (va >> (12 + 9 * level)) & 0x1FF;
        let pte = mem
            .read_dword(PhysAddr::new(table + idx * 8))
            .map_err(|_| fault(access, addr))?;

        if pte & PTE_V == 0 {
            return Err(fault(access, addr));
        }

        let ppn = (pte >> 10) & SATP_PPN_MASK;
        if pte & (PTE_R | PTE_W | PTE_X) == 0 {
            // Pointer to the next level.
            if level == 0 {
                return Err(fault(access, addr));
            }
            table = ppn << 12;
            continue;
        }

        // Leaf. A superpage leaf must be aligned to its size.
        let span = 9 * level;
        if ppn & ((1 << span) - 1) != 0 {
            return Err(fault(access, addr));
        }

        let needed = match access {
            AccessType::Read => PTE_R,
            AccessType::Write => PTE_W,
            AccessType::Execute => PTE_X,
        };
        if pte & needed == 0 {
            return Err(fault(access, addr));
        }

        match mode {
            PrivilegeMode::User => {
                if pte & PTE_U == 0 {
                    return Err(fault(access, addr));
                }
            }
            PrivilegeMode::Supervisor => {
                if pte & PTE_U != 0 {
                    // S mode never executes U pages; data access needs SUM.
                    if access == AccessType::Execute || sstatus & SSTATUS_SUM == 0 {
                        return Err(fault(access, addr));
                    }
                }
            }
            PrivilegeMode::Machine => unreachable!(),
        }

        let offset_mask = (1u64 << (12 + span)) - 1;
        return Ok(PhysAddr::new((ppn << 12) | (va & offset_mask)));
    }

    unreachable!("sv39 walk fell through")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{GuestRam, RAM_START};

    const SV39: u64 = 8 << SATP_MODE_SHIFT;

    fn leaf(pa: u64, flags: u64) -> u64 {
        ((pa >> 12) << 10) | flags | PTE_V
    }

    fn table(pa: u64) -> u64 {
        ((pa >> 12) << 10) | PTE_V
    }

    /// Root at RAM_START, one level-1 table, one level-0 table; maps
    /// VA 0xC000_0000 -> RAM_START+0x10000 with the given flags.
    fn build_tables(ram: &mut GuestRam, flags: u64) -> u64 {
        let root = RAM_START;
        let pt1 = RAM_START + 0x1000;
        let pt0 = RAM_START + 0x2000;
        let va: u64 = 0xC000_0000;
        let vpn2 = (va >> 30) & 0x1FF;
        let vpn1 = (va >> 21) & 0x1FF;
        let vpn0 = (va >> 12) & 0x1FF;
        ram.write_dword(PhysAddr::new(root + vpn2 * 8), table(pt1))
            .unwrap();
        ram.write_dword(PhysAddr::new(pt1 + vpn1 * 8), table(pt0))
            .unwrap();
        ram.write_dword(
            PhysAddr::new(pt0 + vpn0 * 8),
            leaf(RAM_START + 0x10000, flags),
        )
        .unwrap();
        SV39 | (root >> 12)
    }

    #[test]
    fn translates_a_user_page() {
        let mut ram = GuestRam::new(128 * 1024);
        let satp = build_tables(&mut ram, PTE_R | PTE_W | PTE_U);
        let pa = translate(
            VirtAddr::new(0xC000_0123),
            AccessType::Read,
            satp,
            PrivilegeMode::User,
            0,
            &mut ram,
        )
        .unwrap();
        assert_eq!(pa.val(), RAM_START + 0x10123);
    }

    #[test]
    fn user_cannot_reach_supervisor_pages() {
        let mut ram = GuestRam::new(128 * 1024);
        let satp = build_tables(&mut ram, PTE_R | PTE_W);
        let err = translate(
            VirtAddr::new(0xC000_0000),
            AccessType::Read,
            satp,
            PrivilegeMode::User,
            0,
            &mut ram,
        )
        .unwrap_err();
        assert_eq!(
            err,
            TrapCause::LoadPageFault {
                addr: VirtAddr::new(0xC000_0000)
            }
        );
    }

    #[test]
    fn supervisor_needs_sum_for_user_pages() {
        let mut ram = GuestRam::new(128 * 1024);
        let satp = build_tables(&mut ram, PTE_R | PTE_W | PTE_U);
        let va = VirtAddr::new(0xC000_0000);
        assert!(translate(va, AccessType::Read, satp, PrivilegeMode::Supervisor, 0, &mut ram).is_err());
        assert!(translate(
            va,
            AccessType::Read,
            satp,
            PrivilegeMode::Supervisor,
            SSTATUS_SUM,
            &mut ram
        )
        .is_ok());
    }

    #[test]
    fn write_needs_w_bit() {
        let mut ram = GuestRam::new(128 * 1024);
        let satp = build_tables(&mut ram, PTE_R | PTE_U);
        let err = translate(
            VirtAddr::new(0xC000_0FFF),
            AccessType::Write,
            satp,
            PrivilegeMode::User,
            0,
            &mut ram,
        )
        .unwrap_err();
        assert!(matches!(err, TrapCause::StorePageFault { .. }));
    }

    #[test]
    fn gigapage_leaves_translate() {
        let mut ram = GuestRam::new(64 * 1024);
        let root = RAM_START;
        // Identity gigapage for [0, 1G): vpn2 index 0.
        ram.write_dword(PhysAddr::new(root), leaf(0, PTE_R | PTE_W))
            .unwrap();
        let satp = SV39 | (root >> 12);
        let pa = translate(
            VirtAddr::new(0x1000_0123),
            AccessType::Read,
            satp,
            PrivilegeMode::Supervisor,
            0,
            &mut ram,
        )
        .unwrap();
        assert_eq!(pa.val(), 0x1000_0123);
    }

    #[test]
    fn non_canonical_addresses_fault() {
        let mut ram = GuestRam::new(64 * 1024);
        let satp = build_tables(&mut ram, PTE_R | PTE_U);
        assert!(translate(
            VirtAddr::new(0xFFFF_FFFF_C000_0000),
            AccessType::Read,
            satp,
            PrivilegeMode::User,
            0,
            &mut ram
        )
        .is_err());
    }
}
