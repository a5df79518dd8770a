// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CPU fault classification.
//!
//! The fault handlers in `arch::arm_m` funnel memory-management, bus and
//! usage faults into [`classify_fault`], which turns the Configurable Fault
//! Status Register bits into a POSIX siginfo. Faults from privileged code
//! never get here -- they panic in the architecture layer. The classified
//! signal is delivered to the faulting thread through the normal signal
//! injection path, with one twist: a `SIG_IGN` disposition is overridden for
//! synchronous faults, because resuming a faulting instruction with the
//! fault unhandled would just fault again.

use abi::{
    SigInfo, BUS_ADRALN, BUS_ADRERR, BUS_OBJERR, FPE_INTDIV, ILL_COPROC,
    ILL_ILLADR, ILL_ILLOPC, SEGV_ACCERR, SIGBUS, SIGFPE, SIGILL, SIGSEGV,
};

bitflags::bitflags! {
    /// Bits in the Configurable Fault Status Register.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct Cfsr: u32 {
        // Bits 0-7: MMFSR (Memory Management Fault Status Register)
        const IACCVIOL = 1 << 0;
        const DACCVIOL = 1 << 1;
        // MMFSR bit 2 reserved
        const MUNSTKERR = 1 << 3;
        const MSTKERR = 1 << 4;
        const MLSPERR = 1 << 5;
        // MMFSR bit 6 reserved
        const MMARVALID = 1 << 7;

        // Bits 8-15: BFSR (Bus Fault Status Register)
        const IBUSERR = 1 << (8 + 0);
        const PRECISERR = 1 << (8 + 1);
        const IMPRECISERR = 1 << (8 + 2);
        const UNSTKERR = 1 << (8 + 3);
        const STKERR = 1 << (8 + 4);
        const LSPERR = 1 << (8 + 5);
        // BFSR bit 6 reserved
        const BFARVALID = 1 << (8 + 7);

        // Bits 16-31: UFSR (Usage Fault Status Register)
        const UNDEFINSTR = 1 << (16 + 0);
        const INVSTATE = 1 << (16 + 1);
        const INVPC = 1 << (16 + 2);
        const NOCP = 1 << (16 + 3);
        const UNALIGNED = 1 << (16 + 8);
        const DIVBYZERO = 1 << (16 + 9);
    }
}

/// Which configurable fault fired, from the active exception number.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultKind {
    MemManage,
    BusFault,
    UsageFault,
}

impl FaultKind {
    /// Maps an exception number (IPSR) to a fault kind.
    pub fn from_exception_number(num: u32) -> Option<Self> {
        match num {
            4 => Some(Self::MemManage),
            5 => Some(Self::BusFault),
            6 => Some(Self::UsageFault),
            _ => None,
        }
    }
}

fn classify_memmanage(cfsr: Cfsr, mmfar: u32) -> Option<SigInfo> {
    let address = if cfsr.contains(Cfsr::MMARVALID) {
        mmfar
    } else {
        0
    };
    if cfsr.intersects(Cfsr::IACCVIOL | Cfsr::DACCVIOL) {
        return Some(SigInfo {
            si_signo: SIGSEGV,
            si_code: SEGV_ACCERR,
            si_value: 0,
            si_addr: address,
        });
    }
    if cfsr.intersects(Cfsr::MSTKERR | Cfsr::MUNSTKERR | Cfsr::MLSPERR) {
        return Some(SigInfo {
            si_signo: SIGBUS,
            si_code: BUS_OBJERR,
            si_value: 0,
            si_addr: address,
        });
    }
    None
}

fn classify_busfault(cfsr: Cfsr, bfar: u32) -> Option<SigInfo> {
    let address = if cfsr.contains(Cfsr::BFARVALID) {
        bfar
    } else {
        0
    };
    if cfsr.contains(Cfsr::PRECISERR) {
        return Some(SigInfo {
            si_signo: SIGBUS,
            si_code: BUS_ADRERR,
            si_value: 0,
            si_addr: address,
        });
    }
    if cfsr.contains(Cfsr::IMPRECISERR) {
        return Some(SigInfo {
            si_signo: SIGBUS,
            si_code: BUS_OBJERR,
            si_value: 0,
            si_addr: 0,
        });
    }
    if cfsr.intersects(Cfsr::STKERR | Cfsr::UNSTKERR | Cfsr::LSPERR) {
        return Some(SigInfo {
            si_signo: SIGBUS,
            si_code: BUS_OBJERR,
            si_value: 0,
            si_addr: address,
        });
    }
    None
}

fn classify_usagefault(cfsr: Cfsr) -> Option<SigInfo> {
    let si = |signo, code| {
        Some(SigInfo {
            si_signo: signo,
            si_code: code,
            si_value: 0,
            si_addr: 0,
        })
    };
    if cfsr.contains(Cfsr::DIVBYZERO) {
        return si(SIGFPE, FPE_INTDIV);
    }
    if cfsr.contains(Cfsr::UNALIGNED) {
        return si(SIGBUS, BUS_ADRALN);
    }
    if cfsr.contains(Cfsr::NOCP) {
        return si(SIGILL, ILL_COPROC);
    }
    if cfsr.contains(Cfsr::UNDEFINSTR) {
        return si(SIGILL, ILL_ILLOPC);
    }
    if cfsr.contains(Cfsr::INVPC) {
        return si(SIGILL, ILL_ILLADR);
    }
    if cfsr.contains(Cfsr::INVSTATE) {
        return si(SIGILL, ILL_ILLADR);
    }
    None
}

/// Classifies a fault into the siginfo to deliver. Unclassifiable faults
/// default to `{SIGBUS, BUS_OBJERR}`.
pub fn classify_fault(kind: FaultKind, cfsr: Cfsr, mmfar: u32, bfar: u32) -> SigInfo {
    let info = match kind {
        FaultKind::MemManage => classify_memmanage(cfsr, mmfar),
        FaultKind::BusFault => classify_busfault(cfsr, bfar),
        FaultKind::UsageFault => classify_usagefault(cfsr),
    };
    info.unwrap_or(SigInfo {
        si_signo: SIGBUS,
        si_code: BUS_OBJERR,
        si_value: 0,
        si_addr: 0,
    })
}
