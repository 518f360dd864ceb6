//! Tracee CPU state: general-purpose, floating-point/SSE/AVX, segment
//! bases, and debug registers.
//!
//! The state is a capability set: each part is `Some` only when the kernel
//! yielded it, so callers can tell "zero" from "not retrievable".

use tracing::warn;

use crate::error::{Error, Result};
use crate::ptrace;
use crate::session::Session;
use crate::x86::DebugRegister;
use crate::{Address, Tid};

/// General-purpose register block, as returned by `PTRACE_GETREGS`.
pub type Gprs = libc::user_regs_struct;

/// Number of XMM registers in the target ABI.
pub const XMM_REG_COUNT: usize = if cfg!(target_arch = "x86_64") { 16 } else { 8 };

/// Base addresses of the `fs` and `gs` segments.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SegmentBases {
    pub fs_base: Address,
    pub gs_base: Address,
}

/// x87/SSE/AVX state. The `st` registers are stored in their 16-byte
/// XSAVE slots (10 bytes architecturally significant).
#[derive(Clone, Copy, Debug)]
pub struct FpuState {
    pub fcw: u16,
    pub fsw: u16,
    pub ftw: u16,
    pub fop: u16,
    pub mxcsr: u32,
    pub mxcsr_mask: u32,
    pub st: [[u8; 16]; 8],
    pub xmm: [[u8; 16]; XMM_REG_COUNT],
    /// Upper halves of the YMM registers, when the kernel yielded AVX state.
    pub ymm_high: Option<[[u8; 16]; XMM_REG_COUNT]>,
}

impl Default for FpuState {
    fn default() -> Self {
        Self {
            fcw: 0,
            fsw: 0,
            ftw: 0,
            fop: 0,
            mxcsr: 0,
            mxcsr_mask: 0,
            st: [[0; 16]; 8],
            xmm: [[0; 16]; XMM_REG_COUNT],
            ymm_high: None,
        }
    }
}

/// Snapshot of one thread's CPU state.
#[derive(Clone, Default)]
pub struct CpuState {
    pub gprs: Option<Gprs>,
    pub segment_bases: Option<SegmentBases>,
    pub fpu: Option<FpuState>,
    /// DR0–DR7 by index; DR4 and DR5 are kernel-hidden aliases and always
    /// zero.
    pub debug_regs: Option<[Address; 8]>,
}

impl CpuState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every part; all presence flags become absent.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn instruction_pointer(&self) -> Option<Address> {
        let regs = self.gprs.as_ref()?;

        #[cfg(target_arch = "x86_64")]
        return Some(regs.rip as Address);

        #[cfg(target_arch = "x86")]
        return Some(regs.eip as Address);
    }

    pub fn stack_pointer(&self) -> Option<Address> {
        let regs = self.gprs.as_ref()?;

        #[cfg(target_arch = "x86_64")]
        return Some(regs.rsp as Address);

        #[cfg(target_arch = "x86")]
        return Some(regs.esp as Address);
    }

    pub fn frame_pointer(&self) -> Option<Address> {
        let regs = self.gprs.as_ref()?;

        #[cfg(target_arch = "x86_64")]
        return Some(regs.rbp as Address);

        #[cfg(target_arch = "x86")]
        return Some(regs.ebp as Address);
    }

    pub fn flags(&self) -> Option<Address> {
        let regs = self.gprs.as_ref()?;

        Some(regs.eflags as Address)
    }
}

impl Session {
    /// Snapshot the active thread's CPU state into `state`.
    ///
    /// The state is cleared first so stale parts cannot survive; with no
    /// session attached it is simply left cleared. Parts the kernel refuses
    /// stay absent.
    pub fn get_state(&self, state: &mut CpuState) -> Result<()> {
        state.clear();

        let Some(tid) = self.active_thread() else { return Ok(()) };

        if !self.threads().is_waited(tid) {
            return Err(Error::ThreadNotStopped { tid });
        }

        match ptrace::get_regs(tid) {
            Ok(regs) => {
                state.segment_bases = read_segment_bases(tid, &regs);
                state.gprs = Some(regs);
            }
            Err(err) => warn!(tid = tid.as_raw(), %err, "PTRACE_GETREGS failed"),
        }

        state.fpu = read_fpu(tid);
        state.debug_regs = read_debug_regs(tid);

        Ok(())
    }

    /// Write `state` back to the active thread: general-purpose registers
    /// and debug registers only. FP/SSE/XSAVE state is not written back
    /// (known limitation), and DR4/DR5 are never touched.
    pub fn set_state(&mut self, state: &CpuState) -> Result<()> {
        let tid = self.active_thread().ok_or(Error::NotAttached)?;

        if !self.threads().is_waited(tid) {
            return Err(Error::ThreadNotStopped { tid });
        }

        if let Some(regs) = &state.gprs {
            ptrace::set_regs(tid, regs)?;
        }

        if let Some(debug_regs) = &state.debug_regs {
            for dr in DebugRegister::REAL {
                ptrace::poke_user(tid, dr.user_offset(), debug_regs[dr.index()] as libc::c_long)?;
            }
        }

        Ok(())
    }
}

#[cfg(target_arch = "x86_64")]
fn read_segment_bases(_tid: Tid, regs: &Gprs) -> Option<SegmentBases> {
    // GETREGS already carries the bases on x86-64.
    Some(SegmentBases { fs_base: regs.fs_base as Address, gs_base: regs.gs_base as Address })
}

#[cfg(target_arch = "x86")]
fn read_segment_bases(tid: Tid, regs: &Gprs) -> Option<SegmentBases> {
    use crate::x86::LDT_ENTRY_SIZE;

    // The bases live in the thread area, indexed by the segment selectors.
    // Both must resolve or the bases are reported absent.
    let fs = ptrace::get_thread_area(tid, regs.xfs as usize / LDT_ENTRY_SIZE).ok()?;
    let gs = ptrace::get_thread_area(tid, regs.xgs as usize / LDT_ENTRY_SIZE).ok()?;

    Some(SegmentBases { fs_base: fs.base_addr as Address, gs_base: gs.base_addr as Address })
}

const XSAVE_BUF_LEN: usize = 4096;

// Fixed offsets of the XSAVE image (Intel SDM vol. 1, ch. 13).
const XSAVE_ST_OFFSET: usize = 32;
const XSAVE_XMM_OFFSET: usize = 160;
const XSAVE_HEADER_OFFSET: usize = 512;
const XSAVE_YMM_OFFSET: usize = 576;

const XSTATE_YMM: u64 = 1 << 2;

// Full XSTATE first; fall back to the classic FP requests when the regset
// is unavailable.
fn read_fpu(tid: Tid) -> Option<FpuState> {
    let mut xsave = [0u8; XSAVE_BUF_LEN];

    if let Ok(len) = ptrace::get_regset(tid, ptrace::NT_X86_XSTATE, &mut xsave) {
        if let Some(fpu) = parse_xsave(&xsave, len) {
            return Some(fpu);
        }
    }

    read_fpu_fallback(tid)
}

#[cfg(target_arch = "x86_64")]
fn read_fpu_fallback(tid: Tid) -> Option<FpuState> {
    // GETFPREGS carries the SSE state on x86-64.
    ptrace::get_fpregs(tid).ok().map(|fpregs| fpu_from_fpregs(&fpregs))
}

#[cfg(target_arch = "x86")]
fn read_fpu_fallback(tid: Tid) -> Option<FpuState> {
    // GETFPXREGS carries SSE; failing that (pre-SSE hardware), settle for
    // the bare i387 image.
    if let Ok(fpxregs) = ptrace::get_fpxregs(tid) {
        return Some(fpu_from_fpxregs(&fpxregs));
    }

    ptrace::get_fpregs(tid).ok().map(|fpregs| fpu_from_fpregs(&fpregs))
}

/// Parse an XSAVE image of `len` valid bytes. The legacy FXSAVE region is
/// required; extended parts are taken only when both the reported length
/// and the `xstate_bv` feature bits cover them.
fn parse_xsave(buf: &[u8], len: usize) -> Option<FpuState> {
    let len = len.min(buf.len());

    if len < XSAVE_HEADER_OFFSET {
        return None;
    }

    let mut fpu = FpuState {
        fcw: u16_at(buf, 0),
        fsw: u16_at(buf, 2),
        ftw: buf[4] as u16,
        fop: u16_at(buf, 6),
        mxcsr: u32_at(buf, 24),
        mxcsr_mask: u32_at(buf, 28),
        ..FpuState::default()
    };

    for (i, st) in fpu.st.iter_mut().enumerate() {
        let offset = XSAVE_ST_OFFSET + 16 * i;
        st.copy_from_slice(&buf[offset..offset + 16]);
    }

    for (i, xmm) in fpu.xmm.iter_mut().enumerate() {
        let offset = XSAVE_XMM_OFFSET + 16 * i;
        xmm.copy_from_slice(&buf[offset..offset + 16]);
    }

    if len >= XSAVE_HEADER_OFFSET + 8 {
        let xstate_bv = u64_at(buf, XSAVE_HEADER_OFFSET);

        if xstate_bv & XSTATE_YMM != 0 && len >= XSAVE_YMM_OFFSET + 16 * XMM_REG_COUNT {
            let mut ymm = [[0u8; 16]; XMM_REG_COUNT];
            for (i, reg) in ymm.iter_mut().enumerate() {
                let offset = XSAVE_YMM_OFFSET + 16 * i;
                reg.copy_from_slice(&buf[offset..offset + 16]);
            }
            fpu.ymm_high = Some(ymm);
        }
    }

    Some(fpu)
}

fn u16_at(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn u32_at(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn u64_at(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(target_arch = "x86_64")]
fn fpu_from_fpregs(fpregs: &libc::user_fpregs_struct) -> FpuState {
    let mut fpu = FpuState {
        fcw: fpregs.cwd,
        fsw: fpregs.swd,
        ftw: fpregs.ftw,
        fop: fpregs.fop,
        mxcsr: fpregs.mxcsr,
        mxcsr_mask: fpregs.mxcr_mask,
        ..FpuState::default()
    };

    copy_u32_words(&mut fpu.st, &fpregs.st_space);
    copy_u32_words(&mut fpu.xmm, &fpregs.xmm_space);

    fpu
}

#[cfg(target_arch = "x86_64")]
fn copy_u32_words(dst: &mut [[u8; 16]], src: &[u32]) {
    for (i, reg) in dst.iter_mut().enumerate() {
        for j in 0..4 {
            let Some(word) = src.get(i * 4 + j) else { return };
            reg[j * 4..(j + 1) * 4].copy_from_slice(&word.to_ne_bytes());
        }
    }
}

#[cfg(target_arch = "x86")]
fn fpu_from_fpxregs(fpxregs: &libc::user_fpxregs_struct) -> FpuState {
    let mut fpu = FpuState {
        fcw: fpxregs.cwd,
        fsw: fpxregs.swd,
        ftw: fpxregs.twd,
        fop: fpxregs.fop,
        mxcsr: fpxregs.mxcsr as u32,
        ..FpuState::default()
    };

    copy_long_words(&mut fpu.st, &fpxregs.st_space);
    copy_long_words(&mut fpu.xmm, &fpxregs.xmm_space);

    fpu
}

#[cfg(target_arch = "x86")]
fn fpu_from_fpregs(fpregs: &libc::user_fpregs_struct) -> FpuState {
    // The bare i387 image: packed 10-byte st registers, no SSE.
    let mut fpu = FpuState {
        fcw: fpregs.cwd as u16,
        fsw: fpregs.swd as u16,
        ftw: fpregs.twd as u16,
        ..FpuState::default()
    };

    let mut bytes = [0u8; 80];
    for (i, word) in fpregs.st_space.iter().enumerate() {
        bytes[i * 4..(i + 1) * 4].copy_from_slice(&(*word as u32).to_ne_bytes());
    }

    for (i, st) in fpu.st.iter_mut().enumerate() {
        st[..10].copy_from_slice(&bytes[i * 10..(i + 1) * 10]);
    }

    fpu
}

#[cfg(target_arch = "x86")]
fn copy_long_words(dst: &mut [[u8; 16]], src: &[libc::c_long]) {
    for (i, reg) in dst.iter_mut().enumerate() {
        for j in 0..4 {
            let Some(word) = src.get(i * 4 + j) else { return };
            reg[j * 4..(j + 1) * 4].copy_from_slice(&(*word as u32).to_ne_bytes());
        }
    }
}

fn read_debug_regs(tid: Tid) -> Option<[Address; 8]> {
    let mut regs = [0 as Address; 8];

    for dr in DebugRegister::REAL {
        match ptrace::peek_user(tid, dr.user_offset()) {
            Ok(word) => regs[dr.index()] = word as Address,
            Err(err) => {
                warn!(tid = tid.as_raw(), ?dr, %err, "could not read debug register");
                return None;
            }
        }
    }

    // DR4 and DR5 stay zero; the kernel hides the aliases.
    Some(regs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_xsave_legacy_area() {
        let mut buf = vec![0u8; 1024];
        buf[0..2].copy_from_slice(&0x037fu16.to_le_bytes());
        buf[2..4].copy_from_slice(&0x3800u16.to_le_bytes());
        buf[4] = 0x80; // abridged tag word
        buf[6..8].copy_from_slice(&0x07d5u16.to_le_bytes());
        buf[24..28].copy_from_slice(&0x1f80u32.to_le_bytes());
        buf[28..32].copy_from_slice(&0xffffu32.to_le_bytes());
        buf[XSAVE_ST_OFFSET] = 0xaa;
        buf[XSAVE_XMM_OFFSET] = 0xbb;
        // xstate_bv: x87 | SSE
        buf[512..520].copy_from_slice(&0b011u64.to_le_bytes());

        let fpu = parse_xsave(&buf, 576).unwrap();

        assert_eq!(fpu.fcw, 0x037f);
        assert_eq!(fpu.fsw, 0x3800);
        assert_eq!(fpu.ftw, 0x80);
        assert_eq!(fpu.fop, 0x07d5);
        assert_eq!(fpu.mxcsr, 0x1f80);
        assert_eq!(fpu.mxcsr_mask, 0xffff);
        assert_eq!(fpu.st[0][0], 0xaa);
        assert_eq!(fpu.xmm[0][0], 0xbb);
        assert!(fpu.ymm_high.is_none());
    }

    #[test]
    fn parses_ymm_when_flagged_and_covered() {
        let mut buf = vec![0u8; XSAVE_BUF_LEN];
        buf[512..520].copy_from_slice(&0b111u64.to_le_bytes());
        buf[XSAVE_YMM_OFFSET] = 0xcc;

        let fpu = parse_xsave(&buf, XSAVE_YMM_OFFSET + 16 * XMM_REG_COUNT).unwrap();

        let ymm = fpu.ymm_high.unwrap();
        assert_eq!(ymm[0][0], 0xcc);
    }

    #[test]
    fn respects_reported_length() {
        let mut buf = vec![0u8; XSAVE_BUF_LEN];
        buf[512..520].copy_from_slice(&0b111u64.to_le_bytes());

        // Legacy-only length: no header, no YMM.
        let fpu = parse_xsave(&buf, XSAVE_HEADER_OFFSET).unwrap();
        assert!(fpu.ymm_high.is_none());

        // Length covers YMM, but the feature bit is clear.
        buf[512..520].copy_from_slice(&0b011u64.to_le_bytes());
        let fpu = parse_xsave(&buf, buf.len()).unwrap();
        assert!(fpu.ymm_high.is_none());

        // Too short for even the legacy area.
        assert!(parse_xsave(&buf, 100).is_none());
    }

    #[test]
    fn cleared_state_has_nothing_present() {
        let mut state = CpuState::new();
        state.fpu = Some(FpuState::default());
        state.debug_regs = Some([0; 8]);

        state.clear();

        assert!(state.gprs.is_none());
        assert!(state.segment_bases.is_none());
        assert!(state.fpu.is_none());
        assert!(state.debug_regs.is_none());
        assert!(state.instruction_pointer().is_none());
    }
}
