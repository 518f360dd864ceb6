//! x86 / x86-64 target specifics: debug registers, canonical register
//! names, pointer formatting, and CPU feature probing.

use std::mem;

use crate::Address;

/// Debug registers control and report processor debug state. Accessing them
/// directly is privileged, but a tracee's debug registers are reachable
/// through the `PEEKUSER`/`POKEUSER` offsets of the virtual `user` struct.
///
/// See: Intel SDM, Vol. 3, 17.2
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DebugRegister {
    /// Debug address register 0.
    Dr0 = 0,

    /// Debug address register 1.
    Dr1,

    /// Debug address register 2.
    Dr2,

    /// Debug address register 3.
    Dr3,

    /// Reserved alias, hidden by the kernel. Always reads as zero here.
    Dr4,

    /// Reserved alias, hidden by the kernel. Always reads as zero here.
    Dr5,

    /// Debug status register.
    Dr6,

    /// Debug control register.
    Dr7,
}

impl DebugRegister {
    /// The data/status/control registers the kernel exposes; DR4 and DR5 are
    /// aliases and never touched.
    pub const REAL: [DebugRegister; 6] = [
        DebugRegister::Dr0,
        DebugRegister::Dr1,
        DebugRegister::Dr2,
        DebugRegister::Dr3,
        DebugRegister::Dr6,
        DebugRegister::Dr7,
    ];

    /// Byte offset of this register in the virtual `user` struct.
    pub(crate) fn user_offset(self) -> usize {
        memoffset::offset_of!(libc::user, u_debugreg)
            + mem::size_of::<libc::c_long>() * self as usize
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Target ABI of the tracee (and of this build; cross-tracing is out of
/// scope).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CpuType {
    X86,
    X86_64,
}

pub fn cpu_type() -> CpuType {
    #[cfg(target_arch = "x86_64")]
    return CpuType::X86_64;

    #[cfg(target_arch = "x86")]
    return CpuType::X86;
}

/// Instruction set extensions the upper layer can ask about.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Extension {
    Mmx,
    Xmm,
}

/// Whether the host CPU supports `extension`. Any CPU that can run x86-64
/// code has both; on x86-32 the answer comes from `CPUID.01H:EDX`.
#[cfg(target_arch = "x86_64")]
pub fn has_extension(extension: Extension) -> bool {
    match extension {
        Extension::Mmx | Extension::Xmm => true,
    }
}

/// Whether the host CPU supports `extension`. Any CPU that can run x86-64
/// code has both; on x86-32 the answer comes from `CPUID.01H:EDX`.
#[cfg(target_arch = "x86")]
pub fn has_extension(extension: Extension) -> bool {
    const BIT_MMX: u32 = 1 << 23;
    const BIT_SSE: u32 = 1 << 25;

    let edx = unsafe { core::arch::x86::__cpuid(1) }.edx;

    match extension {
        Extension::Mmx => edx & BIT_MMX != 0,
        Extension::Xmm => edx & BIT_SSE != 0,
    }
}

/// Canonical name of the instruction pointer register.
#[cfg(target_arch = "x86_64")]
pub const INSTRUCTION_POINTER: &str = "rip";
#[cfg(target_arch = "x86")]
pub const INSTRUCTION_POINTER: &str = "eip";

/// Canonical name of the stack pointer register.
#[cfg(target_arch = "x86_64")]
pub const STACK_POINTER: &str = "rsp";
#[cfg(target_arch = "x86")]
pub const STACK_POINTER: &str = "esp";

/// Canonical name of the frame pointer register.
#[cfg(target_arch = "x86_64")]
pub const FRAME_POINTER: &str = "rbp";
#[cfg(target_arch = "x86")]
pub const FRAME_POINTER: &str = "ebp";

/// Canonical name of the flags register.
#[cfg(target_arch = "x86_64")]
pub const FLAGS_REGISTER: &str = "rflags";
#[cfg(target_arch = "x86")]
pub const FLAGS_REGISTER: &str = "eflags";

/// Render an address as fixed-width lowercase hex: 16 digits on x86-64,
/// 8 on x86-32.
pub fn format_pointer(address: Address) -> String {
    #[cfg(target_arch = "x86_64")]
    return format!("{address:016x}");

    #[cfg(target_arch = "x86")]
    return format!("{address:08x}");
}

/// Size of one LDT entry; segment selector values are scaled by it to index
/// the thread area.
#[cfg(target_arch = "x86")]
pub const LDT_ENTRY_SIZE: usize = 8;

/// Kernel `user_desc`, from `<asm/ldt.h>`. The trailing bitfields collapse
/// into one flags word.
#[cfg(target_arch = "x86")]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct UserDesc {
    pub entry_number: u32,
    pub base_addr: u32,
    pub limit: u32,
    pub flags: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_width_matches_abi() {
        let formatted = format_pointer(0x1234);

        match cpu_type() {
            CpuType::X86_64 => assert_eq!(formatted, "0000000000001234"),
            CpuType::X86 => assert_eq!(formatted, "00001234"),
        }

        assert_eq!(formatted.len(), 2 * mem::size_of::<Address>());
    }

    #[test]
    fn register_names_match_abi() {
        match cpu_type() {
            CpuType::X86_64 => {
                assert_eq!(INSTRUCTION_POINTER, "rip");
                assert_eq!(STACK_POINTER, "rsp");
                assert_eq!(FRAME_POINTER, "rbp");
                assert_eq!(FLAGS_REGISTER, "rflags");
            }
            CpuType::X86 => {
                assert_eq!(INSTRUCTION_POINTER, "eip");
                assert_eq!(STACK_POINTER, "esp");
                assert_eq!(FRAME_POINTER, "ebp");
                assert_eq!(FLAGS_REGISTER, "eflags");
            }
        }
    }

    #[test]
    fn debug_register_offsets_are_word_spaced() {
        let base = DebugRegister::Dr0.user_offset();

        for dr in DebugRegister::REAL {
            let offset = dr.user_offset();
            assert_eq!(offset, base + dr.index() * mem::size_of::<libc::c_long>());
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn x86_64_always_has_mmx_and_sse() {
        assert!(has_extension(Extension::Mmx));
        assert!(has_extension(Extension::Xmm));
    }
}
