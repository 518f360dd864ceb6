//! Loaded-module enumeration via the dynamic linker's `r_debug` chain.

use std::collections::BTreeSet;
use std::mem;

use crate::process::ProcessMemory;
use crate::Address;

/// Locates the tracee's `r_debug` structure. Implemented by an external
/// binary-info provider; the core only dereferences the pointer.
pub trait BinaryInfo {
    /// Address of `r_debug` in tracee memory, if the binary advertises one
    /// (via `DT_DEBUG`).
    fn debug_pointer(&self) -> Option<Address>;
}

/// A mapped memory region, as reported by an external region provider. Used
/// only by the fallback path when the linker chain yields nothing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Region {
    pub start: Address,
    pub end: Address,
    pub name: String,
}

pub trait RegionProvider {
    fn regions(&self) -> Vec<Region>;
}

/// A loaded module: executable or shared object.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Module {
    pub name: String,
    pub base: Address,
}

// Mirrors `struct r_debug` from <link.h>; pointers as machine words.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct RDebug {
    r_version: libc::c_int,
    r_map: Address,
    r_brk: Address,
    r_state: libc::c_int,
    r_ldbase: Address,
}

// Mirrors the public head of `struct link_map` from <link.h>.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct LinkMap {
    l_addr: Address,
    l_name: Address,
    l_ld: Address,
    l_next: Address,
    l_prev: Address,
}

// A corrupt chain can cycle; cap the walk.
const MAX_CHAIN_LENGTH: usize = 4096;

fn read_struct<T: Copy>(memory: &dyn ProcessMemory, address: Address) -> Option<T> {
    let mut data = mem::MaybeUninit::<T>::zeroed();

    let buf = unsafe {
        std::slice::from_raw_parts_mut(data.as_mut_ptr() as *mut u8, mem::size_of::<T>())
    };

    if memory.read_bytes(address, buf) {
        Some(unsafe { data.assume_init() })
    } else {
        None
    }
}

// NUL-terminate defensively: a name that fills the whole buffer is clamped.
fn name_from_bytes(buf: &[u8]) -> String {
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());

    String::from_utf8_lossy(&buf[..len]).into_owned()
}

/// Walk the `link_map` chain rooted at the `r_debug` structure found at
/// `debug_pointer`, emitting one module per entry with a non-zero load
/// address. Unreadable names become empty strings; an unreadable entry ends
/// the walk.
pub fn modules_from_link_map(memory: &dyn ProcessMemory, debug_pointer: Address) -> Vec<Module> {
    let mut modules = Vec::new();

    let r_debug = match read_struct::<RDebug>(memory, debug_pointer) {
        Some(r_debug) => r_debug,
        None => return modules,
    };

    let mut link_address = r_debug.r_map;

    for _ in 0..MAX_CHAIN_LENGTH {
        if link_address == 0 {
            break;
        }

        let map = match read_struct::<LinkMap>(memory, link_address) {
            Some(map) => map,
            None => break,
        };

        let mut path = [0u8; libc::PATH_MAX as usize];
        if !memory.read_bytes(map.l_name, &mut path) {
            path[0] = 0;
        }

        if map.l_addr != 0 {
            modules.push(Module { name: name_from_bytes(&path), base: map.l_addr });
        }

        link_address = map.l_next;
    }

    modules
}

/// Fallback: one module per distinct region whose name is an absolute path.
pub fn modules_from_regions(regions: &[Region]) -> Vec<Module> {
    let mut modules = Vec::new();
    let mut found = BTreeSet::new();

    for region in regions {
        if region.name.starts_with('/') && found.insert(region.name.clone()) {
            modules.push(Module { name: region.name.clone(), base: region.start });
        }
    }

    modules
}

#[cfg(test)]
mod tests {
    use super::*;

    // Flat fake of tracee memory for exercising the chain walk.
    struct FakeMemory {
        base: Address,
        bytes: Vec<u8>,
    }

    impl FakeMemory {
        fn new(base: Address, size: usize) -> Self {
            Self { base, bytes: vec![0; size] }
        }

        fn write_struct<T: Copy>(&mut self, address: Address, value: &T) {
            let offset = address - self.base;
            let raw = unsafe {
                std::slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>())
            };
            self.bytes[offset..offset + raw.len()].copy_from_slice(raw);
        }

        fn write_str(&mut self, address: Address, value: &str) {
            let offset = address - self.base;
            self.bytes[offset..offset + value.len()].copy_from_slice(value.as_bytes());
            self.bytes[offset + value.len()] = 0;
        }
    }

    impl ProcessMemory for FakeMemory {
        fn read_bytes(&self, address: Address, buf: &mut [u8]) -> bool {
            let Some(offset) = address.checked_sub(self.base) else { return false };
            let Some(end) = offset.checked_add(buf.len()) else { return false };
            if end > self.bytes.len() {
                return false;
            }

            buf.copy_from_slice(&self.bytes[offset..end]);
            true
        }
    }

    const BASE: Address = 0x10000;

    fn chain_fixture() -> FakeMemory {
        let mut memory = FakeMemory::new(BASE, 0x4000);

        let r_debug_at = BASE;
        let map0_at = BASE + 0x100;
        let map1_at = BASE + 0x200;
        let map2_at = BASE + 0x300;
        let name0_at = BASE + 0x1000;
        let name2_at = BASE + 0x1100;

        memory.write_struct(
            r_debug_at,
            &RDebug { r_version: 1, r_map: map0_at, r_brk: 0, r_state: 0, r_ldbase: 0 },
        );

        memory.write_struct(
            map0_at,
            &LinkMap {
                l_addr: 0x7f00_0000,
                l_name: name0_at,
                l_ld: 0,
                l_next: map1_at,
                l_prev: 0,
            },
        );
        memory.write_str(name0_at, "/usr/lib/libc.so.6");

        // The main executable reports l_addr == 0 and is skipped.
        memory.write_struct(
            map1_at,
            &LinkMap { l_addr: 0, l_name: 0, l_ld: 0, l_next: map2_at, l_prev: map0_at },
        );

        memory.write_struct(
            map2_at,
            &LinkMap { l_addr: 0x20000, l_name: name2_at, l_ld: 0, l_next: 0, l_prev: map1_at },
        );
        memory.write_str(name2_at, "/usr/lib/ld-linux.so.2");

        memory
    }

    #[test]
    fn walks_the_link_map_chain() {
        let memory = chain_fixture();
        let modules = modules_from_link_map(&memory, BASE);

        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].name, "/usr/lib/libc.so.6");
        assert_eq!(modules[0].base, 0x7f00_0000);
        assert_eq!(modules[1].name, "/usr/lib/ld-linux.so.2");
        assert_eq!(modules[1].base, 0x20000);
    }

    #[test]
    fn unreadable_debug_pointer_yields_nothing() {
        let memory = chain_fixture();

        assert!(modules_from_link_map(&memory, 0xdead0000).is_empty());
    }

    #[test]
    fn unreadable_name_becomes_empty() {
        let mut memory = chain_fixture();

        // Point the first entry's name outside the fake address space.
        let map0_at = BASE + 0x100;
        memory.write_struct(
            map0_at,
            &LinkMap { l_addr: 0x30000, l_name: 0xdead0000, l_ld: 0, l_next: 0, l_prev: 0 },
        );

        let modules = modules_from_link_map(&memory, BASE);
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].name, "");
        assert_eq!(modules[0].base, 0x30000);
    }

    #[test]
    fn region_fallback_keeps_absolute_paths_once() {
        let regions = vec![
            Region { start: 0x400000, end: 0x401000, name: "/bin/app".into() },
            Region { start: 0x401000, end: 0x402000, name: "/bin/app".into() },
            Region { start: 0x500000, end: 0x501000, name: "[heap]".into() },
            Region { start: 0x600000, end: 0x601000, name: String::new() },
            Region { start: 0x700000, end: 0x701000, name: "/lib/libm.so".into() },
        ];

        let modules = modules_from_regions(&regions);

        assert_eq!(
            modules,
            vec![
                Module { name: "/bin/app".into(), base: 0x400000 },
                Module { name: "/lib/libm.so".into(), base: 0x700000 },
            ]
        );
    }
}
