// VM address-space layout and segment allocators.
//
// The VM owns one contiguous virtual-address reservation. Let B be the VM
// base, aligned to 2^35. The region is partitioned as:
//
//   user heap    [B - 16GB, B - 4GB)   Lua-visible objects
//   SPDS         [B - 2GB,  B)         short-lived per-data-structure scratch
//   system heap  [B,        B + 2GB)   structures, code blocks, metadata
//
// Only a PROT_NONE reservation is made up front (MAP_NORESERVE); the three
// segments are committed read-write lazily at creation. The user heap bump
// allocator grows *downward* from B - 4GB so that every live object stays
// inside the boxable window [B - 8GB, B - 4GB) of UserHeapPtr. The system
// heap grows upward from B + X_MINIMUM_VALID_HEAP_ADDRESS; offsets below
// that are never valid objects and double as tag constants.

use std::cell::Cell;
use std::ffi::c_void;

pub const X_VM_BASE_PTR_LOG2_ALIGNMENT: u32 = 35;

/// Offsets in [0, 64) are never valid heap objects. Small constants in this
/// range are used as pseudo hidden-class tags for non-table object kinds.
pub const X_MINIMUM_VALID_HEAP_ADDRESS: u32 = 64;

const GB: usize = 1 << 30;

const X_USER_HEAP_SIZE: usize = 12 * GB; // [B-16G, B-4G)
const X_USER_HEAP_END_OFFSET: isize = -4 * GB as isize;
const X_SPDS_SIZE: usize = 2 * GB; // [B-2G, B)
const X_SYSTEM_HEAP_SIZE: usize = 2 * GB; // [B, B+2G)

thread_local! {
    static ACTIVE_VM_BASE: Cell<usize> = const { Cell::new(0) };
}

/// Base pointer of the VM active on the current thread.
///
/// Every heap pointer kind dereferences relative to this. It is set for the
/// lifetime of a [`VmLayout`] and cleared on teardown.
#[inline(always)]
pub fn vm_base() -> usize {
    let base = ACTIVE_VM_BASE.with(|b| b.get());
    debug_assert!(base != 0, "no active VM on this thread");
    base
}

#[inline(always)]
pub fn has_active_vm() -> bool {
    ACTIVE_VM_BASE.with(|b| b.get()) != 0
}

/// The reserved VM region plus the three segment bump allocators.
pub struct VmLayout {
    map_start: usize,
    map_len: usize,
    base: usize,

    // User heap bump pointer: next allocation ends here and grows downward.
    user_heap_cur: usize,
    user_heap_limit: usize,

    // System heap bump pointer, grows upward.
    system_heap_cur: usize,
    system_heap_limit: usize,

    // SPDS scratch bump pointer, grows downward from B.
    spds_cur: usize,
    spds_limit: usize,
}

impl VmLayout {
    /// Reserves the VM region and installs this thread's VM base.
    ///
    /// Aborts on reservation failure: with no address space there is nothing
    /// sensible left to do (out-of-memory is fatal by contract).
    pub fn reserve() -> Box<VmLayout> {
        assert!(
            !has_active_vm(),
            "a VM is already active on this thread; destroy it first"
        );

        let alignment: usize = 1 << X_VM_BASE_PTR_LOG2_ALIGNMENT;
        // Enough slack that an aligned base with 16GB below and 2GB above
        // always exists inside the mapping.
        let map_len = alignment + 16 * GB + X_SYSTEM_HEAP_SIZE;

        let map_start = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if map_start == libc::MAP_FAILED {
            eprintln!("lunara: failed to reserve VM address space ({} bytes)", map_len);
            std::process::abort();
        }
        let map_start = map_start as usize;

        // Smallest aligned base with the full user heap inside the mapping.
        let base = (map_start + 16 * GB + alignment - 1) & !(alignment - 1);
        debug_assert!(base - 16 * GB >= map_start);
        debug_assert!(base + X_SYSTEM_HEAP_SIZE <= map_start + map_len);

        let commit = |addr: usize, len: usize| unsafe {
            let r = libc::mprotect(addr as *mut c_void, len, libc::PROT_READ | libc::PROT_WRITE);
            if r != 0 {
                eprintln!("lunara: failed to commit VM segment at {:#x}", addr);
                std::process::abort();
            }
        };
        commit(base - 16 * GB, X_USER_HEAP_SIZE);
        commit(base - X_SPDS_SIZE, X_SPDS_SIZE);
        commit(base, X_SYSTEM_HEAP_SIZE);

        tracing::debug!(
            base = format_args!("{:#x}", base),
            reserved = map_len,
            "reserved VM address space"
        );

        ACTIVE_VM_BASE.with(|b| b.set(base));

        Box::new(VmLayout {
            map_start,
            map_len,
            base,
            user_heap_cur: (base as isize + X_USER_HEAP_END_OFFSET) as usize,
            user_heap_limit: base - 16 * GB,
            system_heap_cur: base + X_MINIMUM_VALID_HEAP_ADDRESS as usize,
            system_heap_limit: base + X_SYSTEM_HEAP_SIZE,
            spds_cur: base,
            spds_limit: base - X_SPDS_SIZE,
        })
    }

    #[inline(always)]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Bump-allocates `size` bytes from the user heap, 8-byte aligned,
    /// growing downward. Returns the raw address.
    #[inline]
    pub fn alloc_from_user_heap(&mut self, size: usize) -> usize {
        let size = (size + 7) & !7;
        let next = self.user_heap_cur.checked_sub(size).unwrap_or(0);
        if next < self.user_heap_limit || next == 0 {
            eprintln!("lunara: user heap exhausted");
            std::process::abort();
        }
        self.user_heap_cur = next;
        next
    }

    /// Bump-allocates from the system heap, 8-byte aligned, growing upward.
    #[inline]
    pub fn alloc_from_system_heap(&mut self, size: usize) -> usize {
        let size = (size + 7) & !7;
        let addr = self.system_heap_cur;
        if addr + size > self.system_heap_limit {
            eprintln!("lunara: system heap exhausted");
            std::process::abort();
        }
        self.system_heap_cur = addr + size;
        addr
    }

    /// Bump-allocates scratch memory from the SPDS region (grows downward).
    /// Scratch lifetimes are managed by the owning data structure.
    #[inline]
    pub fn alloc_from_spds(&mut self, size: usize) -> usize {
        let size = (size + 7) & !7;
        let next = self.spds_cur - size;
        if next < self.spds_limit {
            eprintln!("lunara: SPDS region exhausted");
            std::process::abort();
        }
        self.spds_cur = next;
        next
    }
}

impl Drop for VmLayout {
    fn drop(&mut self) {
        ACTIVE_VM_BASE.with(|b| {
            if b.get() == self.base {
                b.set(0);
            }
        });
        unsafe {
            libc::munmap(self.map_start as *mut c_void, self.map_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_alignment() {
        let layout = VmLayout::reserve();
        assert_eq!(layout.base() % (1usize << X_VM_BASE_PTR_LOG2_ALIGNMENT), 0);
        assert_eq!(vm_base(), layout.base());
    }

    #[test]
    fn test_user_heap_grows_downward() {
        let mut layout = VmLayout::reserve();
        let a = layout.alloc_from_user_heap(24);
        let b = layout.alloc_from_user_heap(8);
        assert!(b < a);
        assert_eq!(a % 8, 0);
        assert_eq!(b % 8, 0);
        // Boxable window: [B-8G, B-4G)
        let base = layout.base();
        assert!(a >= base - 8 * (1 << 30) && a < base - 4 * (1 << 30));
    }

    #[test]
    fn test_system_heap_grows_upward() {
        let mut layout = VmLayout::reserve();
        let a = layout.alloc_from_system_heap(16);
        let b = layout.alloc_from_system_heap(16);
        assert!(b > a);
        assert!(a >= layout.base() + X_MINIMUM_VALID_HEAP_ADDRESS as usize);
    }
}
