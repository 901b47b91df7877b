// Store barrier contract.
//
// Any store of a heap-pointer-carrying value into a heap object must be
// followed by `write_barrier(container)`. The fast path exits when the
// container's cell state is non-zero (not Black); the slow path re-colors
// the container so the external collector will revisit it. Collection
// itself is an external collaborator; only the barrier contract lives here.

use super::gc_header::GcCellState;

/// # Safety
/// `cell_state_ptr` must point at the `cell_state` byte of a live heap
/// object header.
#[inline(always)]
pub unsafe fn write_barrier_at(cell_state_ptr: *mut u8) {
    let cell_state = *cell_state_ptr;
    if cell_state > GcCellState::Black as u8 {
        return;
    }
    write_barrier_slow_path(cell_state_ptr);
}

#[cold]
#[inline(never)]
unsafe fn write_barrier_slow_path(cell_state_ptr: *mut u8) {
    // A black object received a new child: revert it to white and hand it
    // back to the collector for remark.
    *cell_state_ptr = GcCellState::White as u8;
    tracing::trace!(
        object = format_args!("{:p}", cell_state_ptr),
        "write barrier slow path: container queued for remark"
    );
}

/// Barrier over a user-heap object given its header address.
///
/// # Safety
/// `object_addr` must be the address of a live user-heap object.
#[inline(always)]
pub unsafe fn write_barrier_user(object_addr: usize) {
    // cell_state lives at byte 5 of the user-heap header.
    write_barrier_at((object_addr + 5) as *mut u8);
}

/// Barrier over a system-heap object given its header address.
///
/// # Safety
/// `object_addr` must be the address of a live system-heap object.
#[inline(always)]
pub unsafe fn write_barrier_system(object_addr: usize) {
    // cell_state lives at byte 1 of the system-heap header.
    write_barrier_at((object_addr + 1) as *mut u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barrier_recolors_black() {
        let mut cell: u8 = GcCellState::Black as u8;
        unsafe { write_barrier_at(&mut cell) };
        assert_eq!(cell, GcCellState::White as u8);
    }

    #[test]
    fn test_barrier_fast_path_leaves_white() {
        let mut cell: u8 = GcCellState::White as u8;
        unsafe { write_barrier_at(&mut cell) };
        assert_eq!(cell, GcCellState::White as u8);
    }
}
