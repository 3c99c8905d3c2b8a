//! First-fit CU and slot allocation.

use kds_core::MASK_BITS;

use crate::bitset::Bitset;
use crate::error::AllocError;

/// Lowest index set in `requested` that is valid and not busy.
///
/// Words of the request are scanned in order, so ties always break toward
/// the lowest absolute index. `NoValidResource` means no requested index is
/// valid at all; `Exhausted` means some are valid but all are busy.
pub fn find_free_resource(
    requested: &[u32],
    valid: &Bitset,
    busy: &Bitset,
) -> Result<usize, AllocError> {
    let mut any_valid = false;
    for (w, &req) in requested.iter().enumerate() {
        let candidates = req & valid.word(w);
        if candidates == 0 {
            continue;
        }
        any_valid = true;
        let free = candidates & !busy.word(w);
        if free != 0 {
            return Ok(w * MASK_BITS + free.trailing_zeros() as usize);
        }
    }
    if any_valid {
        Err(AllocError::Exhausted)
    } else {
        Err(AllocError::NoValidResource)
    }
}

/// Reserve the lowest free slot.
pub fn acquire_slot(slots: &mut Bitset) -> Result<usize, AllocError> {
    if slots.is_empty() {
        return Err(AllocError::NoValidResource);
    }
    let idx = slots.first_free().ok_or(AllocError::Exhausted)?;
    slots.set(idx);
    Ok(idx)
}

pub fn release_slot(slots: &mut Bitset, idx: usize) {
    slots.clear(idx);
}
