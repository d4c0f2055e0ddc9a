use super::write_word64;
use crate::{relocate_error, Result};
use elf::abi::{
    EM_AARCH64, R_AARCH64_ABS64, R_AARCH64_GLOB_DAT, R_AARCH64_JUMP_SLOT, R_AARCH64_NONE,
    R_AARCH64_RELATIVE, R_AARCH64_TLS_TPREL,
};

pub(crate) const EM_ARCH: u16 = EM_AARCH64;

/// Apply one dynamic relocation.
///
/// # Safety
/// `place` must point at a relocation target word inside the image
/// mapping; the caller has bounds-checked it.
pub(crate) unsafe fn apply_relocation(
    rel_type: u32,
    place: usize,
    load_bias: usize,
    sym_value: usize,
    addend: i64,
) -> Result<()> {
    match rel_type {
        R_AARCH64_NONE => Ok(()),
        R_AARCH64_RELATIVE => {
            unsafe { write_word64(place, (load_bias as i64).wrapping_add(addend) as u64) };
            Ok(())
        }
        // TLS local-exec with no static TLS block provisioned: S + A.
        R_AARCH64_ABS64 | R_AARCH64_GLOB_DAT | R_AARCH64_JUMP_SLOT | R_AARCH64_TLS_TPREL => {
            unsafe { write_word64(place, (sym_value as i64).wrapping_add(addend) as u64) };
            Ok(())
        }
        other => Err(relocate_error(format!(
            "unsupported aarch64 relocation type: {other}"
        ))),
    }
}
