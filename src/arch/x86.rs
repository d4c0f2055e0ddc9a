use super::write_word32;
use crate::{relocate_error, Result};
use elf::abi::{
    EM_386, R_386_32, R_386_32PLT, R_386_GLOB_DAT, R_386_JMP_SLOT, R_386_NONE, R_386_PC32,
    R_386_RELATIVE, R_386_TLS_TPOFF,
};

pub(crate) const EM_ARCH: u16 = EM_386;

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
        R_386_NONE => Ok(()),
        R_386_RELATIVE => {
            unsafe { write_word32(place, (load_bias as i64).wrapping_add(addend) as u32) };
            Ok(())
        }
        R_386_GLOB_DAT | R_386_JMP_SLOT => {
            unsafe { write_word32(place, sym_value as u32) };
            Ok(())
        }
        // TLS local-exec with no static TLS block provisioned: S + A.
        R_386_32 | R_386_32PLT | R_386_TLS_TPOFF => {
            unsafe { write_word32(place, (sym_value as i64).wrapping_add(addend) as u32) };
            Ok(())
        }
        R_386_PC32 => {
            let value = (sym_value as i64)
                .wrapping_add(addend)
                .wrapping_sub(place as i64);
            if !(i32::MIN as i64..=i32::MAX as i64).contains(&value) {
                return Err(relocate_error(format!(
                    "386 PC32 relocation overflow: value={value}"
                )));
            }
            unsafe { write_word32(place, value as i32 as u32) };
            Ok(())
        }
        other => Err(relocate_error(format!(
            "unsupported 386 relocation type: {other}"
        ))),
    }
}
