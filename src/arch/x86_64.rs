use super::{write_word32, write_word64};
use crate::{relocate_error, Result};
use elf::abi::{
    EM_X86_64, R_X86_64_32, R_X86_64_32S, R_X86_64_64, R_X86_64_GLOB_DAT, R_X86_64_JUMP_SLOT,
    R_X86_64_NONE, R_X86_64_PC32, R_X86_64_RELATIVE, R_X86_64_TPOFF64,
};

pub(crate) const EM_ARCH: u16 = EM_X86_64;

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
        R_X86_64_NONE => Ok(()),
        R_X86_64_RELATIVE => {
            unsafe { write_word64(place, (load_bias as i64).wrapping_add(addend) as u64) };
            Ok(())
        }
        // TLS local-exec: no static TLS block is provisioned for the image,
        // so the write is S + A with a zero offset.
        R_X86_64_64 | R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT | R_X86_64_TPOFF64 => {
            unsafe { write_word64(place, (sym_value as i64).wrapping_add(addend) as u64) };
            Ok(())
        }
        R_X86_64_32 => {
            let value = (sym_value as i64).wrapping_add(addend);
            if !(0..=u32::MAX as i64).contains(&value) {
                return Err(relocate_error(format!(
                    "x86_64 32 relocation overflow: value={value}"
                )));
            }
            unsafe { write_word32(place, value as u32) };
            Ok(())
        }
        R_X86_64_32S => {
            let value = (sym_value as i64).wrapping_add(addend);
            if !(i32::MIN as i64..=i32::MAX as i64).contains(&value) {
                return Err(relocate_error(format!(
                    "x86_64 32S relocation overflow: value={value}"
                )));
            }
            unsafe { write_word32(place, value as i32 as u32) };
            Ok(())
        }
        R_X86_64_PC32 => {
            let value = (sym_value as i64)
                .wrapping_add(addend)
                .wrapping_sub(place as i64);
            if !(i32::MIN as i64..=i32::MAX as i64).contains(&value) {
                return Err(relocate_error(format!(
                    "x86_64 PC32 relocation overflow: value={value}"
                )));
            }
            unsafe { write_word32(place, value as i32 as u32) };
            Ok(())
        }
        other => Err(relocate_error(format!(
            "unsupported x86_64 relocation type: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn place_of(buf: &mut [u8; 16]) -> usize {
        buf.as_mut_ptr() as usize
    }

    #[test]
    fn relative_writes_bias_plus_addend() {
        let mut buf = [0u8; 16];
        let place = place_of(&mut buf);
        unsafe { apply_relocation(R_X86_64_RELATIVE, place, 0x7000_0000, 0, 0x40) }.unwrap();
        assert_eq!(u64::from_le_bytes(buf[..8].try_into().unwrap()), 0x7000_0040);
    }

    #[test]
    fn glob_dat_writes_symbol_plus_addend() {
        let mut buf = [0u8; 16];
        let place = place_of(&mut buf);
        unsafe { apply_relocation(R_X86_64_GLOB_DAT, place, 0, 0x1234_5678, 8) }.unwrap();
        assert_eq!(u64::from_le_bytes(buf[..8].try_into().unwrap()), 0x1234_5680);
    }

    #[test]
    fn pc32_is_relative_to_place() {
        let mut buf = [0u8; 16];
        let place = place_of(&mut buf);
        unsafe { apply_relocation(R_X86_64_PC32, place, 0, place + 0x100, 0) }.unwrap();
        assert_eq!(u32::from_le_bytes(buf[..4].try_into().unwrap()), 0x100);
    }

    #[test]
    fn narrow_relocations_reject_overflow() {
        let mut buf = [0u8; 16];
        let place = place_of(&mut buf);
        let err = unsafe { apply_relocation(R_X86_64_32, place, 0, usize::MAX, 0) }.unwrap_err();
        assert!(matches!(err, crate::Error::RelocationFailure { .. }));
        let err =
            unsafe { apply_relocation(R_X86_64_32S, place, 0, 0x1_0000_0000, 0) }.unwrap_err();
        assert!(matches!(err, crate::Error::RelocationFailure { .. }));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut buf = [0u8; 16];
        let place = place_of(&mut buf);
        let err = unsafe { apply_relocation(0xffff, place, 0, 0, 0) }.unwrap_err();
        assert!(matches!(err, crate::Error::RelocationFailure { .. }));
    }
}
