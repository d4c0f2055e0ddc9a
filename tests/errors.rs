mod common;

use common::init_logger;
use reflektor::{Error, Library};
use rstest::rstest;

#[rstest]
fn empty_image_is_rejected() {
    init_logger();
    let err = Library::load(&[]).unwrap_err();
    assert!(matches!(err, Error::EmptyImage));
}

#[rstest]
fn garbage_is_not_a_recognized_format() {
    init_logger();
    let err = Library::load(b"this is not a shared library").unwrap_err();
    assert!(matches!(err, Error::UnsupportedFormat));
}

#[rstest]
fn single_byte_image_is_not_a_recognized_format() {
    init_logger();
    let err = Library::load(b"x").unwrap_err();
    assert!(matches!(err, Error::UnsupportedFormat));
}

#[cfg(target_os = "linux")]
mod elf_headers {
    use super::*;

    #[cfg(target_arch = "x86_64")]
    const HOST_MACHINE: u16 = 62; // EM_X86_64
    #[cfg(target_arch = "x86")]
    const HOST_MACHINE: u16 = 3; // EM_386
    #[cfg(target_arch = "aarch64")]
    const HOST_MACHINE: u16 = 183; // EM_AARCH64

    const FOREIGN_MACHINE: u16 = if HOST_MACHINE == 62 { 183 } else { 62 };

    const ET_REL: u16 = 1;
    const ET_EXEC: u16 = 2;
    const ET_DYN: u16 = 3;

    /// A syntactically valid ELF header for the host word size, with no
    /// program or section headers behind it.
    fn minimal_elf_header(machine: u16, file_type: u16) -> Vec<u8> {
        #[cfg(target_pointer_width = "64")]
        {
            let mut header = vec![0u8; 64];
            header[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
            header[4] = 2; // ELFCLASS64
            header[5] = 1; // ELFDATA2LSB
            header[6] = 1; // EV_CURRENT
            header[16..18].copy_from_slice(&file_type.to_le_bytes());
            header[18..20].copy_from_slice(&machine.to_le_bytes());
            header[20..24].copy_from_slice(&1u32.to_le_bytes());
            header[52..54].copy_from_slice(&64u16.to_le_bytes()); // e_ehsize
            header[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
            header[58..60].copy_from_slice(&64u16.to_le_bytes()); // e_shentsize
            header
        }
        #[cfg(target_pointer_width = "32")]
        {
            let mut header = vec![0u8; 52];
            header[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
            header[4] = 1; // ELFCLASS32
            header[5] = 1; // ELFDATA2LSB
            header[6] = 1; // EV_CURRENT
            header[16..18].copy_from_slice(&file_type.to_le_bytes());
            header[18..20].copy_from_slice(&machine.to_le_bytes());
            header[20..24].copy_from_slice(&1u32.to_le_bytes());
            header[40..42].copy_from_slice(&52u16.to_le_bytes()); // e_ehsize
            header[42..44].copy_from_slice(&32u16.to_le_bytes()); // e_phentsize
            header[46..48].copy_from_slice(&40u16.to_le_bytes()); // e_shentsize
            header
        }
    }

    #[rstest]
    fn foreign_machine_is_rejected() {
        init_logger();
        let image = minimal_elf_header(FOREIGN_MACHINE, ET_DYN);
        let err = Library::load(&image).unwrap_err();
        let Error::ForeignPlatform { provided, expected } = err else {
            panic!("expected ForeignPlatform, got {err:?}");
        };
        assert!(provided.starts_with("EM_"));
        assert_ne!(provided, expected);
    }

    #[rstest]
    fn machine_check_precedes_type_check() {
        init_logger();
        let image = minimal_elf_header(FOREIGN_MACHINE, ET_EXEC);
        let err = Library::load(&image).unwrap_err();
        assert!(matches!(err, Error::ForeignPlatform { .. }));
    }

    #[rstest]
    fn executables_are_rejected() {
        init_logger();
        let image = minimal_elf_header(HOST_MACHINE, ET_EXEC);
        let err = Library::load(&image).unwrap_err();
        assert!(matches!(err, Error::MalformedImage { .. }));
    }

    #[rstest]
    fn relocatable_objects_are_rejected() {
        init_logger();
        let image = minimal_elf_header(HOST_MACHINE, ET_REL);
        let err = Library::load(&image).unwrap_err();
        assert!(matches!(err, Error::MalformedImage { .. }));
    }

    #[rstest]
    fn image_without_loadable_segments_is_rejected() {
        init_logger();
        let image = minimal_elf_header(HOST_MACHINE, ET_DYN);
        let err = Library::load(&image).unwrap_err();
        assert!(matches!(err, Error::MalformedImage { .. }));
    }

    #[rstest]
    fn truncated_header_is_unsupported() {
        init_logger();
        let image = &minimal_elf_header(HOST_MACHINE, ET_DYN)[..20];
        let err = Library::load(image).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat));
    }

    #[rstest]
    fn nul_in_export_name_is_rejected() {
        init_logger();
        let Some(bytes) = common::basic_fixture() else {
            eprintln!("skipping: test fixture not built (no C compiler?)");
            return;
        };
        let library = Library::load(&bytes).unwrap();
        let err = library.call_export("Start\0W").unwrap_err();
        assert!(matches!(err, Error::MalformedImage { .. }));
        let err = library.call_export("   ").unwrap_err();
        assert!(matches!(err, Error::EmptyExportName));
    }
}
