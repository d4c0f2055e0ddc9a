mod common;

use common::{basic_fixture, init_logger, marker_env_lock};
use reflektor::{Error, Library};
use rstest::rstest;
use std::path::PathBuf;

fn unique_marker_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("reflektor_test_{tag}_{}.txt", std::process::id()))
}

#[cfg(any(target_os = "linux", windows))]
mod native {
    use super::*;

    #[rstest]
    fn call_export_honours_marker_override() {
        init_logger();
        let Some(bytes) = basic_fixture() else {
            eprintln!("skipping: test fixture not built (no C compiler?)");
            return;
        };
        let _env = marker_env_lock();
        let marker = unique_marker_path("override");
        let _ = std::fs::remove_file(&marker);
        std::env::set_var("REFLEKTOR_MARKER", &marker);

        let library = Library::load(&bytes).unwrap();
        library.call_export("StartW").unwrap();
        std::env::remove_var("REFLEKTOR_MARKER");

        let got = std::fs::read(&marker).unwrap();
        assert_eq!(got, b"ok");
        let _ = std::fs::remove_file(&marker);
        library.free();
    }

    #[rstest]
    fn call_export_falls_back_to_default_marker() {
        init_logger();
        let Some(bytes) = basic_fixture() else {
            eprintln!("skipping: test fixture not built (no C compiler?)");
            return;
        };
        let _env = marker_env_lock();
        std::env::remove_var("REFLEKTOR_MARKER");
        #[cfg(unix)]
        let default_marker = PathBuf::from("/tmp/reflektor_marker.txt");
        #[cfg(windows)]
        let default_marker = PathBuf::from("C:\\Windows\\Temp\\reflektor_marker.txt");
        let _ = std::fs::remove_file(&default_marker);

        let library = Library::load(&bytes).unwrap();
        library.call_export("StartW").unwrap();

        let got = std::fs::read(&default_marker).unwrap();
        assert_eq!(got, b"ok");
        let _ = std::fs::remove_file(&default_marker);
    }

    #[rstest]
    fn underscore_variant_resolves() {
        init_logger();
        let Some(bytes) = basic_fixture() else {
            eprintln!("skipping: test fixture not built (no C compiler?)");
            return;
        };
        let _env = marker_env_lock();
        let marker = unique_marker_path("underscore");
        std::env::set_var("REFLEKTOR_MARKER", &marker);

        let library = Library::load(&bytes).unwrap();
        // `_StartW` is not in the export table; the stripped variant is.
        library.call_export("_StartW").unwrap();
        std::env::remove_var("REFLEKTOR_MARKER");
        let _ = std::fs::remove_file(&marker);
    }

    #[rstest]
    fn whitespace_is_trimmed_from_export_names() {
        init_logger();
        let Some(bytes) = basic_fixture() else {
            eprintln!("skipping: test fixture not built (no C compiler?)");
            return;
        };
        let _env = marker_env_lock();
        let marker = unique_marker_path("trim");
        std::env::set_var("REFLEKTOR_MARKER", &marker);

        let library = Library::load(&bytes).unwrap();
        library.call_export("  StartW \t").unwrap();
        std::env::remove_var("REFLEKTOR_MARKER");
        let _ = std::fs::remove_file(&marker);
    }

    #[rstest]
    fn missing_export_is_reported() {
        init_logger();
        let Some(bytes) = basic_fixture() else {
            eprintln!("skipping: test fixture not built (no C compiler?)");
            return;
        };
        let library = Library::load(&bytes).unwrap();
        let err = library.call_export("NoSuchExport").unwrap_err();
        assert!(matches!(err, Error::ExportNotFound { name } if name == "NoSuchExport"));
    }

    #[rstest]
    fn free_is_idempotent_and_closes_the_library() {
        init_logger();
        let Some(bytes) = basic_fixture() else {
            eprintln!("skipping: test fixture not built (no C compiler?)");
            return;
        };
        let library = Library::load(&bytes).unwrap();
        library.free();
        library.free();
        let err = library.call_export("StartW").unwrap_err();
        assert!(matches!(err, Error::LibraryClosed));
    }

    #[rstest]
    fn concurrent_calls_share_the_library() {
        init_logger();
        let Some(bytes) = basic_fixture() else {
            eprintln!("skipping: test fixture not built (no C compiler?)");
            return;
        };
        let _env = marker_env_lock();
        let marker = unique_marker_path("concurrent");
        std::env::set_var("REFLEKTOR_MARKER", &marker);

        let library = std::sync::Arc::new(Library::load(&bytes).unwrap());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let library = library.clone();
                std::thread::spawn(move || library.call_export("StartW"))
            })
            .collect();
        for worker in workers {
            worker.join().unwrap().unwrap();
        }
        std::env::remove_var("REFLEKTOR_MARKER");
        let _ = std::fs::remove_file(&marker);
    }

    #[rstest]
    fn load_from_path_reads_and_loads() {
        init_logger();
        let path = common::fixture_path(common::BASIC_FIXTURE);
        if !path.exists() {
            eprintln!("skipping: test fixture not built (no C compiler?)");
            return;
        }
        let _env = marker_env_lock();
        let marker = unique_marker_path("from_path");
        std::env::set_var("REFLEKTOR_MARKER", &marker);

        let library = Library::load_from_path(&path).unwrap();
        library.call_export("StartWStatus").unwrap();
        std::env::remove_var("REFLEKTOR_MARKER");

        let got = std::fs::read(&marker).unwrap();
        assert_eq!(got, b"ok");
        let _ = std::fs::remove_file(&marker);
    }
}

// Some dylib exports are designed to stay resident; a call still running
// after the timeout counts as a successful invocation.
#[cfg(target_os = "macos")]
mod darwin {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[rstest]
    fn call_export_returns_or_stays_resident() {
        init_logger();
        let Some(bytes) = basic_fixture() else {
            eprintln!("skipping: test fixture not built (no C compiler?)");
            return;
        };
        let _env = marker_env_lock();
        let marker = unique_marker_path("darwin");
        std::env::set_var("REFLEKTOR_MARKER", &marker);

        let library = std::sync::Arc::new(Library::load(&bytes).unwrap());
        let (sender, receiver) = mpsc::channel();
        let worker = library.clone();
        std::thread::spawn(move || {
            let _ = sender.send(worker.call_export("StartW"));
        });

        match receiver.recv_timeout(Duration::from_secs(3)) {
            Ok(result) => {
                result.unwrap();
                let got = std::fs::read(&marker).unwrap();
                assert_eq!(got, b"ok");
                library.free();
            }
            Err(_) => {
                eprintln!("StartW still running after timeout; treating as resident export");
            }
        }
        std::env::remove_var("REFLEKTOR_MARKER");
        let _ = std::fs::remove_file(&marker);
    }
}
