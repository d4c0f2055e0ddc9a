use std::path::PathBuf;
use std::{env, fs};

const FIXTURE_SOURCE: &str = "testdata/c/basic.c";

fn main() {
    println!("cargo:rerun-if-changed={FIXTURE_SOURCE}");

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let artifacts = out_dir.join("fixtures");
    fs::create_dir_all(&artifacts).unwrap();
    println!("cargo:rustc-env=TEST_ARTIFACTS={}", artifacts.display());

    // The integration tests skip themselves when the fixture is missing, so a
    // host without a C toolchain still builds and runs the rest of the suite.
    let compiler = match cc::Build::new().opt_level(2).try_get_compiler() {
        Ok(compiler) => compiler,
        Err(_) => {
            println!("cargo:warning=no C compiler found, test fixtures will not be built");
            return;
        }
    };
    if compiler.is_like_msvc() {
        println!("cargo:warning=msvc fixture build is not wired up, test fixtures will not be built");
        return;
    }

    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let (flag, ext) = match target_os.as_str() {
        "macos" => ("-dynamiclib", "dylib"),
        _ => ("-shared", "so"),
    };
    let output = artifacts.join(format!("libbasic.{ext}"));

    let mut cmd = compiler.to_command();
    cmd.args([flag, "-fPIC", "-O2", "-g0", "-o"])
        .arg(&output)
        .arg(FIXTURE_SOURCE);
    match cmd.status() {
        Ok(status) if status.success() => {}
        _ => println!(
            "cargo:warning=failed to compile {FIXTURE_SOURCE}, test fixtures will not be built"
        ),
    }
}
