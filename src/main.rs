use std::path::PathBuf;

use clap::Parser;
use reflektor::Library;

/// Load a shared library and call an exported function without writing
/// it to disk.
#[derive(Parser)]
#[command(name = "reflektor")]
struct Args {
    /// Path to the shared-library image
    library: PathBuf,
    /// Entry symbol to resolve in the shared library
    #[arg(long, default_value = "StartW")]
    call_export: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let library = Library::load_from_path(&args.library)?;
    library.call_export(&args.call_export)?;
    library.free();

    println!("ok");
    Ok(())
}
