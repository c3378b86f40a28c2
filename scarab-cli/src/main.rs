//! Scarab CLI - the thin front end that resolves a core file, brings the
//! runtime up, and hands control to the image's initial callable.
//!
//! Deliberately thin: argument parsing, core-file search, and banner
//! handling live here; everything else is `scarab-runtime`'s FFI surface.

use std::ffi::CString;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Scarab - run a compiled core image.
#[derive(Parser, Debug)]
#[command(name = "scarab")]
#[command(author = "Scarab Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run a scarab core image", long_about = None)]
struct Cli {
    /// Path to the core image to load. If omitted, the default search path
    /// is consulted (`SCARAB_CORE`, then `./scarab.core`, then the user
    /// config directory).
    #[arg(long, env = "SCARAB_CORE")]
    core: Option<PathBuf>,

    /// Suppress the startup banner.
    #[arg(long)]
    noinform: bool,

    /// Marks the end of runtime-understood options; everything after this
    /// flag is left for the loaded image to interpret and is not parsed by
    /// this binary.
    #[arg(long = "end-runtime-options")]
    end_runtime_options: bool,

    /// Arguments passed through to the loaded image, following
    /// `--end-runtime-options`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    image_args: Vec<String>,
}

const BANNER: &str = concat!("scarab ", env!("CARGO_PKG_VERSION"), "\n");

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging() {
        eprintln!("scarab: failed to initialize logging: {e}");
        std::process::exit(1);
    }

    if !cli.noinform {
        print!("{BANNER}");
    }

    match run(&cli) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("scarab: {e:#}");
            std::process::exit(1);
        }
    }
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| anyhow!("{e}"))
}

fn run(cli: &Cli) -> Result<()> {
    let core_path = resolve_core_path(cli.core.as_deref())?;
    tracing::info!(core = %core_path.display(), "loading core image");

    if !scarab_runtime::scarab_runtime_init() {
        return Err(anyhow!("failed to initialize runtime"));
    }

    let path_cstring =
        CString::new(core_path.to_string_lossy().into_owned()).context("core path contains an embedded NUL byte")?;

    let initial_callable = unsafe { scarab_runtime::scarab_runtime_load_image(path_cstring.as_ptr()) };
    if initial_callable == 0 {
        return Err(anyhow!("failed to load core image at {}", core_path.display()));
    }

    tracing::info!(initial_callable = format!("{initial_callable:#x}"), "image loaded");
    Ok(())
}

/// Search, in order: an explicit `--core`/`SCARAB_CORE`, `./scarab.core`,
/// and the user config directory's `scarab/scarab.core`. The first path
/// that exists on disk wins; none existing is an error rather than a
/// silent default, since running with no image is never useful.
fn resolve_core_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    let mut candidates = vec![PathBuf::from("scarab.core")];
    if let Some(config_dir) = dirs::config_dir() {
        candidates.push(config_dir.join("scarab").join("scarab.core"));
    }

    candidates
        .into_iter()
        .find(|p| p.exists())
        .ok_or_else(|| anyhow!("no core image found; pass --core <path> or set SCARAB_CORE"))
}
