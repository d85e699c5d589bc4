//! vnodefs - Mount an in-memory vnode tree as a FUSE filesystem.
//!
//! Usage: vnodefs <mountpoint> [--attach <file>]...
//!
//! Attached host files appear read-through under `/host`, served by the
//! paged-file cache.

#![deny(unsafe_code)]

// Use mimalloc for reduced allocation latency (enabled by default).
#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use vnodefs_core::{
    DEFAULT_PAGE_SIZE, DynamicPagedFile, FsConfig, MemDir, NodeRef, StaticDir, TraceMask,
    VirtualFs, WindowPagedFile,
};
use vnodefs_fuse::{MountConfig, VnodeFs, mount};

/// Directory the attached host files are grafted over.
const HOST_DIR: &str = "/host";

#[derive(Parser)]
#[command(name = "vnodefs")]
#[command(about = "Mount an in-memory vnode tree as a FUSE filesystem")]
#[command(version)]
struct Cli {
    /// Mountpoint for the filesystem
    mountpoint: PathBuf,

    /// Calls to trace, `+`-separated (e.g. "Getattr+Read+Dir"); empty disables
    #[arg(long, value_name = "MASK")]
    trace: Option<TraceMask>,

    /// Page size of the in-memory files and attached-file caches
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: usize,

    /// Host file to expose under /host (repeatable)
    #[arg(long, value_name = "PATH")]
    attach: Vec<PathBuf>,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,

    /// Mount as read-only (default: read-write)
    #[arg(long)]
    read_only: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}

/// Opens `path` as a paged file cached one page at a time.
fn attach(path: &Path, page_size: usize, read_only: bool) -> Result<(String, NodeRef)> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("No file name in {}", path.display()))?;
    let file = OpenOptions::new()
        .read(true)
        .write(!read_only)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let pages = WindowPagedFile::whole(file, page_size)
        .with_context(|| format!("Failed to map {}", path.display()))?;
    let node: NodeRef = Arc::new(
        DynamicPagedFile::new(pages)
            .with_context(|| format!("Failed to cache {}", path.display()))?,
    );
    Ok((name, node))
}

fn build_driver(cli: &Cli) -> Result<VirtualFs> {
    let config = FsConfig::default().trace_mask(cli.trace.unwrap_or_else(TraceMask::empty));

    let driver = VirtualFs::new(MemDir::with_page_size(cli.page_size), config)
        .context("Failed to create driver")?;

    if !cli.attach.is_empty() {
        let files = cli
            .attach
            .iter()
            .map(|p| attach(p, cli.page_size, cli.read_only))
            .collect::<Result<StaticDir>>()?;
        driver
            .mkdir(HOST_DIR, 0o755)
            .context("Failed to create /host")?;
        driver
            .mount(HOST_DIR, Arc::new(files))
            .context("Failed to mount attached files")?;
        info!(count = cli.attach.len(), "Attached host files under {HOST_DIR}");
    }
    Ok(driver)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    if !cli.mountpoint.is_dir() {
        anyhow::bail!("Mountpoint does not exist: {}", cli.mountpoint.display());
    }

    let driver = build_driver(&cli)?;
    let config = MountConfig::default()
        .allow_other(cli.allow_other)
        .read_only(cli.read_only);
    let fs = VnodeFs::new(Arc::new(driver), config);

    // Set up channel for signal handling
    let (tx, rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to set signal handler")?;

    info!("Mounting filesystem (press Ctrl+C to unmount)");
    let handle = mount(fs, &cli.mountpoint).context("Failed to mount filesystem")?;
    info!("Filesystem mounted at {}", handle.mountpoint().display());

    match rx.recv() {
        Ok(()) => info!("Received interrupt signal, unmounting..."),
        Err(_) => warn!("Signal channel closed unexpectedly"),
    }

    handle.unmount();
    info!("Filesystem unmounted");
    Ok(())
}
