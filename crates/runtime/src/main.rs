//! # clkit
//!
//! Lists compute devices and dry-runs kernel files through the clkit
//! convenience layer. Session switches come from `CLKIT_DEBUG`,
//! `CLKIT_CLEANUP` and `CLKIT_PROFILE`, overridden by the flags below.

#![deny(clippy::all, clippy::pedantic)]

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use clkit::{
    ArgKind, ArgValue, BufferOptions, BuildOptions, ContextOptions, FileSourceLoader, Kernel,
    QueueOptions, Session, SessionConfig, TypedArray,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Named-resource compute toolkit", long_about = None)]
struct Cli {
    /// Log failing operations with their arguments and owner state
    #[arg(long, global = true)]
    debug: bool,

    /// Keep resources alive when an operation fails
    #[arg(long, global = true)]
    no_cleanup: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List usable platforms and devices
    Devices,
    /// Build a `.cl` file and enqueue one of its kernels once
    Run {
        /// Kernel source file
        file: PathBuf,
        /// Kernel to run; defaults to the first one in the file
        #[arg(long)]
        kernel: Option<String>,
        /// Device id as listed by `devices`
        #[arg(long, default_value = "CPU0")]
        device: String,
        /// Preprocessor define, `NAME=VALUE`
        #[arg(short = 'D', value_parser = parse_define)]
        define: Vec<(String, String)>,
        /// Extra compiler options
        #[arg(long, default_value = "")]
        opts: String,
        /// Global work size
        #[arg(long, default_value_t = 64)]
        global: usize,
        /// Size in bytes of each buffer bound to a pointer argument
        #[arg(long, default_value_t = 1024)]
        buffer_size: usize,
    },
}

fn parse_define(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_owned(), value.to_owned())),
        None if !s.is_empty() => Ok((s.to_owned(), "1".to_owned())),
        _ => Err(format!("invalid define '{s}', expected NAME=VALUE")),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let mut config = SessionConfig::from_env();
    config.debug |= cli.debug;
    config.cleanup &= !cli.no_cleanup;

    match cli.command {
        Command::Devices => devices(config),
        Command::Run { file, kernel, device, define, opts, global, buffer_size } => {
            let mut build = BuildOptions::default().opts(opts);
            for (name, value) in define {
                build = build.define(name, value);
            }
            run(config, &file, kernel.as_deref(), &device, &build, global, buffer_size)
        }
    }
}

fn devices(config: SessionConfig) -> Result<()> {
    let session = Session::new(clkit::default_provider(), config)?;
    for platform in session.platforms() {
        println!("{} ({}, {})", platform.name(), platform.vendor(), platform.version());
        for device in platform.devices() {
            println!("  {device} [{}]", device.supported_extensions().join(" "));
        }
    }
    Ok(())
}

fn run(
    config: SessionConfig,
    file: &Path,
    kernel: Option<&str>,
    device: &str,
    build: &BuildOptions,
    global: usize,
    buffer_size: usize,
) -> Result<()> {
    let root = file.parent().unwrap_or_else(|| Path::new("."));
    let uri = file
        .file_name()
        .and_then(|f| f.to_str())
        .with_context(|| format!("not a file name: {}", file.display()))?;

    let loader = Arc::new(FileSourceLoader::new(root));
    let session = Session::with_loader(clkit::default_provider(), loader, config)?;
    let device = session
        .device(device)
        .with_context(|| format!("no usable device '{device}'"))?;
    let ctx = session.create_context(ContextOptions::default().device(&device))?;

    let program = ctx.build_program(uri, build)?;
    let kernel = match kernel {
        Some(name) => program
            .get_kernel(name)
            .with_context(|| format!("no kernel '{name}' in {}", file.display()))?,
        None => program.kernel().context("program has no kernels")?,
    };
    tracing::info!(kernel = kernel.function_name(), args = kernel.num_args(), "running");

    for (index, kind) in kernel.arg_kinds().iter().enumerate() {
        if *kind == ArgKind::Memory {
            ctx.create_buffer(BufferOptions::default().name(format!("arg{index}")).size(buffer_size))?;
        }
    }
    kernel.set_args(&placeholder_args(&kernel))?;

    let queue = ctx.create_command_queue(QueueOptions::default())?;
    queue.enqueue_kernel(&kernel, &[global], &[])?;
    queue.finish()?;
    println!(
        "{}: {} argument(s), {} event(s), work-group size {}",
        kernel.function_name(),
        kernel.num_args(),
        queue.events().len(),
        kernel.work_group_size()
    );

    session.release_all()?;
    Ok(())
}

/// A zero for every by-value parameter and the `argN` buffer for every pointer.
fn placeholder_args(kernel: &Kernel) -> Vec<ArgValue> {
    kernel
        .arg_kinds()
        .iter()
        .enumerate()
        .map(|(index, kind)| match kind {
            ArgKind::Memory => ArgValue::Name(format!("arg{index}")),
            ArgKind::LocalScratch => ArgValue::Number(1024.0),
            ArgKind::Scalar(_) => ArgValue::Number(0.0),
            ArgKind::Vector(ty, lanes) => {
                ArgValue::Array(TypedArray::U8(vec![0; ty.width() * usize::from(*lanes)]))
            }
        })
        .collect()
}
