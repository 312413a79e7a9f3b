//! # shmslot_ctl
//!
//! Operator tool for shared slot segments: list what exists under the shared
//! memory mount, read a segment's header, or remove a segment's name.
//!
//! # Usage
//!
//! ```bash
//! # Published segments under /dev/shm
//! shmslot_ctl list
//!
//! # Include half-built and foreign objects, as JSON
//! shmslot_ctl --json list --all
//!
//! # Header of one segment
//! shmslot_ctl inspect students
//!
//! # Remove a segment (attached processes keep their mappings)
//! shmslot_ctl -v unlink students
//! ```

#![deny(warnings)]

use clap::{Parser, Subcommand};
use serde::Deserialize;
use shmslot::{SegmentDiscovery, SegmentInfo, SharedStore};
use shmslot_common::config::{ConfigError, ConfigLoader, SharedConfig};
use shmslot_common::consts::SHM_ROOT;
use std::path::{Path, PathBuf};
use tracing::{Level, debug, error, info};
use tracing_subscriber::EnvFilter;

/// Shared slot segment control
#[derive(Parser, Debug)]
#[command(name = "shmslot_ctl")]
#[command(version)]
#[command(about = "List, inspect and remove named shared slot segments")]
#[command(long_about = None)]
struct Args {
    /// Optional TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Print results (and logs) as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List segments under the shared memory mount
    List {
        /// Directory to scan instead of the configured root
        #[arg(long, value_name = "DIR")]
        root: Option<PathBuf>,

        /// Also show objects without a published header
        #[arg(short, long)]
        all: bool,
    },
    /// Show the header of one segment
    Inspect {
        /// Segment name, with or without the leading slash
        name: String,
    },
    /// Remove a segment's name
    Unlink {
        /// Segment name, with or without the leading slash
        name: String,
    },
}

/// Contents of the `--config` file.
///
/// ```toml
/// shm_root = "/dev/shm"
///
/// [shared]
/// log_level = "debug"
/// service_name = "shmslot-ctl"
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CtlConfig {
    shared: Option<SharedConfig>,
    shm_root: Option<PathBuf>,
}

impl CtlConfig {
    fn root(&self) -> &Path {
        self.shm_root.as_deref().unwrap_or(Path::new(SHM_ROOT))
    }

    fn log_level(&self) -> Level {
        self.shared
            .as_ref()
            .and_then(|s| s.log_level.as_directive().parse().ok())
            .unwrap_or(Level::INFO)
    }
}

fn main() {
    if let Err(e) = run() {
        error!("shmslot_ctl failed: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // logging comes up before the config is trusted, so load errors are reported
    let loaded = load_config(args.config.as_deref());
    let fallback = CtlConfig::default();
    setup_tracing(&args, loaded.as_ref().unwrap_or(&fallback));
    let config = loaded?;
    debug!("Configuration: {:?}", config);

    match &args.command {
        Command::List { root, all } => {
            let root = root.as_deref().unwrap_or(config.root());
            let discovery = SegmentDiscovery::with_root(root);
            let segments = if *all {
                discovery.list_segments()?
            } else {
                discovery.list_ready()?
            };
            debug!("Found {} objects under {}", segments.len(), root.display());
            print_segments(&segments, args.json)?;
        }
        Command::Inspect { name } => {
            let info = if config.root() == Path::new(SHM_ROOT) {
                shmslot::inspect(name)?
            } else {
                SegmentDiscovery::with_root(config.root()).find_segment(name)?
            };
            match info {
                Some(info) => print_segments(std::slice::from_ref(&info), args.json)?,
                None => return Err(format!("segment {name} not found").into()),
            }
        }
        Command::Unlink { name } => {
            if SharedStore::<u8>::unlink(name)? {
                info!("Removed {}", name);
            } else {
                info!("{} did not exist", name);
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<CtlConfig, ConfigError> {
    let Some(path) = path else {
        return Ok(CtlConfig::default());
    };
    let config = CtlConfig::load(path)?;
    if let Some(shared) = &config.shared {
        shared.validate()?;
    }
    Ok(config)
}

fn print_segments(segments: &[SegmentInfo], json: bool) -> Result<(), serde_json::Error> {
    if json {
        println!("{}", serde_json::to_string_pretty(segments)?);
        return Ok(());
    }

    for line in render_table(segments) {
        println!("{line}");
    }
    Ok(())
}

fn render_table(segments: &[SegmentInfo]) -> Vec<String> {
    let mut lines = vec![format!(
        "{:<32} {:<10} {:>12} {:>10} {:>10}",
        "NAME", "STATE", "BYTES", "SLOTS", "ELEM"
    )];
    for s in segments {
        let state = serde_json::to_value(s.state)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        lines.push(format!(
            "{:<32} {:<10} {:>12} {:>10} {:>10}",
            s.name, state, s.file_size, s.element_count, s.element_size
        ));
    }
    lines
}

fn setup_tracing(args: &Args, config: &CtlConfig) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        config.log_level()
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
