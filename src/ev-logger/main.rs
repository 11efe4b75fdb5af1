pub mod config;
pub mod emitter;
pub mod label;
pub mod logging;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::*;

use config::{Config, Settings};
use emitter::{Emitter, ProcessEnv, Signals};

/// Emits prefixed environment variables as JSON labels at a regular interval.
#[derive(Parser)]
#[clap(version)]
struct CliArgs {
    /// YAML config file [default: /etc/ev-logger/config.yaml, if present]
    #[clap(long = "config")]
    config: Option<PathBuf>,

    /// Environment variable prefix selecting the labels
    #[clap(long = "prefix")]
    prefix: Option<String>,

    /// Label namespace [default: derived from the prefix]
    #[clap(long = "namespace")]
    namespace: Option<String>,

    /// Seconds between emissions, 0 to emit once
    #[clap(long = "interval")]
    interval: Option<u64>,

    /// JSON indentation, 0 for compact output
    #[clap(long = "indent")]
    indent: Option<usize>,

    /// Indexed key convention: nested (LABEL__0__SUB, default) or positional (LABEL_0_SUB).
    /// Kubernetes-style variables such as APP_KUBERNETES_IO_INVENTORY_0_NAME need positional;
    /// under nested they become the plain label inventory.0.name
    #[clap(long = "key-style")]
    key_style: Option<String>,

    /// What to do when no labels are found: warn or fail
    #[clap(long = "on-empty")]
    on_empty: Option<String>,

    /// Log to the local syslog socket instead of stderr
    #[clap(long = "syslog")]
    syslog: bool,

    /// Re-read the environment before every emission
    #[clap(long = "rescan")]
    rescan: bool,

    #[clap(long = "log-level")]
    log_level: Option<String>,
}

impl CliArgs {
    fn settings(&self) -> Settings {
        Settings {
            prefix: self.prefix.clone(),
            namespace: self.namespace.clone(),
            interval: self.interval,
            indent: self.indent,
            key_style: self.key_style.clone(),
            on_empty: self.on_empty.clone(),
            // flags can only switch these on
            syslog: self.syslog.then_some(true),
            rescan: self.rescan.then_some(true),
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let config = match Config::load(args.config.as_deref(), args.settings()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("err: {err:#}");
            std::process::exit(1);
        }
    };

    if let Err(err) = logging::init(&config) {
        eprintln!("err: {err:#}");
        std::process::exit(1);
    }

    for warning in config.warnings() {
        warn!("{warning}");
    }

    if let Err(err) = run(config).await {
        error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<()> {
    let mut signals = Signals::register()?;

    let emitter = Emitter::new(
        config.extractor().clone(),
        ProcessEnv,
        config.interval(),
        config.on_empty(),
        config.rescan(),
    );

    emitter.run(signals.recv()).await?;
    Ok(())
}
