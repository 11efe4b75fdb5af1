use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::emitter::EmptyPolicy;
use crate::label::{Extractor, KeyStyle};

pub const CONFIG_PATH: &str = "/etc/ev-logger/config.yaml";

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);
const MAX_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_INDENT: usize = 0;

const ENV_PREFIX: &str = "EV_LOGGER_PREFIX";
const ENV_NAMESPACE: &str = "EV_LOGGER_NAMESPACE";
const ENV_INTERVAL: &str = "EV_LOGGER_INTERVAL";
const ENV_INDENT: &str = "EV_LOGGER_INDENT";
const ENV_KEY_STYLE: &str = "EV_LOGGER_KEY_STYLE";
const ENV_ON_EMPTY: &str = "EV_LOGGER_ON_EMPTY";
const ENV_SYSLOG: &str = "EV_LOGGER_SYSLOG";
const ENV_RESCAN: &str = "EV_LOGGER_RESCAN";
const ENV_LOG_LEVEL: &str = "EV_LOGGER_LOG_LEVEL";

// Our own settings; never emitted as labels even when the prefix covers them
static SETTINGS_VARS: &[&str] = &[
    ENV_PREFIX,
    ENV_NAMESPACE,
    ENV_INTERVAL,
    ENV_INDENT,
    ENV_KEY_STYLE,
    ENV_ON_EMPTY,
    ENV_SYSLOG,
    ENV_RESCAN,
    ENV_LOG_LEVEL,
];

/// One configuration layer: the YAML file, or the command line.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub prefix: Option<String>,

    pub namespace: Option<String>,

    pub interval: Option<u64>,

    pub indent: Option<usize>,

    pub key_style: Option<String>,

    pub on_empty: Option<String>,

    pub syslog: Option<bool>,

    pub rescan: Option<bool>,

    pub log_level: Option<String>,
}

impl Settings {
    fn from_file(path: &Path, required: bool) -> Result<Self> {
        match std::fs::File::open(path) {
            Ok(file) => serde_yaml::from_reader(file)
                .with_context(|| format!("Failed to parse config file {}", path.display())),
            Err(err) if required => {
                Err(anyhow!("Could not open config file at {}: {err}", path.display()))
            }
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    // Everything can also come from env vars.
                    eprintln!("Could not open config file at {}, {err}", path.display());
                }
                Ok(Settings::default())
            }
        }
    }
}

/// Resolved configuration. Command line wins over env vars, env vars over the file.
#[derive(Debug)]
pub struct Config {
    extractor: Extractor,
    interval: Duration,
    indent: usize,
    on_empty: EmptyPolicy,
    syslog: bool,
    rescan: bool,
    log_level: String,
    warnings: Vec<String>,
}

impl Config {
    /// Loads `path` (or the default location, which may be absent) and overlays the
    /// process environment and `cli`.
    pub fn load(path: Option<&Path>, cli: Settings) -> Result<Self> {
        let file = match path {
            Some(path) => Settings::from_file(path, true)?,
            None => Settings::from_file(Path::new(CONFIG_PATH), false)?,
        };

        let env: HashMap<String, String> = SETTINGS_VARS
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.to_string(), v)))
            .collect();

        Self::resolve(file, &env, cli)
    }

    fn resolve(file: Settings, env: &HashMap<String, String>, cli: Settings) -> Result<Self> {
        let mut warnings = Vec::new();

        let prefix = cli
            .prefix
            .or_else(|| env.get(ENV_PREFIX).cloned())
            .or(file.prefix)
            .ok_or(anyhow!("${ENV_PREFIX} not set and .prefix missing in config file"))?;

        let key_style: KeyStyle = cli
            .key_style
            .or_else(|| env.get(ENV_KEY_STYLE).cloned())
            .or(file.key_style)
            .map(|s| s.parse::<KeyStyle>())
            .transpose()?
            .unwrap_or_default();

        let on_empty: EmptyPolicy = cli
            .on_empty
            .or_else(|| env.get(ENV_ON_EMPTY).cloned())
            .or(file.on_empty)
            .map(|s| s.parse::<EmptyPolicy>())
            .transpose()?
            .unwrap_or_default();

        let mut extractor = Extractor::new(&prefix, key_style)
            .with_context(|| format!("Invalid label prefix '{prefix}'"))?
            .with_reserved(SETTINGS_VARS.iter().copied());

        let namespace = cli
            .namespace
            .or_else(|| env.get(ENV_NAMESPACE).cloned())
            .or(file.namespace);
        if let Some(namespace) = namespace {
            extractor = extractor.with_namespace(&namespace);
        }

        let interval = cli
            .interval
            .map(|v| v.to_string())
            .or_else(|| env.get(ENV_INTERVAL).cloned())
            .or(file.interval.map(|v| v.to_string()));
        let interval = match interval {
            Some(raw) => parse_interval(&raw).unwrap_or_else(|| {
                warnings.push(format!(
                    "Ignoring interval '{raw}', expected 0 to {} seconds. Using {} seconds.",
                    MAX_INTERVAL.as_secs(),
                    DEFAULT_INTERVAL.as_secs()
                ));
                DEFAULT_INTERVAL
            }),
            None => DEFAULT_INTERVAL,
        };

        let indent = cli
            .indent
            .map(|v| v.to_string())
            .or_else(|| env.get(ENV_INDENT).cloned())
            .or(file.indent.map(|v| v.to_string()));
        let indent = match indent {
            Some(raw) => raw.trim().parse::<usize>().unwrap_or_else(|_| {
                warnings.push(format!(
                    "Ignoring indent '{raw}', expected a non-negative integer"
                ));
                DEFAULT_INDENT
            }),
            None => DEFAULT_INDENT,
        };

        let syslog = cli
            .syslog
            .or_else(|| env.get(ENV_SYSLOG).map(|v| is_yes(v)))
            .or(file.syslog)
            .unwrap_or(false);

        let rescan = cli
            .rescan
            .or_else(|| env.get(ENV_RESCAN).map(|v| is_yes(v)))
            .or(file.rescan)
            .unwrap_or(false);

        let log_level = cli
            .log_level
            .or_else(|| env.get(ENV_LOG_LEVEL).cloned())
            .or(file.log_level)
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        Ok(Self {
            extractor,
            interval,
            indent,
            on_empty,
            syslog,
            rescan,
            log_level,
            warnings,
        })
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    /// Zero means emit once and exit.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn indent(&self) -> usize {
        self.indent
    }

    pub fn on_empty(&self) -> EmptyPolicy {
        self.on_empty
    }

    pub fn syslog(&self) -> bool {
        self.syslog
    }

    pub fn rescan(&self) -> bool {
        self.rescan
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Settings that were present but unusable and fell back to defaults.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

fn parse_interval(raw: &str) -> Option<Duration> {
    let secs: u64 = raw.trim().parse().ok()?;
    let interval = Duration::from_secs(secs);
    (interval <= MAX_INTERVAL).then_some(interval)
}

fn is_yes(val: &str) -> bool {
    let val = val.to_lowercase();
    val == "1" || val == "yes" || val == "true"
}
