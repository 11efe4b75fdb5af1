use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::*;
use tokio::signal::unix::{signal, Signal, SignalKind};

use crate::label::{Extractor, Labels};

pub const APP_NAME: &str = "Environment Variable Logger";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// What to do when a pass over the environment finds no labels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EmptyPolicy {
    /// Log a warning and keep going.
    Warn,

    /// Stop with an error.
    #[default]
    Fail,
}

impl FromStr for EmptyPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "warn" => Ok(EmptyPolicy::Warn),
            "fail" => Ok(EmptyPolicy::Fail),
            _ => Err(anyhow!("unknown empty policy '{s}', expected 'warn' or 'fail'")),
        }
    }
}

pub trait EnvSource {
    fn snapshot(&self) -> HashMap<String, String>;
}

/// Environment of the running process. Variables that aren't valid UTF-8 are skipped.
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn snapshot(&self) -> HashMap<String, String> {
        std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect()
    }
}

impl EnvSource for HashMap<String, String> {
    fn snapshot(&self) -> HashMap<String, String> {
        self.clone()
    }
}

pub struct Emitter<S> {
    extractor: Extractor,
    source: S,
    interval: Duration,
    on_empty: EmptyPolicy,
    rescan: bool,
}

impl<S: EnvSource> Emitter<S> {
    pub fn new(extractor: Extractor, source: S, interval: Duration, on_empty: EmptyPolicy, rescan: bool) -> Self {
        Self {
            extractor,
            source,
            interval,
            on_empty,
            rescan,
        }
    }

    /// Extracts labels from `snapshot`, applying the empty policy. `None` means
    /// nothing to emit this time around.
    pub fn labels(&self, snapshot: &HashMap<String, String>) -> Result<Option<Labels>> {
        let labels = self.extractor.extract(snapshot)?;
        if !labels.is_empty() {
            return Ok(Some(labels));
        }

        match self.on_empty {
            EmptyPolicy::Warn => {
                warn!(
                    "No labels found for prefix {}. Please set the appropriate environment variables.",
                    self.extractor.prefix()
                );
                Ok(None)
            }
            EmptyPolicy::Fail => Err(anyhow!(
                "No label environment variables set for prefix {}. Please set the appropriate environment variables.",
                self.extractor.prefix()
            )),
        }
    }

    /// Emits until `shutdown` resolves, or once if the interval is zero.
    /// `shutdown` yields the reason that gets logged. Returns the number of emissions.
    pub async fn run<F>(self, shutdown: F) -> Result<usize>
    where
        F: Future<Output = String>,
    {
        let schedule = if self.interval.is_zero() {
            "once only".to_string()
        } else {
            format!("every {} seconds", self.interval.as_secs())
        };
        info!("Starting {APP_NAME} v{VERSION}. Emitting labels {schedule}.");
        debug!(
            "Prefix {}, namespace {}, key style {:?}",
            self.extractor.prefix(),
            self.extractor.namespace(),
            self.extractor.style()
        );

        tokio::pin!(shutdown);

        let mut snapshot = self.source.snapshot();
        let mut emitted = 0;
        let mut ticks = 0u64;

        loop {
            if self.rescan && ticks > 0 {
                snapshot = self.source.snapshot();
            }
            ticks += 1;

            if let Some(labels) = self.labels(&snapshot)? {
                info!("{}", serde_json::to_string(&labels)?);
                emitted += 1;
            }

            if self.interval.is_zero() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                reason = &mut shutdown => {
                    info!("Terminating the {APP_NAME}. Reason: {reason}.");
                    break;
                }
            }
        }

        Ok(emitted)
    }
}

/// SIGTERM and SIGINT, registered up front so none is missed between ticks.
pub struct Signals {
    term: Signal,
    int: Signal,
}

impl Signals {
    pub fn register() -> Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
        })
    }

    pub async fn recv(&mut self) -> String {
        tokio::select! {
            _ = self.term.recv() => "Received SIGTERM(15)".to_string(),
            _ = self.int.recv() => "Received SIGINT(2)".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert2::{assert, let_assert};

    use super::*;
    use crate::label::{KeyStyle, LabelValue};

    fn env(vars: &[(&str, &str)]) -> HashMap<String, String> {
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn extractor() -> Extractor {
        Extractor::new("APP", KeyStyle::Nested).unwrap()
    }

    // Hands out the queued snapshots in order, then keeps repeating the last one.
    struct Sequence(Mutex<Vec<HashMap<String, String>>>);

    impl EnvSource for Sequence {
        fn snapshot(&self) -> HashMap<String, String> {
            let mut queue = self.0.lock().unwrap();
            if queue.len() > 1 {
                queue.remove(0)
            } else {
                queue[0].clone()
            }
        }
    }

    #[test]
    fn test_labels() {
        let emitter = Emitter::new(extractor(), HashMap::new(), Duration::ZERO, EmptyPolicy::Fail, false);

        let_assert!(Ok(Some(labels)) = emitter.labels(&env(&[("APP_NAME", "x")])));
        assert!(labels["app/name"] == LabelValue::Scalar("x".to_string()));
    }

    #[test]
    fn test_empty_policy() {
        let snapshot = env(&[("OTHER", "x")]);

        let emitter = Emitter::new(extractor(), HashMap::new(), Duration::ZERO, EmptyPolicy::Warn, false);
        let_assert!(Ok(None) = emitter.labels(&snapshot));

        let emitter = Emitter::new(extractor(), HashMap::new(), Duration::ZERO, EmptyPolicy::Fail, false);
        let_assert!(Err(err) = emitter.labels(&snapshot));
        assert!(err.to_string().contains("APP"));
    }

    #[test]
    fn test_extract_error_is_fatal() {
        let emitter = Emitter::new(extractor(), HashMap::new(), Duration::ZERO, EmptyPolicy::Warn, false);
        let_assert!(Err(_) = emitter.labels(&env(&[("APP_ITEM__x__NAME", "y")])));
    }

    #[test]
    fn test_empty_policy_from_str() {
        assert!("warn".parse::<EmptyPolicy>().unwrap() == EmptyPolicy::Warn);
        assert!("FAIL".parse::<EmptyPolicy>().unwrap() == EmptyPolicy::Fail);
        let_assert!(Err(_) = "ignore".parse::<EmptyPolicy>());
    }

    #[test]
    fn test_process_env() {
        // PATH is about the only thing guaranteed to be around
        let snapshot = ProcessEnv.snapshot();
        assert!(snapshot.contains_key("PATH"));
    }

    #[tokio::test]
    async fn test_run_once() {
        let source = env(&[("APP_NAME", "x")]);
        let emitter = Emitter::new(extractor(), source, Duration::ZERO, EmptyPolicy::Fail, false);

        let emitted = emitter.run(std::future::pending()).await.unwrap();
        assert!(emitted == 1);
    }

    #[tokio::test]
    async fn test_run_fails_when_empty() {
        let emitter = Emitter::new(extractor(), HashMap::new(), Duration::ZERO, EmptyPolicy::Fail, false);
        let_assert!(Err(_) = emitter.run(std::future::pending()).await);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let source = env(&[("APP_NAME", "x")]);
        let emitter = Emitter::new(extractor(), source, Duration::from_secs(60), EmptyPolicy::Fail, false);

        let emitted = emitter
            .run(std::future::ready("test".to_string()))
            .await
            .unwrap();
        assert!(emitted == 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_interval() {
        let source = env(&[("APP_NAME", "x")]);
        let emitter = Emitter::new(extractor(), source, Duration::from_secs(100), EmptyPolicy::Fail, false);

        let shutdown = async {
            tokio::time::sleep(Duration::from_secs(250)).await;
            "test".to_string()
        };

        // t=0, t=100, t=200
        let emitted = emitter.run(shutdown).await.unwrap();
        assert!(emitted == 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescan() {
        let source = Sequence(Mutex::new(vec![HashMap::new(), env(&[("APP_NAME", "x")])]));
        let emitter = Emitter::new(extractor(), source, Duration::from_secs(100), EmptyPolicy::Warn, true);

        let shutdown = async {
            tokio::time::sleep(Duration::from_secs(150)).await;
            "test".to_string()
        };

        // first tick sees nothing, second picks up the new variable
        let emitted = emitter.run(shutdown).await.unwrap();
        assert!(emitted == 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_rescan() {
        let source = Sequence(Mutex::new(vec![HashMap::new(), env(&[("APP_NAME", "x")])]));
        let emitter = Emitter::new(extractor(), source, Duration::from_secs(100), EmptyPolicy::Warn, false);

        let shutdown = async {
            tokio::time::sleep(Duration::from_secs(150)).await;
            "test".to_string()
        };

        let emitted = emitter.run(shutdown).await.unwrap();
        assert!(emitted == 0);
    }
}
