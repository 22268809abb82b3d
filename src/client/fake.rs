use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{RegistryClient, RegistryError};
use crate::reference::ImageReference;

/// Scripted registry client that records every call.
#[derive(Default)]
pub(crate) struct FakeRegistryClient {
    pub calls: Mutex<Vec<String>>,
    /// Sources whose pull fails
    pub failing_pulls: HashSet<String>,
    /// Targets whose push fails transiently this many more times
    pub flaky_pushes: Mutex<HashMap<String, u32>>,
    /// Targets whose push always fails with a permanent error
    pub rejected_pushes: HashSet<String>,
    /// Delay applied to every pull
    pub pull_delay: Option<Duration>,
    pub sequential_only: bool,
}

impl FakeRegistryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_pull(mut self, source: &str) -> Self {
        self.failing_pulls.insert(source.to_string());
        self
    }

    pub fn flaky_push(self, target: &str, failures: u32) -> Self {
        self.flaky_pushes
            .lock()
            .unwrap()
            .insert(target.to_string(), failures);
        self
    }

    pub fn rejected_push(mut self, target: &str) -> Self {
        self.rejected_pushes.insert(target.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, verb: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(&format!("{verb} ")))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RegistryClient for FakeRegistryClient {
    async fn pull(&self, image: &ImageReference) -> Result<(), RegistryError> {
        let reference = image.to_string();
        self.record(format!("pull {reference}"));
        if let Some(delay) = self.pull_delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_pulls.contains(&reference) {
            return Err(RegistryError::Pull {
                reference,
                message: "manifest unknown".to_string(),
            });
        }
        Ok(())
    }

    async fn tag(&self, from: &ImageReference, to: &ImageReference) -> Result<(), RegistryError> {
        self.record(format!("tag {from} {to}"));
        Ok(())
    }

    async fn push(&self, image: &ImageReference) -> Result<(), RegistryError> {
        let reference = image.to_string();
        self.record(format!("push {reference}"));
        if self.rejected_pushes.contains(&reference) {
            return Err(RegistryError::Push {
                reference,
                message: "denied: requested access to the resource is denied".to_string(),
                transient: false,
            });
        }
        let mut flaky = self.flaky_pushes.lock().unwrap();
        if let Some(remaining) = flaky.get_mut(&reference) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RegistryError::Push {
                    reference,
                    message: "connection reset by peer".to_string(),
                    transient: true,
                });
            }
        }
        Ok(())
    }

    fn supports_concurrency(&self) -> bool {
        !self.sequential_only
    }
}
