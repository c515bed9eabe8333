//! Ordered fallback chains
//!
//! A chain is a list of named tiers, each a lazily evaluated future. Tiers
//! run strictly in list order and the first success wins; the failures of
//! earlier tiers are logged as warnings and collected.

use futures::future::BoxFuture;
use tracing::warn;

use crate::backup::BackupError;

/// One attempt in a fallback chain
pub struct Tier<'a, T> {
    name: &'static str,
    attempt: BoxFuture<'a, Result<T, BackupError>>,
}

impl<'a, T> Tier<'a, T> {
    pub fn new(name: &'static str, attempt: BoxFuture<'a, Result<T, BackupError>>) -> Self {
        Self { name, attempt }
    }
}

/// Every tier of a chain failed
#[derive(Debug)]
pub struct Exhausted {
    pub failures: Vec<(&'static str, BackupError)>,
}

impl Exhausted {
    /// One-line summary naming each tier and why it failed
    pub fn summary(&self) -> String {
        if self.failures.is_empty() {
            return String::from("no method available");
        }
        self.failures
            .iter()
            .map(|(name, err)| format!("{}: {}", name, err))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Run tiers in order, returning the name and value of the first success
pub async fn first_success<T>(tiers: Vec<Tier<'_, T>>) -> Result<(&'static str, T), Exhausted> {
    let mut failures = Vec::new();

    for tier in tiers {
        match tier.attempt.await {
            Ok(value) => return Ok((tier.name, value)),
            Err(err) => {
                warn!("{} failed: {}", tier.name, err);
                failures.push((tier.name, err));
            }
        }
    }

    Err(Exhausted { failures })
}
