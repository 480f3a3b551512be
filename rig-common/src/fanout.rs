//! Acting on one or more hosts.
//!
//! Hosts never share a connection, so running one future per host is safe
//! without locking. No completion order between hosts is promised; results
//! always come back in input order.

use std::future::Future;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// One host after another, stopping at the first error.
    #[default]
    Sequential,
    /// All hosts concurrently; every host runs to completion.
    Parallel,
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            other => Err(format!("unknown run mode '{other}' (expected sequential or parallel)")),
        }
    }
}

/// Run `op` against every host.
///
/// Sequential mode returns the first error and skips the remaining hosts.
/// Parallel mode waits for all hosts, then returns the first error in input
/// order, or every value in input order.
pub async fn on_hosts<'a, H, T, E, F, Fut>(
    hosts: &'a mut [H],
    mode: RunMode,
    mut op: F,
) -> Result<Vec<T>, E>
where
    F: FnMut(&'a mut H) -> Fut,
    Fut: Future<Output = Result<T, E>> + 'a,
{
    debug!(hosts = hosts.len(), ?mode, "fanning out");
    match mode {
        RunMode::Sequential => {
            let mut values = Vec::with_capacity(hosts.len());
            for host in hosts {
                values.push(op(host).await?);
            }
            Ok(values)
        }
        RunMode::Parallel => {
            let futures: Vec<_> = hosts.iter_mut().map(&mut op).collect();
            join_all(futures).await.into_iter().collect()
        }
    }
}
