//! Reachability check: write, read back and delete a small object.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use opendal::Operator;

const CHECK_KEY: &str = ".nimbus-health";
const CHECK_BODY: &[u8] = b"nimbus";

/// Round-trip a small object and return how long it took.
pub async fn round_trip(op: &Operator) -> Result<Duration> {
    let started = Instant::now();
    op.write(CHECK_KEY, CHECK_BODY)
        .await
        .context("block store check: write")?;
    let body = op.read(CHECK_KEY).await.context("block store check: read")?;
    anyhow::ensure!(body.to_vec() == CHECK_BODY, "block store check: read back different bytes");
    op.delete(CHECK_KEY).await.context("block store check: delete")?;
    Ok(started.elapsed())
}

pub async fn is_reachable(op: &Operator) -> bool {
    match round_trip(op).await {
        Ok(latency) => {
            tracing::debug!(?latency, "block store reachable");
            true
        }
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "block store unreachable");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trips_and_cleans_up() {
        let op = crate::operator::memory_operator().unwrap();
        assert!(tokio_test::block_on(is_reachable(&op)));
        let left = tokio_test::block_on(op.exists(CHECK_KEY)).unwrap();
        assert!(!left);
    }
}
