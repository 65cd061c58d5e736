//! Bounded wait for topology recovery before a resume attempt.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use crate::{
    deployment::Deployment,
    error::{ErrorKind, Result},
};

/// How often the topology is polled during a resume. Server discovery and
/// monitoring is the underlying source of truth, so the cadence is coarse.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long a resume waits for the topology before giving up.
const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll the deployment until it reports itself connected. The deadline is
/// anchored at the first attempt; no jitter is applied.
pub(crate) async fn wait_for_connected(deployment: &dyn Deployment) -> Result<()> {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        if deployment.is_connected() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            debug!(
                target: "watchstream::topology",
                "topology not connected within {:?}",
                WAIT_TIMEOUT,
            );
            return Err(ErrorKind::TopologyTimeout {
                message: format!(
                    "timed out after waiting {:?} for the topology to reconnect",
                    WAIT_TIMEOUT
                ),
            }
            .into());
        }
        trace!(target: "watchstream::topology", "topology not yet connected");
        sleep(POLL_INTERVAL).await;
    }
}
