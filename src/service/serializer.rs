//! Single-flight gate in front of the fetch adapter
//!
//! At most one fetch runs at a time. A command arriving while a fetch is in
//! flight is rejected with [`FetchBusy`]; it is never queued or retried.
//! The in-progress marker is a semaphore permit owned by [`PendingFetch`], so
//! it is released however the fetch ends: completion, error, panic, or the
//! task being aborted.

use crate::fetch_span;
use crate::protocol::RefreshCommand;
use crate::remote::{FetchAdapter, FetchResult};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, Instrument};

/// Rejection returned while another fetch is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("fetch already in progress, rejected {rejected} refresh")]
pub struct FetchBusy {
    pub rejected: RefreshCommand,
}

/// Serializes fetches against the remote service
#[derive(Clone)]
pub struct FetchSerializer {
    adapter: FetchAdapter,
    in_flight: Arc<Semaphore>,
}

impl FetchSerializer {
    pub fn new(adapter: FetchAdapter) -> Self {
        Self {
            adapter,
            in_flight: Arc::new(Semaphore::new(1)),
        }
    }

    /// Whether a fetch currently holds the gate
    pub fn is_busy(&self) -> bool {
        self.in_flight.available_permits() == 0
    }

    /// Claim the gate for `command` without waiting
    ///
    /// The returned [`PendingFetch`] holds the gate until it is run to
    /// completion or dropped.
    pub fn try_submit(&self, command: RefreshCommand) -> Result<PendingFetch, FetchBusy> {
        let permit = self
            .in_flight
            .clone()
            .try_acquire_owned()
            .map_err(|_| FetchBusy { rejected: command })?;

        debug!(mode = %command, "Fetch accepted");
        Ok(PendingFetch {
            command,
            adapter: self.adapter.clone(),
            _permit: permit,
        })
    }

    /// Run `command` now, or report busy
    pub async fn run_if_idle(&self, command: RefreshCommand) -> Result<FetchResult, FetchBusy> {
        Ok(self.try_submit(command)?.run().await)
    }
}

/// An accepted fetch, holding the gate
pub struct PendingFetch {
    command: RefreshCommand,
    adapter: FetchAdapter,
    _permit: OwnedSemaphorePermit,
}

impl PendingFetch {
    pub fn command(&self) -> RefreshCommand {
        self.command
    }

    /// Perform the fetch; the gate reopens when this returns
    pub async fn run(self) -> FetchResult {
        let span = fetch_span!(mode = %self.command);
        self.adapter.fetch(self.command).instrument(span).await
    }
}
