//! Refresh command → remote calls
//!
//! Maps each [`RefreshCommand`] to a date window and a telemetry request,
//! authenticating first. Failures of any kind come back as
//! [`FetchResult::Failure`]; nothing is propagated past this boundary.

use super::{Granularity, RemoteError, WaterUsageApi};
use crate::config::FetchWindows;
use crate::error::sanitize_error_message;
use crate::protocol::{ConsumptionReport, ErrorCode, ErrorReport, RefreshCommand};
use chrono::{Datelike, Days, Local, Months, NaiveDate};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Outcome of one fetch attempt
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    Success(ConsumptionReport),
    Failure(FetchFailure),
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchResult::Success(_))
    }

    pub fn mode(&self) -> RefreshCommand {
        match self {
            FetchResult::Success(report) => report.mode,
            FetchResult::Failure(failure) => failure.mode,
        }
    }
}

/// Failed fetch, ready to be reported
#[derive(Debug, Clone, PartialEq)]
pub struct FetchFailure {
    pub mode: RefreshCommand,
    pub code: ErrorCode,
    /// Sanitised, human-readable description
    pub message: String,
    pub status_code: Option<u16>,
}

impl FetchFailure {
    fn from_remote(mode: RefreshCommand, error: &RemoteError) -> Self {
        let code = if error.is_authentication() {
            ErrorCode::AuthFailed
        } else {
            ErrorCode::FetchFailed
        };
        Self {
            mode,
            code,
            message: sanitize_error_message(&error.to_string()),
            status_code: error.status_code(),
        }
    }

    pub fn to_error_report(&self) -> ErrorReport {
        ErrorReport::fetch_failure(self.mode, self.code, self.message.clone(), self.status_code)
    }
}

/// Split `[start, end]` into calendar-month pieces
///
/// The first piece starts at `start`, the following ones on the first of
/// each month; the last piece ends at `end`.
pub fn month_chunks(start: NaiveDate, end: NaiveDate) -> Vec<(NaiveDate, NaiveDate)> {
    let mut chunks = Vec::new();
    let mut current = start;

    while current <= end {
        let next_month = current
            .with_day(1)
            .and_then(|first| first.checked_add_months(Months::new(1)));
        let month_end = next_month
            .and_then(|first| first.pred_opt())
            .map_or(end, |last| last.min(end));

        chunks.push((current, month_end));

        match next_month {
            Some(first) => current = first,
            None => break,
        }
    }

    chunks
}

/// Adapter between refresh commands and a [`WaterUsageApi`]
#[derive(Clone)]
pub struct FetchAdapter {
    api: Arc<dyn WaterUsageApi>,
    windows: FetchWindows,
}

impl FetchAdapter {
    pub fn new(api: Arc<dyn WaterUsageApi>, windows: FetchWindows) -> Self {
        Self { api, windows }
    }

    /// Start of the window for `command`, counting back from `today`
    pub fn window_start(&self, command: RefreshCommand, today: NaiveDate) -> NaiveDate {
        let days = match command {
            RefreshCommand::Daily => self.windows.daily_days,
            RefreshCommand::Monthly => self.windows.monthly_days,
            RefreshCommand::History => self.windows.history_days,
        };
        today
            .checked_sub_days(Days::new(u64::from(days)))
            .unwrap_or(NaiveDate::MIN)
    }

    /// Authenticate only, for startup credential checks
    pub async fn check_credentials(&self) -> Result<(), RemoteError> {
        self.api.authenticate().await
    }

    /// Fetch the window of `command` ending today
    pub async fn fetch(&self, command: RefreshCommand) -> FetchResult {
        self.fetch_on(command, Local::now().date_naive()).await
    }

    /// Fetch the window of `command` ending on `today`
    pub async fn fetch_on(&self, command: RefreshCommand, today: NaiveDate) -> FetchResult {
        let start = self.window_start(command, today);
        info!(mode = %command, %start, end = %today, "Fetching consumption data");

        if let Err(e) = self.api.authenticate().await {
            error!(mode = %command, error = %e, "Authentication failed");
            return FetchResult::Failure(FetchFailure::from_remote(command, &e));
        }

        let measures = match command {
            RefreshCommand::Daily => {
                self.api
                    .telemetry(Granularity::Daily, start, today)
                    .await
            }
            RefreshCommand::Monthly => {
                self.api
                    .telemetry(Granularity::Monthly, start, today)
                    .await
            }
            RefreshCommand::History => self.fetch_history(start, today).await,
        };

        match measures {
            Ok(measures) => {
                info!(
                    mode = %command,
                    records = measures.len(),
                    "Retrieved consumption data"
                );
                FetchResult::Success(ConsumptionReport::new(
                    command,
                    self.api.meter_id(),
                    start,
                    today,
                    measures,
                ))
            }
            Err(e) => {
                error!(mode = %command, error = %e, "Failed to retrieve consumption data");
                FetchResult::Failure(FetchFailure::from_remote(command, &e))
            }
        }
    }

    /// Daily measures month by month; failed months are skipped
    async fn fetch_history(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Value>, RemoteError> {
        let chunks = month_chunks(start, end);
        let mut measures = Vec::new();
        let mut last_error = None;
        let mut succeeded = 0usize;

        for (chunk_start, chunk_end) in &chunks {
            match self
                .api
                .telemetry(Granularity::Daily, *chunk_start, *chunk_end)
                .await
            {
                Ok(chunk) => {
                    info!(start = %chunk_start, end = %chunk_end, records = chunk.len(), "Fetched history chunk");
                    measures.extend(chunk);
                    succeeded += 1;
                }
                Err(e) => {
                    warn!(start = %chunk_start, end = %chunk_end, error = %e, "Skipping failed history chunk");
                    last_error = Some(e);
                }
            }
        }

        match (succeeded, last_error) {
            (0, Some(e)) => Err(e),
            _ => Ok(measures),
        }
    }
}
