//! Form submission with a best-effort remote write.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::api::{AuthenticatedApiClient, RecordSink};
use crate::config::AppConfig;
use crate::deadline::Deadline;
use crate::error::Error;
use crate::model::{RecordFields, RecordTarget, SubmissionOutcome, UserForm};

/// Accepts validated forms and writes them to the remote list.
///
/// The write is best-effort. Once the form passes validation the submission
/// is accepted, whatever happens to the record afterwards; failures are
/// logged and reported through [`SubmissionOutcome`], never returned as
/// errors.
pub struct FormSubmissionCoordinator {
    sink: Arc<dyn RecordSink>,
    target: RecordTarget,
    write_timeout: Option<Duration>,
}

impl FormSubmissionCoordinator {
    pub fn new(sink: Arc<dyn RecordSink>, target: impl Into<RecordTarget>) -> Self {
        Self {
            sink,
            target: target.into(),
            write_timeout: None,
        }
    }

    /// Bound each record write; `None` leaves it unbounded.
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Wire the coordinator to an [`AuthenticatedApiClient`] built from
    /// `config`.
    ///
    /// An incomplete remote configuration does not stop forms from being
    /// accepted: every write then degrades with the setup error as detail.
    pub fn from_config(config: &AppConfig) -> Self {
        let sink: Arc<dyn RecordSink> = match AuthenticatedApiClient::from_config(config) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                warn!("Remote record store unavailable: {}", e);
                Arc::new(UnavailableSink {
                    reason: e.to_string(),
                })
            }
        };
        let target = config.list_name().unwrap_or_default();

        Self::new(sink, target).with_write_timeout(config.write_timeout())
    }

    pub fn target(&self) -> &RecordTarget {
        &self.target
    }

    /// Submit `form` with `extra` fields.
    pub async fn submit(&self, form: &UserForm, extra: RecordFields) -> SubmissionOutcome {
        if let Err(errors) = form.validate() {
            info!("Form rejected: {} invalid field(s)", errors.len());
            return SubmissionOutcome::rejected(errors);
        }

        info!("Form accepted from {}", form.name.trim());

        let fields = form.to_record_fields(&extra, Utc::now());
        let sink = self.sink.clone();
        let target = self.target.clone();
        let deadline = Deadline::from_budget(self.write_timeout);

        let write = tokio::spawn(async move { sink.create_record(&target, fields, &deadline).await });

        match write.await {
            Ok(Ok(true)) => {
                info!("Record saved to {}", self.target);
                SubmissionOutcome::written()
            }
            Ok(Ok(false)) => {
                warn!("Record write to {} was not confirmed", self.target);
                SubmissionOutcome::degraded("remote store did not confirm the record")
            }
            Ok(Err(e)) => {
                error!("Record write to {} failed: {}", self.target, e);
                SubmissionOutcome::degraded(e.to_string())
            }
            Err(e) => {
                error!("Record write task for {} aborted: {}", self.target, e);
                SubmissionOutcome::degraded(format!("record write task aborted: {}", e))
            }
        }
    }
}

/// Sink standing in for a client that could not be built.
struct UnavailableSink {
    reason: String,
}

#[async_trait]
impl RecordSink for UnavailableSink {
    async fn create_record(
        &self,
        _target: &RecordTarget,
        _fields: RecordFields,
        _deadline: &Deadline,
    ) -> Result<bool, Error> {
        Err(Error::SinkUnavailable(self.reason.clone()))
    }
}
