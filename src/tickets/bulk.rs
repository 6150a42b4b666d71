//! Batch wrappers around issuance and validation.
//!
//! Items run with bounded parallelism and never share a lock, so one slow or failing item
//! only costs its own slot. Every item lands in exactly one bucket.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::info;

use crate::models::{
    EventId, GeoPoint, IssueContext, ScanType, Ticket, TicketCode, TicketType, UserId,
};
use crate::tickets::error::TicketError;
use crate::tickets::issuance::{IssuanceService, IssueRequest};
use crate::tickets::reason::ReasonCode;
use crate::tickets::validation::{
    ScanInput, ScanOutcome, ScanReceipt, ScanRequest, ValidationEngine,
};
use crate::tickets::TicketSettings;

pub const BULK_DEVICE_FINGERPRINT: &str = "bulk-generated";

#[derive(Debug, Clone)]
pub struct BulkIssue {
    pub event_id: EventId,
    pub user_ids: Vec<UserId>,
    pub ticket_type: TicketType,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BulkValidate {
    pub items: Vec<String>,
    pub scanner: UserId,
    pub scan_type: ScanType,
    pub location: Option<GeoPoint>,
    pub device_info: Option<serde_json::Value>,
}

/// An item that did not succeed, with the reason it was skipped or failed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkItemIssue {
    pub item: String,
    pub reason_code: ReasonCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_code: Option<TicketCode>,
    /// The item may succeed if submitted again on its own.
    pub retryable: bool,
}

impl BulkItemIssue {
    fn new(item: String, reason_code: ReasonCode, ticket_code: Option<TicketCode>) -> Self {
        Self {
            item,
            reason_code,
            message: reason_code.message().to_string(),
            ticket_code,
            retryable: false,
        }
    }

    fn from_error(item: String, err: &TicketError) -> Self {
        Self {
            retryable: err.is_retryable(),
            ..Self::new(item, err.reason(), None)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkSummary {
    pub total: usize,
    pub success: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkReport<T> {
    pub succeeded: Vec<T>,
    pub skipped: Vec<BulkItemIssue>,
    pub failed: Vec<BulkItemIssue>,
    pub summary: BulkSummary,
}

impl<T> BulkReport<T> {
    fn new() -> Self {
        Self {
            succeeded: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            summary: BulkSummary::default(),
        }
    }

    fn succeed(&mut self, item: T) {
        self.succeeded.push(item);
    }

    fn skip(&mut self, issue: BulkItemIssue) {
        self.skipped.push(issue);
    }

    fn fail(&mut self, issue: BulkItemIssue) {
        self.failed.push(issue);
    }

    fn finish(mut self) -> Self {
        self.summary = BulkSummary {
            total: self.succeeded.len() + self.skipped.len() + self.failed.len(),
            success: self.succeeded.len(),
            skipped: self.skipped.len(),
            failed: self.failed.len(),
        };
        self
    }
}

#[derive(Clone)]
pub struct BulkCoordinator {
    issuance: IssuanceService,
    validation: ValidationEngine,
    settings: TicketSettings,
}

impl BulkCoordinator {
    pub fn new(
        issuance: IssuanceService,
        validation: ValidationEngine,
        settings: TicketSettings,
    ) -> Self {
        Self {
            issuance,
            validation,
            settings,
        }
    }

    /// Rejects the whole batch before any item runs.
    fn check_size(&self, size: usize) -> Result<(), TicketError> {
        if size == 0 {
            return Err(TicketError::EmptyBatch);
        }
        if size > self.settings.bulk_max_items {
            return Err(TicketError::BatchTooLarge {
                size,
                max: self.settings.bulk_max_items,
            });
        }
        Ok(())
    }

    fn concurrency(&self) -> usize {
        self.settings.bulk_concurrency.max(1)
    }

    pub async fn issue(&self, batch: BulkIssue) -> Result<BulkReport<Ticket>, TicketError> {
        self.check_size(batch.user_ids.len())?;

        let context = IssueContext {
            device_fingerprint: Some(BULK_DEVICE_FINGERPRINT.to_string()),
            ip_address: batch.ip_address.clone(),
        };
        let results: Vec<(UserId, Result<_, TicketError>)> = stream::iter(batch.user_ids)
            .map(|user_id| {
                let request = IssueRequest {
                    ticket_type: batch.ticket_type,
                    context: context.clone(),
                    ..IssueRequest::new(batch.event_id, user_id)
                };
                async move { (user_id, self.issuance.issue(request).await) }
            })
            .buffered(self.concurrency())
            .collect()
            .await;

        let mut report = BulkReport::new();
        for (user_id, result) in results {
            match result {
                Ok(issued) if issued.created => report.succeed(issued.ticket),
                Ok(issued) => report.skip(BulkItemIssue::new(
                    user_id.to_string(),
                    ReasonCode::TicketAlreadyExists,
                    Some(issued.ticket.ticket_code),
                )),
                Err(e) => report.fail(BulkItemIssue::from_error(user_id.to_string(), &e)),
            }
        }
        let report = report.finish();
        info!(
            event_id = %batch.event_id,
            total = report.summary.total,
            success = report.summary.success,
            skipped = report.summary.skipped,
            failed = report.summary.failed,
            "Bulk issuance finished"
        );
        Ok(report)
    }

    /// Items may be full QR payloads or typed ticket codes. Already-used tickets are skipped.
    pub async fn validate(
        &self,
        batch: BulkValidate,
    ) -> Result<BulkReport<ScanReceipt>, TicketError> {
        self.check_size(batch.items.len())?;

        let scanner = batch.scanner;
        let results: Vec<(String, Result<ScanOutcome, TicketError>)> = stream::iter(batch.items)
            .map(|item| {
                let request = ScanRequest {
                    input: ScanInput::detect(item.clone()),
                    scanner,
                    scan_type: batch.scan_type,
                    location: batch.location.clone(),
                    device_info: batch.device_info.clone(),
                };
                async move { (item, self.validation.validate(request).await) }
            })
            .buffered(self.concurrency())
            .collect()
            .await;

        let mut report = BulkReport::new();
        for (item, result) in results {
            match result {
                Ok(ScanOutcome::Admitted(receipt)) => report.succeed(*receipt),
                Ok(ScanOutcome::Rejected(rejection)) => {
                    let ticket_code = rejection.ticket.map(|t| t.ticket_code);
                    let issue = BulkItemIssue::new(item, rejection.reason, ticket_code);
                    if rejection.reason == ReasonCode::AlreadyUsed {
                        report.skip(issue);
                    } else {
                        report.fail(issue);
                    }
                }
                Err(e) => report.fail(BulkItemIssue::from_error(item, &e)),
            }
        }
        let report = report.finish();
        info!(
            scanner = %scanner,
            total = report.summary.total,
            success = report.summary.success,
            skipped = report.summary.skipped,
            failed = report.summary.failed,
            "Bulk validation finished"
        );
        Ok(report)
    }
}
