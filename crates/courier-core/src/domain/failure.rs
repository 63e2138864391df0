//! Failure metadata carried on the retry topic.
//!
//! A failed record is forwarded with its original envelope as the value and
//! these headers:
//! - `dead-letter-reason`: failure class
//! - `dead-letter-cause`: failure detail
//! - `dead-letter-schedule`: optional RFC 3339 redelivery instant
//! - `dead-letter-disposition`: `retry` or `quarantine`

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::HandlerError;

pub const REASON_HEADER: &str = "dead-letter-reason";
pub const CAUSE_HEADER: &str = "dead-letter-cause";
pub const SCHEDULE_HEADER: &str = "dead-letter-schedule";
pub const DISPOSITION_HEADER: &str = "dead-letter-disposition";

/// Per-record broker headers.
pub type Headers = BTreeMap<String, String>;

/// What the failing side asks the retry coordinator to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Retry within the budget.
    Retry,
    /// Skip the budget and hospitalize.
    Quarantine,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Retry => "retry",
            Disposition::Quarantine => "quarantine",
        }
    }

    /// Unknown values fall back to `Retry`.
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("quarantine") {
            Disposition::Quarantine
        } else {
            Disposition::Retry
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub reason: String,
    pub cause: String,
    pub schedule: Option<DateTime<Utc>>,
    pub disposition: Disposition,
}

impl FailureReport {
    /// Classifies a handler failure.
    ///
    /// Fatal failures are always quarantined. Poison messages are retried
    /// like business failures unless `quarantine_poison` is set.
    pub fn from_error(err: &HandlerError, quarantine_poison: bool) -> Self {
        let (schedule, disposition) = match err {
            HandlerError::Retryable { reschedule_at, .. } => (*reschedule_at, Disposition::Retry),
            HandlerError::Fatal { .. } => (None, Disposition::Quarantine),
            HandlerError::Poison(_) if quarantine_poison => (None, Disposition::Quarantine),
            HandlerError::Poison(_) => (None, Disposition::Retry),
        };
        Self {
            reason: err.reason(),
            cause: err.cause(),
            schedule,
            disposition,
        }
    }

    pub fn to_headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.insert(REASON_HEADER.to_string(), self.reason.clone());
        headers.insert(CAUSE_HEADER.to_string(), self.cause.clone());
        if let Some(at) = self.schedule {
            headers.insert(SCHEDULE_HEADER.to_string(), at.to_rfc3339());
        }
        headers.insert(
            DISPOSITION_HEADER.to_string(),
            self.disposition.as_str().to_string(),
        );
        headers
    }

    /// Reads the report back. Missing reason/cause become `"Unknown"` and an
    /// unparseable schedule is ignored, so a half-written record still flows
    /// through the retry path instead of being lost.
    pub fn from_headers(headers: &Headers) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .cloned()
                .unwrap_or_else(|| "Unknown".to_string())
        };
        let schedule = headers
            .get(SCHEDULE_HEADER)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc));
        let disposition = headers
            .get(DISPOSITION_HEADER)
            .map(|raw| Disposition::parse(raw))
            .unwrap_or(Disposition::Retry);

        Self {
            reason: text(REASON_HEADER),
            cause: text(CAUSE_HEADER),
            schedule,
            disposition,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;
    use crate::error::CodecError;

    #[rstest]
    #[case(HandlerError::retryable("Timeout", "slow"), false, Disposition::Retry)]
    #[case(HandlerError::fatal("Invalid", "bad"), false, Disposition::Quarantine)]
    #[case(HandlerError::Poison(CodecError::UnknownPayloadType("x".into())), false, Disposition::Retry)]
    #[case(HandlerError::Poison(CodecError::UnknownPayloadType("x".into())), true, Disposition::Quarantine)]
    fn classification(
        #[case] err: HandlerError,
        #[case] quarantine_poison: bool,
        #[case] expected: Disposition,
    ) {
        let report = FailureReport::from_error(&err, quarantine_poison);
        assert_eq!(report.disposition, expected);
    }

    #[test]
    fn headers_carry_reason_cause_and_schedule() {
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let err = HandlerError::retryable("Timeout", "upstream slow").reschedule_at(at);
        let report = FailureReport::from_error(&err, false);

        let headers = report.to_headers();
        assert_eq!(headers[REASON_HEADER], "Timeout");
        assert_eq!(headers[CAUSE_HEADER], "upstream slow");
        assert_eq!(headers[DISPOSITION_HEADER], "retry");

        assert_eq!(FailureReport::from_headers(&headers), report);
    }

    #[test]
    fn missing_headers_default_to_retry() {
        let mut headers = Headers::new();
        headers.insert(SCHEDULE_HEADER.to_string(), "not-a-date".to_string());

        let report = FailureReport::from_headers(&headers);
        assert_eq!(report.reason, "Unknown");
        assert_eq!(report.schedule, None);
        assert_eq!(report.disposition, Disposition::Retry);
    }
}
