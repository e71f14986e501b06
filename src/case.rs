//! Core case record, review documents and timestamps.
use crate::error::WorkflowError;
use chrono::{DateTime, Datelike, TimeZone, Utc};

#[derive(Debug, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl<T: TimeZone> PartialEq for TimeStamp<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T: TimeZone> Eq for TimeStamp<T> {}

impl<T: TimeZone> PartialOrd for TimeStamp<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: TimeZone> Ord for TimeStamp<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    pub fn year(&self) -> i32 {
        self.0.year()
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Case lifecycle states. `Approved`, `Withdrawn` and `Expired` are terminal.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    InReview,
    #[n(2)]
    NeedsCorrection,
    #[n(3)]
    Resubmitted,
    #[n(4)]
    Approved,
    #[n(5)]
    Withdrawn,
    #[n(6)]
    Expired,
}

impl CaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Withdrawn | Self::Expired)
    }
    /// States in which a reviewer decision is admissible.
    pub fn awaits_decision(&self) -> bool {
        matches!(self, Self::InReview | Self::Resubmitted)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
}

/// Declared metadata for one uploaded file.
#[derive(Debug, Clone)]
pub struct DocumentMeta {
    pub title: String,
    pub doc_type: String,
}

/// Raw upload handed to the storage collaborator; never persisted itself.
#[derive(Debug, Clone)]
pub struct DocumentUpload {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ReviewDocument {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub case_id: String,
    #[n(2)]
    pub title: String,
    #[n(3)]
    pub doc_type: String,
    #[n(4)]
    pub storage_url: String,
    #[n(5)]
    pub content_digest: String, // sha256 of the uploaded bytes
    #[n(6)]
    pub status: DocumentStatus,
    #[n(7)]
    pub rejection_message: Option<String>,
    #[n(8)]
    pub superseded_by: Option<String>, // soft-retire back-reference, never deleted
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Case {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub applicant: String,
    #[n(2)]
    pub jurisdiction: String,
    #[n(3)]
    pub status: CaseStatus,
    #[n(4)]
    pub custodian: Option<String>,
    #[n(5)]
    pub rejecting_custodian: Option<String>,
    #[n(6)]
    pub case_number: Option<String>, // assigned once at finalization, then immutable
    #[n(7)]
    pub documents: Vec<String>,
    #[n(8)]
    pub next_seq: u32, // stage-log sequence, strictly increasing per case
    #[n(9)]
    pub created_at: TimeStamp<Utc>,
    #[n(10)]
    pub last_activity_at: TimeStamp<Utc>,
    #[n(11)]
    pub finalized_at: Option<TimeStamp<Utc>>,
    #[n(12)]
    pub signature_ref: Option<String>,
    #[n(13)]
    pub certificate_url: Option<String>,
}

impl Case {
    pub fn new(id: String, applicant: String, jurisdiction: String) -> Self {
        let now = TimeStamp::new();
        Self {
            id,
            applicant,
            jurisdiction,
            status: CaseStatus::Draft,
            custodian: None,
            rejecting_custodian: None,
            case_number: None,
            documents: Vec::new(),
            next_seq: 1,
            created_at: now.clone(),
            last_activity_at: now,
            finalized_at: None,
            signature_ref: None,
            certificate_url: None,
        }
    }

    /// Takes the next stage-log sequence number, advancing the counter.
    pub fn take_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn owns_document(&self, doc_id: &str) -> bool {
        self.documents.iter().any(|d| d == doc_id)
    }
}

/// Formats `COFO-<year>-<6-digit-zero-padded-sequence>`.
pub fn format_case_number(year: i32, seq: u32) -> String {
    format!("COFO-{year}-{seq:06}")
}

/// Checks the persisted case-number format, used by callers that re-ingest
/// numbers from external systems.
pub fn is_valid_case_number(s: &str) -> bool {
    let mut parts = s.splitn(3, '-');
    let (Some(tag), Some(year), Some(seq)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    tag == "COFO"
        && year.len() == 4
        && year.chars().all(|c| c.is_ascii_digit())
        && seq.len() == 6
        && seq.chars().all(|c| c.is_ascii_digit())
}

/// Non-empty rejection reasons are a hard rule: the text is persisted and
/// forwarded verbatim to the applicant.
pub fn require_reason(comment: &str) -> Result<(), WorkflowError> {
    if comment.trim().is_empty() {
        return Err(WorkflowError::precondition("rejection reason required"));
    }
    Ok(())
}
