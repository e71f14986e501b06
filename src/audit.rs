//! Append-only stage log.
//!
//! One entry per transition, keyed `audit/<case>/<seq>` with the sequence
//! taken from the case record inside the same transaction as the mutation it
//! records. Entries are never rewritten; the log is the source of truth for
//! what happened, who did it, and when.

use crate::case::TimeStamp;
use crate::store;
use chrono::Utc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageAction {
    #[n(0)]
    Submitted,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
    #[n(3)]
    Resubmitted,
    #[n(4)]
    Finalized,
    #[n(5)]
    Withdrawn,
    #[n(6)]
    Expired,
    #[n(7)]
    OwnershipTransferred,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorRole {
    #[n(0)]
    Applicant,
    #[n(1)]
    Approver,
    #[n(2)]
    FinalAuthority,
    #[n(3)]
    System,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct StageLogEntry {
    #[n(0)]
    pub case_id: String,
    #[n(1)]
    pub seq: u32,
    #[n(2)]
    pub actor: String,
    #[n(3)]
    pub role: ActorRole,
    #[n(4)]
    pub action: StageAction,
    #[n(5)]
    pub comment: Option<String>,
    #[n(6)]
    pub recorded_at: TimeStamp<Utc>,
    /// When this stage began waiting on the actor. For a reviewer decision
    /// this is the consumed inbox entry's creation time; for actions the
    /// actor initiated themselves it equals `recorded_at`.
    #[n(7)]
    pub arrived_at: TimeStamp<Utc>,
}

impl StageLogEntry {
    pub fn new(
        case_id: String,
        seq: u32,
        actor: String,
        role: ActorRole,
        action: StageAction,
        comment: Option<String>,
    ) -> Self {
        let now = TimeStamp::new();
        Self {
            case_id,
            seq,
            actor,
            role,
            action,
            comment,
            recorded_at: now.clone(),
            arrived_at: now,
        }
    }

    pub fn with_arrival(mut self, arrived_at: TimeStamp<Utc>) -> Self {
        self.arrived_at = arrived_at;
        self
    }
}

/// Full history for a case in sequence order.
pub fn case_history(db: &sled::Db, case_id: &str) -> anyhow::Result<Vec<StageLogEntry>> {
    let mut out = Vec::new();
    for item in db.scan_prefix(store::audit_prefix(case_id)) {
        let (_, bytes) = item?;
        out.push(minicbor::decode(&bytes)?);
    }
    Ok(out)
}
