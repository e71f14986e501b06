//! Durable per-reviewer work queue.
//!
//! An `InboxEntry` is the marker that a reviewer owes a decision on a case.
//! The `pending/<case>` key holds the id of the one entry that may be
//! `Pending` at a time; decision transactions consume it, which is what makes
//! a racing decision on the same turn lose deterministically.

use crate::case::TimeStamp;
use crate::store;
use chrono::Utc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Completed,
    #[n(2)]
    Rejected,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct InboxEntry {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub receiver: String, // reviewer the turn belongs to
    #[n(2)]
    pub case_id: String,
    #[n(3)]
    pub status: InboxStatus,
    #[n(4)]
    pub created_at: TimeStamp<Utc>,
    #[n(5)]
    pub link: String, // human-readable pointer for the reviewer's worklist
}

impl InboxEntry {
    pub fn new(id: String, receiver: String, case_id: String) -> Self {
        let link = format!("/cases/{case_id}/review");
        Self {
            id,
            receiver,
            case_id,
            status: InboxStatus::Pending,
            created_at: TimeStamp::new(),
            link,
        }
    }
}

/// Pending entries addressed to a reviewer, oldest first by entry id
/// (entry ids are uuid7-based, so the index scan is already time-ordered).
pub fn reviewer_inbox(db: &sled::Db, reviewer_id: &str) -> anyhow::Result<Vec<InboxEntry>> {
    let mut out = Vec::new();
    for item in db.scan_prefix(store::inbox_index_prefix(reviewer_id)) {
        let (_, entry_id) = item?;
        let entry_id = String::from_utf8_lossy(&entry_id).to_string();
        if let Some(bytes) = db.get(store::inbox_entry(&entry_id))? {
            let entry: InboxEntry = minicbor::decode(&bytes)?;
            if entry.status == InboxStatus::Pending {
                out.push(entry);
            }
        }
    }
    Ok(out)
}
