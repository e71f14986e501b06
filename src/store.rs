//! Key layout for the single sled tree, plus transaction plumbing.
//!
//! Everything lives in the default tree under prefixed keys:
//!
//! - `case/<id>`                 case record (CBOR)
//! - `doc/<id>`                  review document
//! - `inbox/<id>`                inbox entry
//! - `inboxidx/<reviewer>/<id>`  reviewer-queue index, value = entry id
//! - `pending/<case>`            single-pending marker, value = entry id
//! - `audit/<case>/<seq>`        append-only stage log
//! - `jur/<id>`                  jurisdiction record
//! - `transfer/<id>`             ownership-transfer context
//! - `seq/<jur>/<year>`          case-number counter (u32 big-endian)

use crate::error::WorkflowError;
use sled::transaction::{ConflictableTransactionError, TransactionError};

pub fn case(id: &str) -> String {
    format!("case/{id}")
}

pub fn document(id: &str) -> String {
    format!("doc/{id}")
}

pub fn inbox_entry(id: &str) -> String {
    format!("inbox/{id}")
}

pub fn inbox_index(reviewer_id: &str, entry_id: &str) -> String {
    format!("inboxidx/{reviewer_id}/{entry_id}")
}

pub fn inbox_index_prefix(reviewer_id: &str) -> String {
    format!("inboxidx/{reviewer_id}/")
}

pub fn pending(case_id: &str) -> String {
    format!("pending/{case_id}")
}

// zero-padded so lexicographic scan order equals sequence order
pub fn audit(case_id: &str, seq: u32) -> String {
    format!("audit/{case_id}/{seq:08}")
}

pub fn audit_prefix(case_id: &str) -> String {
    format!("audit/{case_id}/")
}

pub fn jurisdiction(id: &str) -> String {
    format!("jur/{id}")
}

pub fn transfer(id: &str) -> String {
    format!("transfer/{id}")
}

// value = current owner id
pub fn parcel(id: &str) -> String {
    format!("parcel/{id}")
}

pub fn case_seq(jurisdiction_id: &str, year: i32) -> String {
    format!("seq/{jurisdiction_id}/{year}")
}

/// Collapses a sled transaction result into the service layer's
/// `anyhow::Result`, surfacing aborts as their typed `WorkflowError`.
pub fn unwrap_txn<T>(result: Result<T, TransactionError<WorkflowError>>) -> anyhow::Result<T> {
    match result {
        Ok(v) => Ok(v),
        Err(TransactionError::Abort(e)) => Err(e.into()),
        Err(TransactionError::Storage(e)) => Err(e.into()),
    }
}

/// CBOR-decode inside a transaction closure, aborting on corrupt bytes.
pub fn decode_tx<'b, T: minicbor::Decode<'b, ()>>(
    bytes: &'b [u8],
) -> Result<T, ConflictableTransactionError<WorkflowError>> {
    minicbor::decode(bytes)
        .map_err(|e| ConflictableTransactionError::Abort(WorkflowError::Codec(e.to_string())))
}

/// CBOR-encode inside a transaction closure.
pub fn encode_tx<T: minicbor::Encode<()>>(
    value: &T,
) -> Result<Vec<u8>, ConflictableTransactionError<WorkflowError>> {
    minicbor::to_vec(value)
        .map_err(|e| ConflictableTransactionError::Abort(WorkflowError::Codec(e.to_string())))
}
