//! Reviewer directory: per-jurisdiction registration and ordering.
//!
//! Registration invariants live here, not in the decision path: one final
//! authority per jurisdiction, authority registered before any approver,
//! an approver-capacity ceiling declared by the authority, and explicit
//! admin-supplied positions unique within the jurisdiction. Ordering is
//! stable under approver removal because positions are stored, not derived
//! from a live count.

use crate::error::WorkflowError;
use crate::store;
use sled::transaction::ConflictableTransactionError;
use std::sync::Arc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ApproverRecord {
    #[n(0)]
    pub reviewer_id: String,
    #[n(1)]
    pub position: u32,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct FinalAuthorityRecord {
    #[n(0)]
    pub reviewer_id: String,
    #[n(1)]
    pub approver_capacity: u32,
    #[n(2)]
    pub signature_ref: Option<String>, // on-file signature artifact
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Jurisdiction {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub approvers: Vec<ApproverRecord>,
    #[n(2)]
    pub final_authority: Option<FinalAuthorityRecord>,
}

/// Tagged reviewer role, matched exhaustively by the workflow engine in
/// place of string role comparisons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewerKind {
    Approver { position: u32 },
    FinalAuthority { signature_on_file: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedReviewer {
    pub reviewer_id: String,
    pub kind: ReviewerKind,
}

impl Jurisdiction {
    fn new(id: String) -> Self {
        Self {
            id,
            approvers: Vec::new(),
            final_authority: None,
        }
    }

    /// Approvers ascending by position, then the final authority if present.
    pub fn ordered_reviewers(&self) -> Vec<OrderedReviewer> {
        let mut out: Vec<OrderedReviewer> = self
            .approvers
            .iter()
            .map(|a| OrderedReviewer {
                reviewer_id: a.reviewer_id.clone(),
                kind: ReviewerKind::Approver {
                    position: a.position,
                },
            })
            .collect();
        out.sort_by_key(|r| match r.kind {
            ReviewerKind::Approver { position } => position,
            ReviewerKind::FinalAuthority { .. } => u32::MAX,
        });
        if let Some(fa) = &self.final_authority {
            out.push(OrderedReviewer {
                reviewer_id: fa.reviewer_id.clone(),
                kind: ReviewerKind::FinalAuthority {
                    signature_on_file: fa.signature_ref.is_some(),
                },
            });
        }
        out
    }

    pub fn membership(&self, reviewer_id: &str) -> Option<ReviewerKind> {
        if let Some(fa) = &self.final_authority {
            if fa.reviewer_id == reviewer_id {
                return Some(ReviewerKind::FinalAuthority {
                    signature_on_file: fa.signature_ref.is_some(),
                });
            }
        }
        self.approvers
            .iter()
            .find(|a| a.reviewer_id == reviewer_id)
            .map(|a| ReviewerKind::Approver {
                position: a.position,
            })
    }
}

pub struct ReviewerDirectory {
    instance: Arc<sled::Db>,
}

impl ReviewerDirectory {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self { instance }
    }

    pub fn load(&self, jurisdiction_id: &str) -> anyhow::Result<Jurisdiction> {
        let key = store::jurisdiction(jurisdiction_id);
        let Some(bytes) = self.instance.get(&key)? else {
            return Err(
                WorkflowError::not_found(format!("jurisdiction {jurisdiction_id}")).into(),
            );
        };
        Ok(minicbor::decode(&bytes)?)
    }

    /// Registers the single final-signature authority for a jurisdiction,
    /// creating the jurisdiction record when absent. The authority declares
    /// the approver-capacity ceiling up front.
    pub fn register_final_authority(
        &self,
        jurisdiction_id: &str,
        reviewer_id: &str,
        approver_capacity: u32,
        signature_ref: Option<String>,
    ) -> anyhow::Result<()> {
        if approver_capacity == 0 {
            return Err(
                WorkflowError::configuration("approver capacity must be at least 1").into(),
            );
        }
        self.mutate(jurisdiction_id, true, |jur| {
            if jur.final_authority.is_some() {
                return Err(WorkflowError::conflict(format!(
                    "jurisdiction {jurisdiction_id} already has a final authority"
                )));
            }
            jur.final_authority = Some(FinalAuthorityRecord {
                reviewer_id: reviewer_id.to_string(),
                approver_capacity,
                signature_ref: signature_ref.clone(),
            });
            Ok(())
        })
    }

    /// Registers an approver at an explicit position. Fails closed when the
    /// jurisdiction has no final authority yet, the capacity ceiling is
    /// reached, or the position is taken.
    pub fn register_approver(
        &self,
        jurisdiction_id: &str,
        reviewer_id: &str,
        position: u32,
    ) -> anyhow::Result<()> {
        if position == 0 {
            return Err(WorkflowError::configuration("positions start at 1").into());
        }
        self.mutate(jurisdiction_id, false, |jur| {
            let Some(fa) = &jur.final_authority else {
                return Err(WorkflowError::configuration(format!(
                    "jurisdiction {jurisdiction_id} has no final authority; register one first"
                )));
            };
            if fa.reviewer_id == reviewer_id {
                return Err(WorkflowError::conflict(
                    "final authority cannot also be an approver",
                ));
            }
            if jur.approvers.len() as u32 >= fa.approver_capacity {
                return Err(WorkflowError::configuration(format!(
                    "approver capacity ({}) reached for jurisdiction {jurisdiction_id}",
                    fa.approver_capacity
                )));
            }
            if jur.approvers.iter().any(|a| a.reviewer_id == reviewer_id) {
                return Err(WorkflowError::conflict(format!(
                    "reviewer {reviewer_id} is already registered"
                )));
            }
            if jur.approvers.iter().any(|a| a.position == position) {
                return Err(WorkflowError::conflict(format!(
                    "position {position} is already taken in jurisdiction {jurisdiction_id}"
                )));
            }
            jur.approvers.push(ApproverRecord {
                reviewer_id: reviewer_id.to_string(),
                position,
            });
            Ok(())
        })
    }

    /// Removes an approver. Remaining positions are left untouched; ordering
    /// tolerates gaps.
    pub fn remove_approver(&self, jurisdiction_id: &str, reviewer_id: &str) -> anyhow::Result<()> {
        self.mutate(jurisdiction_id, false, |jur| {
            let before = jur.approvers.len();
            jur.approvers.retain(|a| a.reviewer_id != reviewer_id);
            if jur.approvers.len() == before {
                return Err(WorkflowError::not_found(format!(
                    "approver {reviewer_id} in jurisdiction {jurisdiction_id}"
                )));
            }
            Ok(())
        })
    }

    /// Records the final authority's on-file signature artifact.
    pub fn set_signature(
        &self,
        jurisdiction_id: &str,
        reviewer_id: &str,
        signature_ref: &str,
    ) -> anyhow::Result<()> {
        self.mutate(jurisdiction_id, false, |jur| {
            match &mut jur.final_authority {
                Some(fa) if fa.reviewer_id == reviewer_id => {
                    fa.signature_ref = Some(signature_ref.to_string());
                    Ok(())
                }
                Some(_) => Err(WorkflowError::forbidden(
                    "only the final authority may file a signature",
                )),
                None => Err(WorkflowError::configuration(format!(
                    "jurisdiction {jurisdiction_id} has no final authority"
                ))),
            }
        })
    }

    pub fn ordered_reviewers(&self, jurisdiction_id: &str) -> anyhow::Result<Vec<OrderedReviewer>> {
        Ok(self.load(jurisdiction_id)?.ordered_reviewers())
    }

    /// Read-modify-write on the jurisdiction record inside one sled
    /// transaction, so concurrent registrations serialize instead of racing
    /// into the same position or capacity slot.
    fn mutate(
        &self,
        jurisdiction_id: &str,
        create_if_missing: bool,
        apply: impl Fn(&mut Jurisdiction) -> Result<(), WorkflowError>,
    ) -> anyhow::Result<()> {
        let key = store::jurisdiction(jurisdiction_id);
        let result = self.instance.transaction(|tx| {
            let mut jur = match tx.get(&key)? {
                Some(bytes) => minicbor::decode(&bytes).map_err(|e| {
                    ConflictableTransactionError::Abort(WorkflowError::Codec(e.to_string()))
                })?,
                None if create_if_missing => Jurisdiction::new(jurisdiction_id.to_string()),
                None => {
                    return Err(ConflictableTransactionError::Abort(
                        WorkflowError::not_found(format!("jurisdiction {jurisdiction_id}")),
                    ));
                }
            };
            apply(&mut jur).map_err(ConflictableTransactionError::Abort)?;
            let bytes = minicbor::to_vec(&jur).map_err(|e| {
                ConflictableTransactionError::Abort(WorkflowError::Codec(e.to_string()))
            })?;
            tx.insert(key.as_bytes(), bytes)?;
            Ok(())
        });
        store::unwrap_txn(result)
    }
}
