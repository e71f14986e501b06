//! Service layer API for case workflow operations.
//!
//! Every state transition runs its critical section inside one sled
//! transaction that re-checks case status and the pending-inbox marker, so a
//! concurrent decision on an already-consumed turn fails deterministically.
//! Notifications and certificate rendering happen strictly after commit and
//! are best-effort.

use crate::audit::{ActorRole, StageAction, StageLogEntry, case_history};
use crate::case::{
    Case, CaseStatus, DocumentMeta, DocumentStatus, DocumentUpload, ReviewDocument, TimeStamp,
    format_case_number, require_reason,
};
use crate::collab::{CertificateRenderer, DocumentStorage, DocumentValidation, Notifier};
use crate::config::WorkflowConfig;
use crate::directory::{OrderedReviewer, ReviewerDirectory, ReviewerKind};
use crate::error::WorkflowError;
use crate::ids;
use crate::inbox::{InboxEntry, InboxStatus, reviewer_inbox};
use crate::store;
use chrono::Utc;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject { comment: String },
}

/// A replacement for one previously rejected document.
pub struct DocumentResubmission {
    pub document_id: String,
    pub meta: DocumentMeta,
    pub file: DocumentUpload,
}

/// Per-item outcome of a batch finalization.
#[derive(Debug)]
pub struct BatchItemResult {
    pub case_id: String,
    pub result: anyhow::Result<Case>,
}

struct NotificationIntent {
    to: String,
    subject: String,
    body: String,
}

// what the decision transaction committed, driving post-commit side effects
struct DecisionOutcome {
    case: Case,
    advanced_to: Option<String>,
    finalized: bool,
    rejection_comment: Option<String>,
}

pub struct WorkflowService {
    instance: Arc<sled::Db>,
    directory: ReviewerDirectory,
    config: WorkflowConfig,
    validation: Arc<dyn DocumentValidation>,
    storage: Arc<dyn DocumentStorage>,
    notifier: Arc<dyn Notifier>,
    renderer: Arc<dyn CertificateRenderer>,
}

impl WorkflowService {
    pub fn new(
        instance: Arc<sled::Db>,
        config: WorkflowConfig,
        validation: Arc<dyn DocumentValidation>,
        storage: Arc<dyn DocumentStorage>,
        notifier: Arc<dyn Notifier>,
        renderer: Arc<dyn CertificateRenderer>,
    ) -> Self {
        let directory = ReviewerDirectory::new(instance.clone());
        Self {
            instance,
            directory,
            config,
            validation,
            storage,
            notifier,
            renderer,
        }
    }

    pub fn directory(&self) -> &ReviewerDirectory {
        &self.directory
    }

    /// Reaction to a verified payment/eligibility signal: creates the
    /// pipeline-eligible case in its pre-pipeline state.
    pub fn open_case(&self, applicant_id: &str, jurisdiction_id: &str) -> anyhow::Result<Case> {
        // fail closed before creating anything if the jurisdiction is unknown
        self.directory.load(jurisdiction_id)?;

        let case = Case::new(
            ids::new_id("case_")?,
            applicant_id.to_string(),
            jurisdiction_id.to_string(),
        );
        self.instance
            .insert(store::case(&case.id), minicbor::to_vec(&case)?)?;
        Ok(case)
    }

    pub fn load_case(&self, case_id: &str) -> anyhow::Result<Case> {
        let Some(bytes) = self.instance.get(store::case(case_id))? else {
            return Err(WorkflowError::not_found(format!("case {case_id}")).into());
        };
        Ok(minicbor::decode(&bytes)?)
    }

    pub fn load_document(&self, document_id: &str) -> anyhow::Result<ReviewDocument> {
        let Some(bytes) = self.instance.get(store::document(document_id))? else {
            return Err(WorkflowError::not_found(format!("document {document_id}")).into());
        };
        Ok(minicbor::decode(&bytes)?)
    }

    pub fn case_history(&self, case_id: &str) -> anyhow::Result<Vec<StageLogEntry>> {
        case_history(&self.instance, case_id)
    }

    pub fn reviewer_inbox(&self, reviewer_id: &str) -> anyhow::Result<Vec<InboxEntry>> {
        reviewer_inbox(&self.instance, reviewer_id)
    }

    /// Submit a drafted case into the review pipeline.
    ///
    /// The metadata count must equal the file count before any storage call
    /// is made; the first reviewer receives the case in the same transaction
    /// that flips the status.
    pub fn submit_case(
        &self,
        case_id: &str,
        applicant_id: &str,
        metas: &[DocumentMeta],
        files: &[DocumentUpload],
    ) -> anyhow::Result<Case> {
        let case = self.load_case(case_id)?;
        if case.applicant != applicant_id {
            return Err(WorkflowError::forbidden("only the applicant may submit").into());
        }
        if case.status != CaseStatus::Draft {
            return Err(WorkflowError::precondition(format!(
                "case is not in a submittable state: {:?}",
                case.status
            ))
            .into());
        }
        if metas.len() != files.len() {
            return Err(WorkflowError::precondition(format!(
                "document metadata count ({}) does not match file count ({})",
                metas.len(),
                files.len()
            ))
            .into());
        }

        let ordered = self.directory.ordered_reviewers(&case.jurisdiction)?;
        let first = first_approver(&ordered, &case.jurisdiction)?;

        let documents = self.validate_and_store(case_id, metas, files)?;
        let entry = InboxEntry::new(
            ids::new_id("ibx_")?,
            first.reviewer_id.clone(),
            case_id.to_string(),
        );

        let case_key = store::case(case_id);
        let committed = store::unwrap_txn(self.instance.transaction(
            |tx| -> ConflictableTransactionResult<Case, WorkflowError> {
                let Some(bytes) = tx.get(&case_key)? else {
                    return abort(WorkflowError::not_found(format!("case {case_id}")));
                };
                let mut case: Case = store::decode_tx(&bytes)?;
                if case.status != CaseStatus::Draft {
                    // someone else submitted while we were uploading
                    return abort(WorkflowError::conflict("case already submitted"));
                }

                for doc in &documents {
                    tx.insert(store::document(&doc.id).as_bytes(), store::encode_tx(doc)?)?;
                    case.documents.push(doc.id.clone());
                }

                case.status = CaseStatus::InReview;
                case.custodian = Some(entry.receiver.clone());
                case.last_activity_at = TimeStamp::new();
                let log = StageLogEntry::new(
                    case.id.clone(),
                    case.take_seq(),
                    applicant_id.to_string(),
                    ActorRole::Applicant,
                    StageAction::Submitted,
                    None,
                );
                tx.insert(
                    store::audit(&case.id, log.seq).as_bytes(),
                    store::encode_tx(&log)?,
                )?;

                write_pending_entry(tx, &entry)?;
                tx.insert(case_key.as_bytes(), store::encode_tx(&case)?)?;
                Ok(case)
            },
        ))?;

        self.dispatch(vec![NotificationIntent {
            to: first.reviewer_id.clone(),
            subject: "Case awaiting your review".into(),
            body: format!("Case {case_id} has been submitted and awaits your decision."),
        }]);

        Ok(committed)
    }

    /// A reviewer's decision on the case currently in their custody.
    pub fn decide(
        &self,
        case_id: &str,
        reviewer_id: &str,
        decision: Decision,
    ) -> anyhow::Result<Case> {
        let case = self.load_case(case_id)?;
        let jur = self.directory.load(&case.jurisdiction)?;

        if jur.membership(reviewer_id).is_none() {
            return Err(WorkflowError::forbidden(format!(
                "reviewer {reviewer_id} is not a member of jurisdiction {}",
                case.jurisdiction
            ))
            .into());
        }
        if let Decision::Reject { comment } = &decision {
            require_reason(comment)?;
        }
        // a missing signature is checked inside the transaction, after the
        // turn is known to belong to this reviewer

        let ordered = jur.ordered_reviewers();
        let signature_ref = jur.final_authority.as_ref().and_then(|fa| fa.signature_ref.clone());
        let next_entry_id = ids::new_id("ibx_")?;

        let outcome = self.run_decision_txn(
            case_id,
            reviewer_id,
            &decision,
            &ordered,
            signature_ref.as_deref(),
            &next_entry_id,
        )?;

        let mut intents = Vec::new();
        if let Some(comment) = &outcome.rejection_comment {
            intents.push(NotificationIntent {
                to: outcome.case.applicant.clone(),
                subject: "Your application needs correction".into(),
                body: comment.clone(),
            });
        }
        if let Some(next) = &outcome.advanced_to {
            intents.push(NotificationIntent {
                to: next.clone(),
                subject: "Case awaiting your review".into(),
                body: format!("Case {case_id} has been handed to you for review."),
            });
        }

        let mut committed = outcome.case;
        if outcome.finalized {
            // certificate rendering is best-effort; the approval stands
            match self.renderer.render(&committed) {
                Ok(url) => {
                    if let Err(err) = self.record_certificate(case_id, &url) {
                        tracing::warn!(case = %case_id, %err, "failed to record certificate url");
                    } else {
                        committed.certificate_url = Some(url);
                    }
                }
                Err(err) => {
                    tracing::warn!(case = %case_id, %err, "certificate rendering failed");
                }
            }
            intents.push(NotificationIntent {
                to: committed.applicant.clone(),
                subject: "Your certificate has been approved".into(),
                body: format!(
                    "Case {case_id} was approved under number {}.",
                    committed.case_number.as_deref().unwrap_or("(unassigned)")
                ),
            });
        }
        self.dispatch(intents);

        Ok(committed)
    }

    fn run_decision_txn(
        &self,
        case_id: &str,
        reviewer_id: &str,
        decision: &Decision,
        ordered: &[OrderedReviewer],
        signature_ref: Option<&str>,
        next_entry_id: &str,
    ) -> anyhow::Result<DecisionOutcome> {
        let case_key = store::case(case_id);
        store::unwrap_txn(self.instance.transaction(
            |tx| -> ConflictableTransactionResult<DecisionOutcome, WorkflowError> {
                let Some(bytes) = tx.get(&case_key)? else {
                    return abort(WorkflowError::not_found(format!("case {case_id}")));
                };
                let mut case: Case = store::decode_tx(&bytes)?;
                if case.status == CaseStatus::Approved {
                    return abort(WorkflowError::conflict("case already finalized"));
                }
                if !case.status.awaits_decision() {
                    return abort(WorkflowError::precondition(format!(
                        "case is not awaiting review: {:?}",
                        case.status
                    )));
                }

                // single-pending anchor: consume this case's open turn
                let Some(entry_id) = tx.get(store::pending(case_id))? else {
                    return abort(WorkflowError::conflict("no open review turn for this case"));
                };
                let entry_id = String::from_utf8_lossy(&entry_id).to_string();
                let entry_key = store::inbox_entry(&entry_id);
                let Some(entry_bytes) = tx.get(&entry_key)? else {
                    return abort(WorkflowError::not_found(format!("inbox entry {entry_id}")));
                };
                let mut entry: InboxEntry = store::decode_tx(&entry_bytes)?;
                if entry.receiver != reviewer_id {
                    return abort(WorkflowError::forbidden("no pending review for you"));
                }
                if entry.status != InboxStatus::Pending {
                    return abort(WorkflowError::conflict("review turn already resolved"));
                }

                let (action, comment) = match decision {
                    Decision::Approve => (StageAction::Approved, None),
                    Decision::Reject { comment } => {
                        (StageAction::Rejected, Some(comment.clone()))
                    }
                };
                let role = role_of(ordered, reviewer_id);
                let log = StageLogEntry::new(
                    case.id.clone(),
                    case.take_seq(),
                    reviewer_id.to_string(),
                    role,
                    action,
                    comment.clone(),
                )
                .with_arrival(entry.created_at.clone());
                tx.insert(
                    store::audit(&case.id, log.seq).as_bytes(),
                    store::encode_tx(&log)?,
                )?;

                entry.status = match decision {
                    Decision::Approve => InboxStatus::Completed,
                    Decision::Reject { .. } => InboxStatus::Rejected,
                };
                tx.insert(entry_key.as_bytes(), store::encode_tx(&entry)?)?;
                tx.remove(store::pending(case_id).as_bytes())?;

                case.last_activity_at = TimeStamp::new();

                match decision {
                    Decision::Reject { comment } => {
                        // resubmission routes back to the same reviewer
                        case.status = CaseStatus::NeedsCorrection;
                        case.rejecting_custodian = Some(reviewer_id.to_string());
                        case.custodian = Some(reviewer_id.to_string());
                        tx.insert(case_key.as_bytes(), store::encode_tx(&case)?)?;
                        Ok(DecisionOutcome {
                            case,
                            advanced_to: None,
                            finalized: false,
                            rejection_comment: Some(comment.clone()),
                        })
                    }
                    Decision::Approve => {
                        let idx = ordered
                            .iter()
                            .position(|r| r.reviewer_id == reviewer_id)
                            .ok_or_else(|| {
                                ConflictableTransactionError::Abort(WorkflowError::forbidden(
                                    "reviewer is not part of the pipeline",
                                ))
                            })?;
                        match &ordered[idx].kind {
                            ReviewerKind::FinalAuthority { .. } => {
                                finalize_case(
                                    tx,
                                    &case_key,
                                    &mut case,
                                    reviewer_id,
                                    signature_ref,
                                    entry.created_at.clone(),
                                )?;
                                Ok(DecisionOutcome {
                                    case,
                                    advanced_to: None,
                                    finalized: true,
                                    rejection_comment: None,
                                })
                            }
                            ReviewerKind::Approver { .. } => match ordered.get(idx + 1) {
                                Some(next) => {
                                    let next_entry = InboxEntry::new(
                                        next_entry_id.to_string(),
                                        next.reviewer_id.clone(),
                                        case.id.clone(),
                                    );
                                    write_pending_entry(tx, &next_entry)?;
                                    case.status = CaseStatus::InReview;
                                    case.custodian = Some(next.reviewer_id.clone());
                                    tx.insert(case_key.as_bytes(), store::encode_tx(&case)?)?;
                                    Ok(DecisionOutcome {
                                        case,
                                        advanced_to: Some(next.reviewer_id.clone()),
                                        finalized: false,
                                        rejection_comment: None,
                                    })
                                }
                                // approver pipeline exhausted with nobody to sign:
                                // abort so the case stays parked in review
                                None => abort(WorkflowError::configuration(
                                    "no final authority configured; cannot finalize",
                                )),
                            },
                        }
                    }
                }
            },
        ))
    }

    /// Applicant resubmits corrected documents after a rejection. The case
    /// re-enters the pipeline at the rejecting reviewer, not from the start.
    pub fn resubmit(
        &self,
        case_id: &str,
        applicant_id: &str,
        resubmissions: &[DocumentResubmission],
    ) -> anyhow::Result<Case> {
        let case = self.load_case(case_id)?;
        if case.applicant != applicant_id {
            return Err(WorkflowError::forbidden("only the applicant may resubmit").into());
        }
        if case.status != CaseStatus::NeedsCorrection {
            return Err(WorkflowError::precondition(format!(
                "case is not awaiting correction: {:?}",
                case.status
            ))
            .into());
        }
        let Some(reviewer) = case.rejecting_custodian.clone() else {
            return Err(WorkflowError::precondition("no reviewer to resend to").into());
        };
        for r in resubmissions {
            if !case.owns_document(&r.document_id) {
                return Err(WorkflowError::forbidden(format!(
                    "document {} does not belong to case {case_id}",
                    r.document_id
                ))
                .into());
            }
        }

        // validate and upload replacements before touching any state
        let metas: Vec<DocumentMeta> = resubmissions.iter().map(|r| r.meta.clone()).collect();
        let files: Vec<DocumentUpload> = resubmissions.iter().map(|r| r.file.clone()).collect();
        let replacements = self.validate_and_store(case_id, &metas, &files)?;
        let replaced: Vec<(String, ReviewDocument)> = resubmissions
            .iter()
            .zip(replacements)
            .map(|(r, doc)| (r.document_id.clone(), doc))
            .collect();

        let entry = InboxEntry::new(ids::new_id("ibx_")?, reviewer.clone(), case_id.to_string());
        let case_key = store::case(case_id);

        let committed = store::unwrap_txn(self.instance.transaction(
            |tx| -> ConflictableTransactionResult<Case, WorkflowError> {
                let Some(bytes) = tx.get(&case_key)? else {
                    return abort(WorkflowError::not_found(format!("case {case_id}")));
                };
                let mut case: Case = store::decode_tx(&bytes)?;
                if case.status != CaseStatus::NeedsCorrection {
                    return abort(WorkflowError::conflict("case was already resubmitted"));
                }

                for (old_id, new_doc) in &replaced {
                    // soft-retire the superseded document, keep it for audit
                    let old_key = store::document(old_id);
                    let Some(old_bytes) = tx.get(&old_key)? else {
                        return abort(WorkflowError::not_found(format!("document {old_id}")));
                    };
                    let mut old: ReviewDocument = store::decode_tx(&old_bytes)?;
                    old.superseded_by = Some(new_doc.id.clone());
                    tx.insert(old_key.as_bytes(), store::encode_tx(&old)?)?;
                    tx.insert(
                        store::document(&new_doc.id).as_bytes(),
                        store::encode_tx(new_doc)?,
                    )?;
                    if let Some(slot) = case.documents.iter_mut().find(|d| *d == old_id) {
                        *slot = new_doc.id.clone();
                    }
                }

                case.status = CaseStatus::Resubmitted;
                case.custodian = Some(entry.receiver.clone());
                case.last_activity_at = TimeStamp::new();
                let log = StageLogEntry::new(
                    case.id.clone(),
                    case.take_seq(),
                    case.applicant.clone(),
                    ActorRole::Applicant,
                    StageAction::Resubmitted,
                    None,
                );
                tx.insert(
                    store::audit(&case.id, log.seq).as_bytes(),
                    store::encode_tx(&log)?,
                )?;
                write_pending_entry(tx, &entry)?;
                tx.insert(case_key.as_bytes(), store::encode_tx(&case)?)?;
                Ok(case)
            },
        ))?;

        self.dispatch(vec![NotificationIntent {
            to: reviewer,
            subject: "Corrected case awaiting your review".into(),
            body: format!("Case {case_id} was resubmitted with corrections."),
        }]);

        Ok(committed)
    }

    /// Per-document decision by the current custodian. Independent of the
    /// case-level cycle: rejecting a document does not move the case.
    pub fn review_document(
        &self,
        case_id: &str,
        reviewer_id: &str,
        document_id: &str,
        status: DocumentStatus,
        message: Option<String>,
    ) -> anyhow::Result<ReviewDocument> {
        let case = self.load_case(case_id)?;
        if case.custodian.as_deref() != Some(reviewer_id) {
            return Err(WorkflowError::forbidden("case is not in your custody").into());
        }
        if !case.status.awaits_decision() {
            return Err(WorkflowError::precondition(format!(
                "case is not under review: {:?}",
                case.status
            ))
            .into());
        }
        if !case.owns_document(document_id) {
            return Err(WorkflowError::not_found(format!(
                "document {document_id} on case {case_id}"
            ))
            .into());
        }
        if status == DocumentStatus::Pending {
            return Err(
                WorkflowError::precondition("a document review cannot reset to pending").into(),
            );
        }

        let doc_key = store::document(document_id);
        store::unwrap_txn(self.instance.transaction(
            |tx| -> ConflictableTransactionResult<ReviewDocument, WorkflowError> {
                let Some(bytes) = tx.get(&doc_key)? else {
                    return abort(WorkflowError::not_found(format!("document {document_id}")));
                };
                let mut doc: ReviewDocument = store::decode_tx(&bytes)?;
                doc.status = status;
                doc.rejection_message = if status == DocumentStatus::Rejected {
                    message.clone()
                } else {
                    None
                };
                tx.insert(doc_key.as_bytes(), store::encode_tx(&doc)?)?;
                Ok(doc)
            },
        ))
    }

    /// Applicant withdraws a case; any open review turn is resolved.
    pub fn withdraw(&self, case_id: &str, applicant_id: &str) -> anyhow::Result<Case> {
        let case = self.load_case(case_id)?;
        if case.applicant != applicant_id {
            return Err(WorkflowError::forbidden("only the applicant may withdraw").into());
        }
        if case.status.is_terminal() {
            return Err(WorkflowError::precondition(format!(
                "case is already closed: {:?}",
                case.status
            ))
            .into());
        }
        self.close_case(
            case_id,
            applicant_id,
            ActorRole::Applicant,
            StageAction::Withdrawn,
            CaseStatus::Withdrawn,
        )
    }

    /// Lazily expires a case parked in review longer than the configured
    /// TTL. Returns `false` when nothing applied (TTL unset, wrong status,
    /// not yet stale).
    pub fn expire_if_stale(&self, case_id: &str) -> anyhow::Result<bool> {
        let Some(ttl) = self.config.stale_review_ttl else {
            return Ok(false);
        };
        let case = self.load_case(case_id)?;
        if !case.status.awaits_decision() {
            return Ok(false);
        }
        let age = Utc::now() - case.last_activity_at.to_datetime_utc();
        if age < ttl {
            return Ok(false);
        }
        self.close_case(
            case_id,
            "system",
            ActorRole::System,
            StageAction::Expired,
            CaseStatus::Expired,
        )?;
        Ok(true)
    }

    /// Final authority signs a batch of cases at once. Validation is
    /// all-or-nothing before any mutation; finalization is then isolated
    /// per item.
    pub fn finalize_batch(
        &self,
        jurisdiction_id: &str,
        authority_id: &str,
        case_ids: &[String],
    ) -> anyhow::Result<Vec<BatchItemResult>> {
        let jur = self.directory.load(jurisdiction_id)?;
        match &jur.final_authority {
            Some(fa) if fa.reviewer_id == authority_id => {
                if fa.signature_ref.is_none() {
                    return Err(WorkflowError::precondition(
                        "final authority has no signature artifact on file",
                    )
                    .into());
                }
            }
            _ => {
                return Err(WorkflowError::forbidden(
                    "caller is not the final authority for this jurisdiction",
                )
                .into());
            }
        }

        // all-or-nothing validation pass, zero mutations on any failure
        for case_id in case_ids {
            let case = self.load_case(case_id)?;
            if case.jurisdiction != jurisdiction_id {
                return Err(WorkflowError::forbidden(format!(
                    "case {case_id} belongs to another jurisdiction"
                ))
                .into());
            }
            if !case.status.awaits_decision() || case.custodian.as_deref() != Some(authority_id) {
                return Err(WorkflowError::precondition(format!(
                    "case {case_id} is not awaiting this authority's decision"
                ))
                .into());
            }
        }

        // per-item isolation: one failure must not block the rest
        let mut results = Vec::with_capacity(case_ids.len());
        for case_id in case_ids {
            let result = self.decide(case_id, authority_id, Decision::Approve);
            results.push(BatchItemResult {
                case_id: case_id.clone(),
                result,
            });
        }
        Ok(results)
    }

    // validation gate then storage, in that order; a storage failure is
    // fatal to the attempt and nothing has been persisted yet
    fn validate_and_store(
        &self,
        case_id: &str,
        metas: &[DocumentMeta],
        files: &[DocumentUpload],
    ) -> anyhow::Result<Vec<ReviewDocument>> {
        for file in files {
            self.validation
                .validate(&file.bytes, &file.filename, &file.mime_type)
                .map_err(|e| WorkflowError::precondition(format!("document validation: {e}")))?;
        }
        let mut documents = Vec::with_capacity(files.len());
        for (meta, file) in metas.iter().zip(files) {
            let url = self
                .storage
                .store(&file.bytes, &file.filename, &file.mime_type, case_id)
                .map_err(|e| WorkflowError::UpstreamFailure(format!("document storage: {e}")))?;
            documents.push(ReviewDocument {
                id: ids::new_id("doc_")?,
                case_id: case_id.to_string(),
                title: meta.title.clone(),
                doc_type: meta.doc_type.clone(),
                storage_url: url,
                content_digest: sha256::digest(&file.bytes),
                status: DocumentStatus::Pending,
                rejection_message: None,
                superseded_by: None,
            });
        }
        Ok(documents)
    }

    fn close_case(
        &self,
        case_id: &str,
        actor: &str,
        role: ActorRole,
        action: StageAction,
        status: CaseStatus,
    ) -> anyhow::Result<Case> {
        let case_key = store::case(case_id);
        store::unwrap_txn(self.instance.transaction(
            |tx| -> ConflictableTransactionResult<Case, WorkflowError> {
                let Some(bytes) = tx.get(&case_key)? else {
                    return abort(WorkflowError::not_found(format!("case {case_id}")));
                };
                let mut case: Case = store::decode_tx(&bytes)?;
                if case.status.is_terminal() {
                    return abort(WorkflowError::conflict("case already closed"));
                }
                resolve_open_turn(tx, case_id)?;
                case.status = status;
                case.custodian = None;
                case.last_activity_at = TimeStamp::new();
                let log = StageLogEntry::new(
                    case.id.clone(),
                    case.take_seq(),
                    actor.to_string(),
                    role,
                    action,
                    None,
                );
                tx.insert(
                    store::audit(&case.id, log.seq).as_bytes(),
                    store::encode_tx(&log)?,
                )?;
                tx.insert(case_key.as_bytes(), store::encode_tx(&case)?)?;
                Ok(case)
            },
        ))
    }

    fn record_certificate(&self, case_id: &str, url: &str) -> anyhow::Result<()> {
        let case_key = store::case(case_id);
        store::unwrap_txn(self.instance.transaction(
            |tx| -> ConflictableTransactionResult<(), WorkflowError> {
                let Some(bytes) = tx.get(&case_key)? else {
                    return abort(WorkflowError::not_found(format!("case {case_id}")));
                };
                let mut case: Case = store::decode_tx(&bytes)?;
                case.certificate_url = Some(url.to_string());
                tx.insert(case_key.as_bytes(), store::encode_tx(&case)?)?;
                Ok(())
            },
        ))
    }

    // fire-and-forget: a flaky provider never rolls back a committed change
    fn dispatch(&self, intents: Vec<NotificationIntent>) {
        for intent in intents {
            if let Err(err) = self
                .notifier
                .send(&intent.to, &intent.subject, &intent.body)
            {
                tracing::warn!(to = %intent.to, subject = %intent.subject, %err,
                    "notification delivery failed");
            }
        }
    }
}

fn abort<T>(err: WorkflowError) -> ConflictableTransactionResult<T, WorkflowError> {
    Err(ConflictableTransactionError::Abort(err))
}

fn first_approver<'a>(
    ordered: &'a [OrderedReviewer],
    jurisdiction_id: &str,
) -> anyhow::Result<&'a OrderedReviewer> {
    match ordered.first() {
        Some(first) if matches!(first.kind, ReviewerKind::Approver { .. }) => Ok(first),
        _ => Err(WorkflowError::configuration(format!(
            "no approvers configured for jurisdiction {jurisdiction_id}"
        ))
        .into()),
    }
}

fn role_of(ordered: &[OrderedReviewer], reviewer_id: &str) -> ActorRole {
    match ordered.iter().find(|r| r.reviewer_id == reviewer_id) {
        Some(OrderedReviewer {
            kind: ReviewerKind::FinalAuthority { .. },
            ..
        }) => ActorRole::FinalAuthority,
        _ => ActorRole::Approver,
    }
}

fn write_pending_entry(
    tx: &sled::transaction::TransactionalTree,
    entry: &InboxEntry,
) -> Result<(), ConflictableTransactionError<WorkflowError>> {
    // the pending marker is the single-active-reviewer invariant; refuse to
    // double-book a case that already has an open turn
    if tx.get(store::pending(&entry.case_id))?.is_some() {
        return Err(ConflictableTransactionError::Abort(WorkflowError::conflict(
            "case already has an open review turn",
        )));
    }
    tx.insert(
        store::inbox_entry(&entry.id).as_bytes(),
        store::encode_tx(entry)?,
    )?;
    tx.insert(
        store::inbox_index(&entry.receiver, &entry.id).as_bytes(),
        entry.id.as_bytes(),
    )?;
    tx.insert(
        store::pending(&entry.case_id).as_bytes(),
        entry.id.as_bytes(),
    )?;
    Ok(())
}

fn resolve_open_turn(
    tx: &sled::transaction::TransactionalTree,
    case_id: &str,
) -> Result<(), ConflictableTransactionError<WorkflowError>> {
    if let Some(entry_id) = tx.get(store::pending(case_id))? {
        let entry_id = String::from_utf8_lossy(&entry_id).to_string();
        let entry_key = store::inbox_entry(&entry_id);
        if let Some(bytes) = tx.get(&entry_key)? {
            let mut entry: InboxEntry = store::decode_tx(&bytes)?;
            entry.status = InboxStatus::Completed;
            tx.insert(entry_key.as_bytes(), store::encode_tx(&entry)?)?;
        }
        tx.remove(store::pending(case_id).as_bytes())?;
    }
    Ok(())
}

/// Finalization: assign the jurisdiction-year case number, stamp the
/// signature and close out any remaining open turn.
fn finalize_case(
    tx: &sled::transaction::TransactionalTree,
    case_key: &str,
    case: &mut Case,
    reviewer_id: &str,
    signature_ref: Option<&str>,
    arrived_at: TimeStamp<Utc>,
) -> Result<(), ConflictableTransactionError<WorkflowError>> {
    let Some(signature_ref) = signature_ref else {
        return Err(ConflictableTransactionError::Abort(
            WorkflowError::precondition("final authority has no signature artifact on file"),
        ));
    };

    // monotonic per jurisdiction-year; the counter key is read and advanced
    // inside this serializable transaction
    let now = TimeStamp::new();
    let year = now.year();
    let seq_key = store::case_seq(&case.jurisdiction, year);
    let next = match tx.get(&seq_key)? {
        Some(bytes) => {
            let arr: [u8; 4] = bytes.as_ref().try_into().map_err(|_| {
                ConflictableTransactionError::Abort(WorkflowError::Codec(
                    "corrupt case-number counter".into(),
                ))
            })?;
            u32::from_be_bytes(arr) + 1
        }
        None => 1,
    };
    tx.insert(seq_key.as_bytes(), next.to_be_bytes().to_vec())?;

    case.case_number = Some(format_case_number(year, next));
    case.status = CaseStatus::Approved;
    case.custodian = None;
    case.finalized_at = Some(now.clone());
    case.signature_ref = Some(signature_ref.to_string());
    case.last_activity_at = now;

    // no open turn may survive finalization
    resolve_open_turn(tx, &case.id)?;

    let log = StageLogEntry::new(
        case.id.clone(),
        case.take_seq(),
        reviewer_id.to_string(),
        ActorRole::FinalAuthority,
        StageAction::Finalized,
        None,
    )
    .with_arrival(arrived_at);
    tx.insert(
        store::audit(&case.id, log.seq).as_bytes(),
        store::encode_tx(&log)?,
    )?;
    tx.insert(case_key.as_bytes(), store::encode_tx(case)?)?;
    Ok(())
}
