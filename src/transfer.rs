//! Ownership-transfer sub-flow.
//!
//! A transfer must clear a multi-channel one-time-code gate before any
//! document reaches a reviewer: every declared contact channel has to
//! confirm its code, then the current owner may submit documents, which
//! hands the transfer to the jurisdiction's final authority for a
//! single-stage decision. Expiry is enforced lazily at use-time; there is
//! no background sweep.

use crate::audit::{ActorRole, StageAction, StageLogEntry};
use crate::case::{DocumentMeta, DocumentStatus, DocumentUpload, ReviewDocument, TimeStamp};
use crate::collab::{DocumentStorage, DocumentValidation, Notifier};
use crate::config::WorkflowConfig;
use crate::directory::ReviewerDirectory;
use crate::error::WorkflowError;
use crate::ids;
use crate::inbox::{InboxEntry, InboxStatus};
use crate::store;
use chrono::Utc;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use std::sync::Arc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    #[n(0)]
    Initiated,
    #[n(1)]
    VerifiedByParties,
    #[n(2)]
    PendingGovernor,
    #[n(3)]
    Approved,
    #[n(4)]
    Rejected,
    #[n(5)]
    Expired,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    #[n(0)]
    Email,
    #[n(1)]
    Phone,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct VerificationChannel {
    #[n(0)]
    pub channel_type: ChannelType,
    #[n(1)]
    pub target: String,
    #[n(2)]
    pub code: String,
    #[n(3)]
    pub verified: bool,
    #[n(4)]
    pub issued_at: TimeStamp<Utc>, // cooldown is measured from this, not from the request
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct TransferContext {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub parcel_id: String,
    #[n(2)]
    pub current_owner: String,
    #[n(3)]
    pub new_owner: String,
    #[n(4)]
    pub jurisdiction: String,
    #[n(5)]
    pub state: TransferState,
    #[n(6)]
    pub channels: Vec<VerificationChannel>,
    #[n(7)]
    pub expires_at: TimeStamp<Utc>,
    #[n(8)]
    pub documents: Vec<String>,
    #[n(9)]
    pub rejection_reason: Option<String>,
    #[n(10)]
    pub created_at: TimeStamp<Utc>,
    #[n(11)]
    pub decided_at: Option<TimeStamp<Utc>>,
    #[n(12)]
    pub next_seq: u32,
}

impl TransferContext {
    pub fn all_verified(&self) -> bool {
        self.channels.iter().all(|c| c.verified)
    }

    fn is_expired_at(&self, now: &TimeStamp<Utc>) -> bool {
        matches!(
            self.state,
            TransferState::Initiated | TransferState::VerifiedByParties
        ) && now.to_datetime_utc() > self.expires_at.to_datetime_utc()
    }

    fn take_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

pub struct TransferService {
    instance: Arc<sled::Db>,
    directory: ReviewerDirectory,
    config: WorkflowConfig,
    validation: Arc<dyn DocumentValidation>,
    storage: Arc<dyn DocumentStorage>,
    notifier: Arc<dyn Notifier>,
}

impl TransferService {
    pub fn new(
        instance: Arc<sled::Db>,
        config: WorkflowConfig,
        validation: Arc<dyn DocumentValidation>,
        storage: Arc<dyn DocumentStorage>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let directory = ReviewerDirectory::new(instance.clone());
        Self {
            instance,
            directory,
            config,
            validation,
            storage,
            notifier,
        }
    }

    pub fn load(&self, transfer_id: &str) -> anyhow::Result<TransferContext> {
        let Some(bytes) = self.instance.get(store::transfer(transfer_id))? else {
            return Err(WorkflowError::not_found(format!("transfer {transfer_id}")).into());
        };
        Ok(minicbor::decode(&bytes)?)
    }

    pub fn parcel_owner(&self, parcel_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .instance
            .get(store::parcel(parcel_id))?
            .map(|v| String::from_utf8_lossy(&v).to_string()))
    }

    /// Opens a transfer and issues a one-time code to every declared
    /// contact channel. Codes expire together with the transfer.
    pub fn initiate(
        &self,
        parcel_id: &str,
        current_owner: &str,
        new_owner: &str,
        jurisdiction_id: &str,
        channels: &[(ChannelType, String)],
    ) -> anyhow::Result<TransferContext> {
        if channels.is_empty() {
            return Err(
                WorkflowError::precondition("at least one contact channel is required").into(),
            );
        }
        // fail closed before issuing anything
        self.directory.load(jurisdiction_id)?;
        if let Some(owner) = self.parcel_owner(parcel_id)? {
            if owner != current_owner {
                return Err(WorkflowError::forbidden(format!(
                    "caller does not own parcel {parcel_id}"
                ))
                .into());
            }
        }

        let now = TimeStamp::new();
        let expires_at: TimeStamp<Utc> =
            (now.to_datetime_utc() + self.config.verification_ttl).into();
        let transfer = TransferContext {
            id: ids::new_id("xfer_")?,
            parcel_id: parcel_id.to_string(),
            current_owner: current_owner.to_string(),
            new_owner: new_owner.to_string(),
            jurisdiction: jurisdiction_id.to_string(),
            state: TransferState::Initiated,
            channels: channels
                .iter()
                .map(|(channel_type, target)| VerificationChannel {
                    channel_type: *channel_type,
                    target: target.clone(),
                    code: ids::new_otp_code(),
                    verified: false,
                    issued_at: now.clone(),
                })
                .collect(),
            expires_at,
            documents: Vec::new(),
            rejection_reason: None,
            created_at: now,
            decided_at: None,
            next_seq: 1,
        };
        self.instance
            .insert(store::transfer(&transfer.id), minicbor::to_vec(&transfer)?)?;

        for channel in &transfer.channels {
            self.send_code(&transfer.id, channel);
        }
        Ok(transfer)
    }

    /// Confirms one channel's code. When the last unverified channel clears,
    /// the transfer auto-advances to `VerifiedByParties`.
    pub fn verify_channel(
        &self,
        transfer_id: &str,
        target: &str,
        code: &str,
    ) -> anyhow::Result<TransferContext> {
        let key = store::transfer(transfer_id);
        let transfer = store::unwrap_txn(self.instance.transaction(
            |tx| -> ConflictableTransactionResult<TransferContext, WorkflowError> {
                let mut transfer = get_transfer(tx, &key, transfer_id)?;
                if lazily_expire(tx, &key, &mut transfer)? {
                    return Ok(transfer);
                }
                if transfer.state != TransferState::Initiated {
                    return Err(ConflictableTransactionError::Abort(
                        WorkflowError::precondition(format!(
                            "transfer is not collecting verifications: {:?}",
                            transfer.state
                        )),
                    ));
                }
                let Some(channel) = transfer.channels.iter_mut().find(|c| c.target == target)
                else {
                    return Err(ConflictableTransactionError::Abort(WorkflowError::not_found(
                        format!("channel {target} on transfer {transfer_id}"),
                    )));
                };
                if channel.verified {
                    return Err(ConflictableTransactionError::Abort(WorkflowError::conflict(
                        "channel already verified",
                    )));
                }
                if channel.code != code {
                    return Err(ConflictableTransactionError::Abort(WorkflowError::forbidden(
                        "verification code mismatch",
                    )));
                }
                channel.verified = true;
                if transfer.all_verified() {
                    transfer.state = TransferState::VerifiedByParties;
                }
                tx.insert(key.as_bytes(), store::encode_tx(&transfer)?)?;
                Ok(transfer)
            },
        ))?;
        fail_if_expired(&transfer)?;
        Ok(transfer)
    }

    /// Reissues a channel's code. The cooldown is measured from the previous
    /// code's issuance, so hammering the endpoint does not reset the window.
    pub fn resend_code(&self, transfer_id: &str, target: &str) -> anyhow::Result<TransferContext> {
        let key = store::transfer(transfer_id);
        let fresh_code = ids::new_otp_code();
        let cooldown = self.config.resend_cooldown;
        let transfer = store::unwrap_txn(self.instance.transaction(
            |tx| -> ConflictableTransactionResult<TransferContext, WorkflowError> {
                let mut transfer = get_transfer(tx, &key, transfer_id)?;
                if lazily_expire(tx, &key, &mut transfer)? {
                    return Ok(transfer);
                }
                if transfer.state != TransferState::Initiated {
                    return Err(ConflictableTransactionError::Abort(
                        WorkflowError::precondition(format!(
                            "transfer is not collecting verifications: {:?}",
                            transfer.state
                        )),
                    ));
                }
                let Some(channel) = transfer.channels.iter_mut().find(|c| c.target == target)
                else {
                    return Err(ConflictableTransactionError::Abort(WorkflowError::not_found(
                        format!("channel {target} on transfer {transfer_id}"),
                    )));
                };
                if channel.verified {
                    return Err(ConflictableTransactionError::Abort(WorkflowError::conflict(
                        "channel already verified",
                    )));
                }
                let elapsed = Utc::now() - channel.issued_at.to_datetime_utc();
                if elapsed < cooldown {
                    return Err(ConflictableTransactionError::Abort(
                        WorkflowError::precondition("resend cooldown active"),
                    ));
                }
                channel.code = fresh_code.clone();
                channel.issued_at = TimeStamp::new();
                tx.insert(key.as_bytes(), store::encode_tx(&transfer)?)?;
                Ok(transfer)
            },
        ))?;
        fail_if_expired(&transfer)?;

        if let Some(channel) = transfer.channels.iter().find(|c| c.target == target) {
            self.send_code(&transfer.id, channel);
        }
        Ok(transfer)
    }

    /// Once all parties verified, the current owner submits the transfer
    /// documents, handing the case to the jurisdiction's final authority.
    pub fn submit_documents(
        &self,
        transfer_id: &str,
        owner_id: &str,
        metas: &[DocumentMeta],
        files: &[DocumentUpload],
    ) -> anyhow::Result<TransferContext> {
        let snapshot = self.load(transfer_id)?;
        if snapshot.current_owner != owner_id {
            return Err(
                WorkflowError::forbidden("only the current owner may submit documents").into(),
            );
        }
        if metas.len() != files.len() {
            return Err(WorkflowError::precondition(format!(
                "document metadata count ({}) does not match file count ({})",
                metas.len(),
                files.len()
            ))
            .into());
        }
        let jur = self.directory.load(&snapshot.jurisdiction)?;
        let Some(fa) = jur.final_authority.clone() else {
            return Err(WorkflowError::configuration(format!(
                "no final authority configured for jurisdiction {}",
                snapshot.jurisdiction
            ))
            .into());
        };

        for file in files {
            self.validation
                .validate(&file.bytes, &file.filename, &file.mime_type)
                .map_err(|e| WorkflowError::precondition(format!("document validation: {e}")))?;
        }
        let mut documents = Vec::with_capacity(files.len());
        for (meta, file) in metas.iter().zip(files) {
            let url = self
                .storage
                .store(&file.bytes, &file.filename, &file.mime_type, transfer_id)
                .map_err(|e| WorkflowError::UpstreamFailure(format!("document storage: {e}")))?;
            documents.push(ReviewDocument {
                id: ids::new_id("doc_")?,
                case_id: transfer_id.to_string(),
                title: meta.title.clone(),
                doc_type: meta.doc_type.clone(),
                storage_url: url,
                content_digest: sha256::digest(&file.bytes),
                status: DocumentStatus::Pending,
                rejection_message: None,
                superseded_by: None,
            });
        }

        let entry = InboxEntry::new(
            ids::new_id("ibx_")?,
            fa.reviewer_id.clone(),
            transfer_id.to_string(),
        );
        let key = store::transfer(transfer_id);
        let transfer = store::unwrap_txn(self.instance.transaction(
            |tx| -> ConflictableTransactionResult<TransferContext, WorkflowError> {
                let mut transfer = get_transfer(tx, &key, transfer_id)?;
                if lazily_expire(tx, &key, &mut transfer)? {
                    return Ok(transfer);
                }
                if transfer.state != TransferState::VerifiedByParties {
                    return Err(ConflictableTransactionError::Abort(
                        WorkflowError::precondition(format!(
                            "transfer is not fully verified: {:?}",
                            transfer.state
                        )),
                    ));
                }
                for doc in &documents {
                    tx.insert(store::document(&doc.id).as_bytes(), store::encode_tx(doc)?)?;
                    transfer.documents.push(doc.id.clone());
                }
                transfer.state = TransferState::PendingGovernor;

                if tx.get(store::pending(transfer_id))?.is_some() {
                    return Err(ConflictableTransactionError::Abort(WorkflowError::conflict(
                        "transfer already has an open review turn",
                    )));
                }
                tx.insert(
                    store::inbox_entry(&entry.id).as_bytes(),
                    store::encode_tx(&entry)?,
                )?;
                tx.insert(
                    store::inbox_index(&entry.receiver, &entry.id).as_bytes(),
                    entry.id.as_bytes(),
                )?;
                tx.insert(store::pending(transfer_id).as_bytes(), entry.id.as_bytes())?;

                let log = StageLogEntry::new(
                    transfer.id.clone(),
                    transfer.take_seq(),
                    transfer.current_owner.clone(),
                    ActorRole::Applicant,
                    StageAction::Submitted,
                    None,
                );
                tx.insert(
                    store::audit(&transfer.id, log.seq).as_bytes(),
                    store::encode_tx(&log)?,
                )?;
                tx.insert(key.as_bytes(), store::encode_tx(&transfer)?)?;
                Ok(transfer)
            },
        ))?;
        fail_if_expired(&transfer)?;

        self.notify(
            &fa.reviewer_id,
            "Ownership transfer awaiting your decision",
            &format!("Transfer {transfer_id} has been submitted for approval."),
        );
        Ok(transfer)
    }

    /// The final authority's single-stage decision. Approval reassigns the
    /// parcel and appends an ownership-history record; rejection requires a
    /// non-empty reason.
    pub fn governor_decide(
        &self,
        transfer_id: &str,
        authority_id: &str,
        approve: bool,
        reason: Option<String>,
    ) -> anyhow::Result<TransferContext> {
        let snapshot = self.load(transfer_id)?;
        let jur = self.directory.load(&snapshot.jurisdiction)?;
        match &jur.final_authority {
            Some(fa) if fa.reviewer_id == authority_id => {}
            _ => {
                return Err(WorkflowError::forbidden(
                    "caller is not the final authority for this jurisdiction",
                )
                .into());
            }
        }
        let reason = if approve {
            None
        } else {
            let reason = reason.unwrap_or_default();
            if reason.trim().is_empty() {
                return Err(WorkflowError::precondition("rejection reason required").into());
            }
            Some(reason)
        };

        let key = store::transfer(transfer_id);
        let transfer = store::unwrap_txn(self.instance.transaction(
            |tx| -> ConflictableTransactionResult<TransferContext, WorkflowError> {
                let mut transfer = get_transfer(tx, &key, transfer_id)?;
                match transfer.state {
                    TransferState::PendingGovernor => {}
                    TransferState::Approved | TransferState::Rejected => {
                        return Err(ConflictableTransactionError::Abort(
                            WorkflowError::conflict("transfer already decided"),
                        ));
                    }
                    other => {
                        return Err(ConflictableTransactionError::Abort(
                            WorkflowError::precondition(format!(
                                "transfer is not awaiting a decision: {other:?}"
                            )),
                        ));
                    }
                }

                // consume the authority's open turn
                let Some(entry_id) = tx.get(store::pending(transfer_id))? else {
                    return Err(ConflictableTransactionError::Abort(WorkflowError::conflict(
                        "no open review turn for this transfer",
                    )));
                };
                let entry_id = String::from_utf8_lossy(&entry_id).to_string();
                let entry_key = store::inbox_entry(&entry_id);
                let Some(entry_bytes) = tx.get(&entry_key)? else {
                    return Err(ConflictableTransactionError::Abort(WorkflowError::not_found(
                        format!("inbox entry {entry_id}"),
                    )));
                };
                let mut entry: InboxEntry = store::decode_tx(&entry_bytes)?;
                if entry.receiver != authority_id {
                    return Err(ConflictableTransactionError::Abort(WorkflowError::forbidden(
                        "no pending review for you",
                    )));
                }
                entry.status = if approve {
                    InboxStatus::Completed
                } else {
                    InboxStatus::Rejected
                };
                tx.insert(entry_key.as_bytes(), store::encode_tx(&entry)?)?;
                tx.remove(store::pending(transfer_id).as_bytes())?;

                let now = TimeStamp::new();
                if approve {
                    transfer.state = TransferState::Approved;
                    transfer.decided_at = Some(now);
                    // reassign the parcel and append the ownership history record
                    tx.insert(
                        store::parcel(&transfer.parcel_id).as_bytes(),
                        transfer.new_owner.as_bytes(),
                    )?;
                    let log = StageLogEntry::new(
                        transfer.id.clone(),
                        transfer.take_seq(),
                        authority_id.to_string(),
                        ActorRole::FinalAuthority,
                        StageAction::OwnershipTransferred,
                        Some(format!(
                            "parcel {} reassigned from {} to {}",
                            transfer.parcel_id, transfer.current_owner, transfer.new_owner
                        )),
                    )
                    .with_arrival(entry.created_at.clone());
                    tx.insert(
                        store::audit(&transfer.id, log.seq).as_bytes(),
                        store::encode_tx(&log)?,
                    )?;
                } else {
                    transfer.state = TransferState::Rejected;
                    transfer.decided_at = Some(now);
                    transfer.rejection_reason = reason.clone();
                    let log = StageLogEntry::new(
                        transfer.id.clone(),
                        transfer.take_seq(),
                        authority_id.to_string(),
                        ActorRole::FinalAuthority,
                        StageAction::Rejected,
                        reason.clone(),
                    )
                    .with_arrival(entry.created_at.clone());
                    tx.insert(
                        store::audit(&transfer.id, log.seq).as_bytes(),
                        store::encode_tx(&log)?,
                    )?;
                }
                tx.insert(key.as_bytes(), store::encode_tx(&transfer)?)?;
                Ok(transfer)
            },
        ))?;

        let (subject, body) = if approve {
            (
                "Ownership transfer approved",
                format!(
                    "Transfer {transfer_id}: parcel {} now belongs to {}.",
                    transfer.parcel_id, transfer.new_owner
                ),
            )
        } else {
            (
                "Ownership transfer rejected",
                transfer.rejection_reason.clone().unwrap_or_default(),
            )
        };
        self.notify(&transfer.current_owner, subject, &body);
        self.notify(&transfer.new_owner, subject, &body);
        Ok(transfer)
    }

    fn send_code(&self, transfer_id: &str, channel: &VerificationChannel) {
        let body = format!(
            "Your verification code for transfer {transfer_id} is {}.",
            channel.code
        );
        self.notify(&channel.target, "Ownership transfer verification", &body);
    }

    fn notify(&self, to: &str, subject: &str, body: &str) {
        if let Err(err) = self.notifier.send(to, subject, body) {
            tracing::warn!(%to, %subject, %err, "notification delivery failed");
        }
    }
}

fn get_transfer(
    tx: &sled::transaction::TransactionalTree,
    key: &str,
    transfer_id: &str,
) -> Result<TransferContext, ConflictableTransactionError<WorkflowError>> {
    let Some(bytes) = tx.get(key)? else {
        return Err(ConflictableTransactionError::Abort(WorkflowError::not_found(
            format!("transfer {transfer_id}"),
        )));
    };
    store::decode_tx(&bytes)
}

// lazy timeout enforcement; the Expired state must commit, so the caller
// checks the returned state and refuses after the transaction
fn lazily_expire(
    tx: &sled::transaction::TransactionalTree,
    key: &str,
    transfer: &mut TransferContext,
) -> Result<bool, ConflictableTransactionError<WorkflowError>> {
    let now = TimeStamp::new();
    if transfer.is_expired_at(&now) {
        transfer.state = TransferState::Expired;
        tx.insert(key.as_bytes(), store::encode_tx(transfer)?)?;
        return Ok(true);
    }
    Ok(false)
}

fn fail_if_expired(transfer: &TransferContext) -> anyhow::Result<()> {
    if transfer.state == TransferState::Expired {
        return Err(
            WorkflowError::precondition("transfer verification window has expired").into(),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_verified_flips_with_last_channel() {
        let now = TimeStamp::new();
        let mut transfer = TransferContext {
            id: "xfer_1".into(),
            parcel_id: "parcel_1".into(),
            current_owner: "user_a".into(),
            new_owner: "user_b".into(),
            jurisdiction: "jur_a".into(),
            state: TransferState::Initiated,
            channels: vec![
                VerificationChannel {
                    channel_type: ChannelType::Email,
                    target: "a@example.com".into(),
                    code: "000001".into(),
                    verified: false,
                    issued_at: now.clone(),
                },
                VerificationChannel {
                    channel_type: ChannelType::Phone,
                    target: "+100000".into(),
                    code: "000002".into(),
                    verified: false,
                    issued_at: now.clone(),
                },
            ],
            expires_at: now.clone(),
            documents: Vec::new(),
            rejection_reason: None,
            created_at: now,
            decided_at: None,
            next_seq: 1,
        };
        assert!(!transfer.all_verified());
        transfer.channels[0].verified = true;
        assert!(!transfer.all_verified());
        transfer.channels[1].verified = true;
        assert!(transfer.all_verified());
    }
}
