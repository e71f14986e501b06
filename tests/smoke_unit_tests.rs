//! Smoke-screen unit tests spanning the workflow components.
//!
//! These exercise individual operations in isolation from the full
//! integration scenarios, mostly around authorization and status gates.

use case_approval::case::{CaseStatus, DocumentMeta, DocumentStatus, DocumentUpload};
use case_approval::collab::{
    BasicDocumentValidation, InMemoryStorage, LogNotifier, StubCertificateRenderer,
};
use case_approval::config::WorkflowConfig;
use case_approval::error::WorkflowError;
use case_approval::service::{Decision, WorkflowService};
use chrono::Duration;
use std::sync::Arc;
use tempfile::tempdir;

fn open_service(
    name: &str,
    config: WorkflowConfig,
) -> anyhow::Result<(tempfile::TempDir, WorkflowService)> {
    let temp_dir = tempdir()?;
    let db = Arc::new(sled::open(temp_dir.path().join(name))?);
    let service = WorkflowService::new(
        db,
        config,
        Arc::new(BasicDocumentValidation),
        Arc::new(InMemoryStorage::new()),
        Arc::new(LogNotifier),
        Arc::new(StubCertificateRenderer),
    );
    Ok((temp_dir, service))
}

fn meta() -> DocumentMeta {
    DocumentMeta {
        title: "Survey plan".into(),
        doc_type: "survey".into(),
    }
}

fn upload() -> DocumentUpload {
    DocumentUpload {
        filename: "survey.pdf".into(),
        mime_type: "application/pdf".into(),
        bytes: b"survey".to_vec(),
    }
}

fn kind_of(err: &anyhow::Error) -> Option<&WorkflowError> {
    err.downcast_ref::<WorkflowError>()
}

fn seed(service: &WorkflowService, jur: &str) -> anyhow::Result<()> {
    service
        .directory()
        .register_final_authority(jur, "rev_gov", 8, Some("sig://gov.png".into()))?;
    service.directory().register_approver(jur, "rev_a1", 1)?;
    Ok(())
}

mod intake {
    use super::*;

    #[test]
    fn unknown_jurisdiction_blocks_case_creation() -> anyhow::Result<()> {
        let (_tmp, service) = open_service("intake_unknown.db", WorkflowConfig::default())?;
        let err = service.open_case("user_a", "jur_nowhere").unwrap_err();
        assert!(matches!(kind_of(&err), Some(WorkflowError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn only_the_applicant_may_submit() -> anyhow::Result<()> {
        let (_tmp, service) = open_service("intake_owner.db", WorkflowConfig::default())?;
        seed(&service, "jur_a")?;
        let case = service.open_case("user_a", "jur_a")?;
        let err = service
            .submit_case(&case.id, "user_b", &[meta()], &[upload()])
            .unwrap_err();
        assert!(matches!(kind_of(&err), Some(WorkflowError::Forbidden(_))));
        Ok(())
    }

    #[test]
    fn jurisdiction_without_approvers_fails_closed() -> anyhow::Result<()> {
        let (_tmp, service) = open_service("intake_noapprovers.db", WorkflowConfig::default())?;
        service
            .directory()
            .register_final_authority("jur_empty", "rev_gov", 4, Some("sig://g.png".into()))?;
        let case = service.open_case("user_a", "jur_empty")?;
        let err = service
            .submit_case(&case.id, "user_a", &[meta()], &[upload()])
            .unwrap_err();
        assert!(matches!(
            kind_of(&err),
            Some(WorkflowError::Configuration(_))
        ));
        Ok(())
    }

    #[test]
    fn disallowed_upload_is_refused_by_the_gate() -> anyhow::Result<()> {
        let (_tmp, service) = open_service("intake_gate.db", WorkflowConfig::default())?;
        seed(&service, "jur_a")?;
        let case = service.open_case("user_a", "jur_a")?;
        let bad = DocumentUpload {
            filename: "malware.exe".into(),
            mime_type: "application/pdf".into(),
            bytes: b"x".to_vec(),
        };
        let err = service
            .submit_case(&case.id, "user_a", &[meta()], &[bad])
            .unwrap_err();
        assert!(matches!(
            kind_of(&err),
            Some(WorkflowError::PreconditionFailed(_))
        ));
        Ok(())
    }
}

mod decisions {
    use super::*;

    #[test]
    fn non_member_cannot_decide() -> anyhow::Result<()> {
        let (_tmp, service) = open_service("decide_member.db", WorkflowConfig::default())?;
        seed(&service, "jur_a")?;
        let case = service.open_case("user_a", "jur_a")?;
        let case = service.submit_case(&case.id, "user_a", &[meta()], &[upload()])?;
        let err = service
            .decide(&case.id, "rev_stranger", Decision::Approve)
            .unwrap_err();
        assert!(matches!(kind_of(&err), Some(WorkflowError::Forbidden(_))));
        Ok(())
    }

    #[test]
    fn rejection_requires_a_reason() -> anyhow::Result<()> {
        let (_tmp, service) = open_service("decide_reason.db", WorkflowConfig::default())?;
        seed(&service, "jur_a")?;
        let case = service.open_case("user_a", "jur_a")?;
        let case = service.submit_case(&case.id, "user_a", &[meta()], &[upload()])?;
        let err = service
            .decide(
                &case.id,
                "rev_a1",
                Decision::Reject {
                    comment: "   ".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(
            kind_of(&err),
            Some(WorkflowError::PreconditionFailed(_))
        ));
        Ok(())
    }

    #[test]
    fn unsigned_authority_out_of_turn_is_forbidden_not_blocked() -> anyhow::Result<()> {
        let (_tmp, service) = open_service("decide_unsigned_turn.db", WorkflowConfig::default())?;
        service
            .directory()
            .register_final_authority("jur_a", "rev_gov", 4, None)?;
        service.directory().register_approver("jur_a", "rev_a1", 1)?;
        let case = service.open_case("user_a", "jur_a")?;
        let case = service.submit_case(&case.id, "user_a", &[meta()], &[upload()])?;

        // the turn belongs to the approver; the missing signature must not
        // mask the custody error
        let err = service
            .decide(&case.id, "rev_gov", Decision::Approve)
            .unwrap_err();
        assert!(matches!(kind_of(&err), Some(WorkflowError::Forbidden(_))));

        // once it is actually their turn, the missing signature is the error
        let case = service.decide(&case.id, "rev_a1", Decision::Approve)?;
        assert_eq!(case.custodian.as_deref(), Some("rev_gov"));
        let err = service
            .decide(&case.id, "rev_gov", Decision::Approve)
            .unwrap_err();
        assert!(matches!(
            kind_of(&err),
            Some(WorkflowError::PreconditionFailed(_))
        ));
        Ok(())
    }

    #[test]
    fn decision_on_a_draft_case_fails() -> anyhow::Result<()> {
        let (_tmp, service) = open_service("decide_draft.db", WorkflowConfig::default())?;
        seed(&service, "jur_a")?;
        let case = service.open_case("user_a", "jur_a")?;
        let err = service
            .decide(&case.id, "rev_a1", Decision::Approve)
            .unwrap_err();
        assert!(matches!(
            kind_of(&err),
            Some(WorkflowError::PreconditionFailed(_))
        ));
        Ok(())
    }

    #[test]
    fn document_rejection_does_not_move_the_case() -> anyhow::Result<()> {
        let (_tmp, service) = open_service("decide_doc.db", WorkflowConfig::default())?;
        seed(&service, "jur_a")?;
        let case = service.open_case("user_a", "jur_a")?;
        let case = service.submit_case(&case.id, "user_a", &[meta()], &[upload()])?;

        let doc = service.review_document(
            &case.id,
            "rev_a1",
            &case.documents[0],
            DocumentStatus::Rejected,
            Some("illegible".into()),
        )?;
        assert_eq!(doc.status, DocumentStatus::Rejected);
        assert_eq!(doc.rejection_message.as_deref(), Some("illegible"));

        // case-level custody and status are untouched
        let case = service.load_case(&case.id)?;
        assert_eq!(case.status, CaseStatus::InReview);
        assert_eq!(case.custodian.as_deref(), Some("rev_a1"));
        Ok(())
    }

    #[test]
    fn only_the_custodian_reviews_documents() -> anyhow::Result<()> {
        let (_tmp, service) = open_service("decide_doc_custody.db", WorkflowConfig::default())?;
        seed(&service, "jur_a")?;
        let case = service.open_case("user_a", "jur_a")?;
        let case = service.submit_case(&case.id, "user_a", &[meta()], &[upload()])?;
        let err = service
            .review_document(
                &case.id,
                "rev_gov",
                &case.documents[0],
                DocumentStatus::Approved,
                None,
            )
            .unwrap_err();
        assert!(matches!(kind_of(&err), Some(WorkflowError::Forbidden(_))));
        Ok(())
    }
}

mod lifecycle {
    use super::*;

    #[test]
    fn withdraw_resolves_the_open_turn() -> anyhow::Result<()> {
        let (_tmp, service) = open_service("withdraw.db", WorkflowConfig::default())?;
        seed(&service, "jur_a")?;
        let case = service.open_case("user_a", "jur_a")?;
        let case = service.submit_case(&case.id, "user_a", &[meta()], &[upload()])?;
        assert_eq!(service.reviewer_inbox("rev_a1")?.len(), 1);

        let case = service.withdraw(&case.id, "user_a")?;
        assert_eq!(case.status, CaseStatus::Withdrawn);
        assert!(case.custodian.is_none());
        assert!(service.reviewer_inbox("rev_a1")?.is_empty());

        // terminal: nothing more can happen
        let err = service.withdraw(&case.id, "user_a").unwrap_err();
        assert!(matches!(
            kind_of(&err),
            Some(WorkflowError::PreconditionFailed(_))
        ));
        Ok(())
    }

    #[test]
    fn stale_expiry_is_off_by_default() -> anyhow::Result<()> {
        let (_tmp, service) = open_service("stale_off.db", WorkflowConfig::default())?;
        seed(&service, "jur_a")?;
        let case = service.open_case("user_a", "jur_a")?;
        let case = service.submit_case(&case.id, "user_a", &[meta()], &[upload()])?;
        assert!(!service.expire_if_stale(&case.id)?);
        assert_eq!(service.load_case(&case.id)?.status, CaseStatus::InReview);
        Ok(())
    }

    #[test]
    fn stale_expiry_applies_when_configured() -> anyhow::Result<()> {
        let cfg = WorkflowConfig {
            stale_review_ttl: Some(Duration::zero()),
            ..WorkflowConfig::default()
        };
        let (_tmp, service) = open_service("stale_on.db", cfg)?;
        seed(&service, "jur_a")?;
        let case = service.open_case("user_a", "jur_a")?;
        let case = service.submit_case(&case.id, "user_a", &[meta()], &[upload()])?;
        std::thread::sleep(std::time::Duration::from_millis(5));

        assert!(service.expire_if_stale(&case.id)?);
        let case = service.load_case(&case.id)?;
        assert_eq!(case.status, CaseStatus::Expired);
        assert!(service.reviewer_inbox("rev_a1")?.is_empty());
        Ok(())
    }

    #[test]
    fn resubmit_rejects_foreign_documents() -> anyhow::Result<()> {
        let (_tmp, service) = open_service("resubmit_foreign.db", WorkflowConfig::default())?;
        seed(&service, "jur_a")?;

        let case_a = service.open_case("user_a", "jur_a")?;
        let case_a = service.submit_case(&case_a.id, "user_a", &[meta()], &[upload()])?;
        let case_b = service.open_case("user_a", "jur_a")?;
        let case_b = service.submit_case(&case_b.id, "user_a", &[meta()], &[upload()])?;

        let case_a = service.decide(
            &case_a.id,
            "rev_a1",
            Decision::Reject {
                comment: "wrong form".into(),
            },
        )?;

        // document id borrowed from another case must be refused
        let err = service
            .resubmit(
                &case_a.id,
                "user_a",
                &[case_approval::service::DocumentResubmission {
                    document_id: case_b.documents[0].clone(),
                    meta: meta(),
                    file: upload(),
                }],
            )
            .unwrap_err();
        assert!(matches!(kind_of(&err), Some(WorkflowError::Forbidden(_))));
        Ok(())
    }
}
