//! Contracts for the out-of-scope collaborators.
//!
//! The engine calls these through narrow traits and never embeds their
//! logic. Notification and certificate rendering are best-effort: failures
//! are logged and never roll back a committed transition.

use crate::case::Case;
use std::collections::HashMap;
use std::sync::Mutex;

pub trait DocumentValidation: Send + Sync {
    fn validate(&self, bytes: &[u8], filename: &str, mime_type: &str) -> anyhow::Result<()>;
}

pub trait DocumentStorage: Send + Sync {
    /// Stores one file and returns its URL. A failure here is fatal to the
    /// submission attempt; no partial submission state is persisted.
    fn store(
        &self,
        bytes: &[u8],
        filename: &str,
        mime_type: &str,
        folder: &str,
    ) -> anyhow::Result<String>;
}

pub trait Notifier: Send + Sync {
    fn send(&self, target: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

pub trait CertificateRenderer: Send + Sync {
    /// Renders the certificate for a finalized case and returns its URL.
    fn render(&self, case: &Case) -> anyhow::Result<String>;
}

/// Stock validation gate: extension/MIME allowlist and a 10 MB size cap.
pub struct BasicDocumentValidation;

const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
const ALLOWED_EXTENSIONS: &[&str] = &["pdf", "png", "jpg", "jpeg"];
const ALLOWED_MIME: &[&str] = &["application/pdf", "image/png", "image/jpeg"];

impl DocumentValidation for BasicDocumentValidation {
    fn validate(&self, bytes: &[u8], filename: &str, mime_type: &str) -> anyhow::Result<()> {
        if bytes.len() > MAX_UPLOAD_BYTES {
            anyhow::bail!("{filename} exceeds the 10MB upload limit");
        }
        let ext = filename.rsplit('.').next().unwrap_or("").to_lowercase();
        if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
            anyhow::bail!("{filename}: extension .{ext} is not allowed");
        }
        if !ALLOWED_MIME.contains(&mime_type) {
            anyhow::bail!("{filename}: MIME type {mime_type} is not allowed");
        }
        Ok(())
    }
}

/// In-memory storage keyed by content digest. Suitable for tests and local
/// runs; production wires a real object store behind the same trait.
#[derive(Default)]
pub struct InMemoryStorage {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().unwrap().len()
    }
}

impl DocumentStorage for InMemoryStorage {
    fn store(
        &self,
        bytes: &[u8],
        _filename: &str,
        _mime_type: &str,
        folder: &str,
    ) -> anyhow::Result<String> {
        let digest = sha256::digest(bytes);
        let url = format!("mem://{folder}/{digest}");
        self.files.lock().unwrap().insert(url.clone(), bytes.to_vec());
        Ok(url)
    }
}

/// Notifier that logs intents instead of delivering them.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, target: &str, subject: &str, _body: &str) -> anyhow::Result<()> {
        tracing::info!(to = %target, subject = %subject, "notification intent");
        Ok(())
    }
}

/// Renderer that mints a deterministic certificate URL from the case number.
pub struct StubCertificateRenderer;

impl CertificateRenderer for StubCertificateRenderer {
    fn render(&self, case: &Case) -> anyhow::Result<String> {
        let number = case
            .case_number
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("case has no number assigned"))?;
        Ok(format!("cert://{number}.pdf"))
    }
}
