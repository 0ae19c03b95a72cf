//! Anonymization collaborator contract.
//!
//! The engine itself lives upstream; the archive path only needs to hand it
//! a file list and act on the per-file dispositions. Rejected files must be
//! deleted by the caller.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::Result;

/// Context handed to the anonymizer alongside the file list.
#[derive(Clone, Debug)]
pub struct AnonymizationContext {
    pub project: Option<String>,
    pub subject: Option<String>,
    pub label: String,
    pub script_id: Option<String>,
    pub script: Option<String>,
    pub record_result: bool,
}

/// Per-file outcome of an anonymization pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnonymizationDisposition {
    /// The file was rewritten.
    Success,
    /// The script matched nothing; the file is untouched.
    Noop,
    /// The file failed a precondition and must be removed by the caller.
    Rejected,
}

#[derive(Clone, Debug)]
pub struct AnonymizationResult {
    pub file: PathBuf,
    pub disposition: AnonymizationDisposition,
    pub detail: Option<String>,
}

#[async_trait]
pub trait Anonymizer: Send + Sync {
    async fn anonymize(
        &self,
        files: &[PathBuf],
        ctx: &AnonymizationContext,
    ) -> Result<Vec<AnonymizationResult>>;
}

/// Pass-through anonymizer for installations without a de-identification
/// requirement; reports every file as untouched.
#[derive(Debug, Default)]
pub struct NoopAnonymizer;

#[async_trait]
impl Anonymizer for NoopAnonymizer {
    async fn anonymize(
        &self,
        files: &[PathBuf],
        _ctx: &AnonymizationContext,
    ) -> Result<Vec<AnonymizationResult>> {
        Ok(files
            .iter()
            .map(|file| AnonymizationResult {
                file: file.clone(),
                disposition: AnonymizationDisposition::Noop,
                detail: None,
            })
            .collect())
    }
}
