//! Typed error hierarchy for the gatehouse control plane.
//!
//! Two top-level enums cover the two fallible subsystems:
//! - `OnboardError`: onboarding orchestration failures
//! - `OauthError`: Google authorization-code flow failures
//!
//! Supervision and proxying recover on their own (restart loop, synthetic
//! 502) and report through status flags rather than error values.

use thiserror::Error;

/// Errors from the onboarding orchestrator.
///
/// Variants map directly to HTTP classes at the API boundary: validation and
/// GitHub failures are the caller's to fix (400), `AlreadyOnboarded` and
/// `InFlight` are conflicts (409), the rest are internal (500).
#[derive(Debug, Error)]
pub enum OnboardError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Github(String),

    #[error("Backend provisioning failed: {0}")]
    Provision(String),

    #[error("Onboarding completed but failed to set model \"{model}\": {detail}")]
    ModelSelection { model: String, detail: String },

    #[error("Workspace setup failed: {0}")]
    Workspace(String),

    #[error("Already onboarded")]
    AlreadyOnboarded,

    #[error("Onboarding already in progress")]
    InFlight,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the Google OAuth flow.
///
/// Every variant's message is user-facing: the callback handler folds it
/// into the error-page redirect rather than surfacing a raw 500.
#[derive(Debug, Error)]
pub enum OauthError {
    #[error("Google credentials not configured: {0}")]
    MissingCredentials(String),

    #[error("Google returned an error: {0}")]
    Provider(String),

    #[error("no_code")]
    MissingCode,

    #[error("Token exchange failed: {0}")]
    Exchange(String),

    #[error(
        "No refresh token received. Revoke access at https://myaccount.google.com/permissions and retry"
    )]
    NoRefreshToken,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
