use crate::iam::ProviderError;
use crate::settings::SettingsError;
use crate::storage::StoreError;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use thiserror::Error;

/// Failures of a rotation, listing or report run.
///
/// Every variant carries enough context (profile, key id, provider code) for an
/// operator or scheduler to decide whether to rerun the whole invocation.
#[derive(Debug, Error)]
pub(crate) enum RotateError {
    #[error("expired or invalid credentials for profile {profile}")]
    AuthFailure { profile: String },

    #[error("profile {profile} lacks permission: {source}")]
    PermissionDenied {
        profile: String,
        #[source]
        source: ProviderError,
    },

    #[error("iam user {user} not found")]
    IdentityNotFound {
        user: String,
        #[source]
        source: ProviderError,
    },

    #[error("failed to delete access key {access_key_id}")]
    DeleteFailed {
        access_key_id: String,
        #[source]
        source: ProviderError,
    },

    #[error("failed to create access key for {user}")]
    CreateFailed {
        user: String,
        #[source]
        source: ProviderError,
    },

    #[error("profile {profile} not found in {}", .path.display())]
    ProfileNotFound {
        profile: String,
        path: PathBuf,
    },

    #[error("profile {profile} holds temporary credentials and cannot be rotated")]
    TemporaryProfile { profile: String },

    #[error(
        "new access key {access_key_id} for {profile} is valid but was not written to {}; {}",
        .path.display(),
        recovery_hint(.backup.as_deref())
    )]
    PersistFailed {
        profile: String,
        access_key_id: String,
        path: PathBuf,
        /// Backup record holding the new secret, if one was written.
        backup: Option<PathBuf>,
        #[source]
        source: io::Error,
    },

    #[error("no access keys found for {user}")]
    NoKeys { user: String },

    #[error("{user} holds {count} access keys")]
    UnexpectedKeyCount { user: String, count: usize },

    #[error("no active access key to retire for {user}")]
    NoActiveKey { user: String },

    #[error("access key {access_key_id} configured for {profile} matches no key of {user}")]
    KeyNotInUse {
        profile: String,
        user: String,
        access_key_id: String,
    },

    #[error("{name} is neither a local profile nor an iam user")]
    UnknownSurrogate { name: String },

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

fn recovery_hint(backup: Option<&Path>) -> String {
    match backup {
        Some(path) => format!("copy the keyset from the backup record {}", path.display()),
        None => "the secret was only returned once, so delete that key in the provider console \
                 and rotate again"
            .to_owned(),
    }
}

/// Process exit statuses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ExitStatus {
    Success = 0,
    Failure = 1,
    AuthFailure = 12,
    DeleteFailed = 13,
    CreateFailed = 14,
    IdentityNotFound = 15,
    IoError = 74,
    PermissionDenied = 77,
    Config = 78,
    Cancelled = 130,
}

impl RotateError {
    pub(crate) fn exit_status(&self) -> ExitStatus {
        match self {
            Self::AuthFailure { .. } => ExitStatus::AuthFailure,
            Self::PermissionDenied { .. } => ExitStatus::PermissionDenied,
            Self::IdentityNotFound { .. } => ExitStatus::IdentityNotFound,
            Self::DeleteFailed { .. } => ExitStatus::DeleteFailed,
            Self::CreateFailed { .. } => ExitStatus::CreateFailed,
            Self::PersistFailed { .. } => ExitStatus::IoError,
            Self::TemporaryProfile { .. }
            | Self::NoActiveKey { .. }
            | Self::KeyNotInUse { .. }
            | Self::Settings(_) => ExitStatus::Config,
            Self::Cancelled => ExitStatus::Cancelled,
            Self::ProfileNotFound { .. }
            | Self::NoKeys { .. }
            | Self::UnexpectedKeyCount { .. }
            | Self::UnknownSurrogate { .. }
            | Self::Store(_)
            | Self::Provider(_) => ExitStatus::Failure,
        }
    }
}

impl ExitStatus {
    /// Picks the status for an error returned from the top level.
    pub(crate) fn of(err: &anyhow::Error) -> Self {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<RotateError>())
            .map_or(Self::Failure, RotateError::exit_status)
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        ExitCode::from(status as u8)
    }
}
