use crate::error::RotateError;
use crate::iam::{Connect, IamApi, ProviderError};
use crate::storage::Storage;

/// Remote identity behind a local profile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Identity {
    pub(crate) iam_user_name: String,
    pub(crate) account_id: String,
}

/// The iam user key operations apply to: the caller itself, or a surrogate
/// the caller holds delegated permissions on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Subject {
    pub(crate) acting: Identity,
    pub(crate) surrogate: Option<String>,
}

impl Subject {
    pub(crate) fn user_name(&self) -> &str {
        self.surrogate
            .as_deref()
            .unwrap_or(&self.acting.iam_user_name)
    }

    /// `UserName` parameter for key operations.
    pub(crate) fn scope(&self) -> Option<&str> {
        self.surrogate.as_deref()
    }
}

/// Maps a profile to its identity. Invalid or expired credentials yield
/// `None`; every other failure is returned.
pub(crate) async fn resolve(
    api: &dyn IamApi,
    profile: &str,
) -> Result<Option<Identity>, ProviderError> {
    match api.caller_identity().await {
        Ok(caller) => {
            let identity = Identity {
                iam_user_name: caller.user_name().to_owned(),
                account_id: caller.account.clone(),
            };
            tracing::info!(
                profile = profile,
                iam_user = %identity.iam_user_name,
                account = %identity.account_id,
                "profile mapped to iam user"
            );
            Ok(Some(identity))
        }
        Err(err) if err.is_invalid_credentials() => {
            tracing::warn!(profile = profile, error = %err, "profile failed authentication");
            Ok(None)
        }
        Err(err) => {
            tracing::warn!(profile = profile, error = %err, "identity introspection failed");
            Err(err)
        }
    }
}

/// Resolves `--user-name`, which may be a local profile name or an iam user
/// name, to an iam user name.
pub(crate) async fn map_surrogate(
    connector: &dyn Connect,
    storage: &Storage,
    api: &dyn IamApi,
    acting_profile: &str,
    name: &str,
) -> Result<String, RotateError> {
    if let Some(credentials) = storage
        .section(name)
        .filter(|section| !section.is_temporary())
        .and_then(|section| section.credentials())
    {
        let session = connector.connect(&credentials).await;
        match resolve(session.as_ref(), name).await? {
            Some(identity) => {
                tracing::info!(
                    surrogate = name,
                    iam_user = %identity.iam_user_name,
                    "surrogate mapped through local profile"
                );
                return Ok(identity.iam_user_name);
            }
            None => tracing::warn!(
                surrogate = name,
                "surrogate profile did not authenticate, checking iam users"
            ),
        }
    }

    let users = api.list_users().await.map_err(|source| {
        if source.is_access_denied() {
            RotateError::PermissionDenied {
                profile: acting_profile.to_owned(),
                source,
            }
        } else {
            RotateError::Provider(source)
        }
    })?;
    if users.iter().any(|user| user == name) {
        tracing::info!(surrogate = name, "surrogate is an iam user");
        Ok(name.to_owned())
    } else {
        Err(RotateError::UnknownSurrogate {
            name: name.to_owned(),
        })
    }
}
