use crate::storage::Credentials;
use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_iam::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_iam::types::StatusType;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

// IAM is a global service; any region signs its requests.
const FALLBACK_REGION: &str = "us-east-1";

/// Provider failures, classified by error code.
#[derive(Debug, Error)]
pub(crate) enum ProviderError {
    #[error("{operation}: access denied: {message}")]
    AccessDenied {
        operation: &'static str,
        message: String,
    },
    #[error("{operation}: no such entity: {message}")]
    NoSuchEntity {
        operation: &'static str,
        message: String,
    },
    #[error("{operation}: invalid or expired credentials: {message}")]
    InvalidCredentials {
        operation: &'static str,
        message: String,
    },
    #[error("{operation}: {code}: {message}")]
    Service {
        operation: &'static str,
        code: String,
        message: String,
    },
    #[error("{operation}: {message}")]
    Transient {
        operation: &'static str,
        message: String,
    },
    #[error("{operation}: missing {field} in response")]
    Malformed {
        operation: &'static str,
        field: &'static str,
    },
}

impl ProviderError {
    fn from_sdk<E, R>(operation: &'static str, err: SdkError<E, R>) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
        R: fmt::Debug,
    {
        let message = err
            .message()
            .map(str::to_owned)
            .unwrap_or_else(|| DisplayErrorContext(&err).to_string());
        match err.code() {
            Some("AccessDenied" | "AccessDeniedException") => Self::AccessDenied { operation, message },
            Some("NoSuchEntity") => Self::NoSuchEntity { operation, message },
            Some("InvalidClientTokenId" | "ExpiredToken" | "SignatureDoesNotMatch") => {
                Self::InvalidCredentials { operation, message }
            }
            Some(code) => Self::Service {
                operation,
                code: code.to_owned(),
                message,
            },
            None => Self::Transient { operation, message },
        }
    }

    pub(crate) fn is_access_denied(&self) -> bool {
        matches!(self, Self::AccessDenied { .. })
    }

    pub(crate) fn is_no_such_entity(&self) -> bool {
        matches!(self, Self::NoSuchEntity { .. })
    }

    pub(crate) fn is_invalid_credentials(&self) -> bool {
        matches!(self, Self::InvalidCredentials { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum KeyStatus {
    Active,
    Inactive,
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "Active",
            Self::Inactive => "Inactive",
        })
    }
}

impl From<&StatusType> for KeyStatus {
    fn from(value: &StatusType) -> Self {
        match value {
            StatusType::Active => Self::Active,
            _ => Self::Inactive,
        }
    }
}

/// Metadata of an existing access key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct AccessKey {
    pub(crate) access_key_id: String,
    pub(crate) status: KeyStatus,
    pub(crate) create_date: DateTime<Utc>,
}

impl TryFrom<&aws_sdk_iam::types::AccessKeyMetadata> for AccessKey {
    type Error = ProviderError;
    fn try_from(value: &aws_sdk_iam::types::AccessKeyMetadata) -> Result<Self, Self::Error> {
        const OPERATION: &str = "ListAccessKeys";
        let malformed = |field| ProviderError::Malformed {
            operation: OPERATION,
            field,
        };
        Ok(Self {
            access_key_id: value
                .access_key_id()
                .map(str::to_owned)
                .ok_or_else(|| malformed("AccessKeyId"))?,
            status: value
                .status()
                .map(KeyStatus::from)
                .ok_or_else(|| malformed("Status"))?,
            create_date: value
                .create_date()
                .and_then(to_utc)
                .ok_or_else(|| malformed("CreateDate"))?,
        })
    }
}

/// A freshly created key pair; the secret is only ever returned here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct NewAccessKey {
    pub(crate) user_name: String,
    pub(crate) credentials: Credentials,
    pub(crate) status: KeyStatus,
    pub(crate) create_date: DateTime<Utc>,
}

impl TryFrom<&aws_sdk_iam::types::AccessKey> for NewAccessKey {
    type Error = ProviderError;
    fn try_from(value: &aws_sdk_iam::types::AccessKey) -> Result<Self, Self::Error> {
        Ok(Self {
            user_name: value.user_name().to_owned(),
            credentials: Credentials {
                access_key_id: value.access_key_id().to_owned(),
                secret_access_key: value.secret_access_key().to_owned(),
            },
            status: KeyStatus::from(value.status()),
            create_date: value.create_date().and_then(to_utc).unwrap_or_else(Utc::now),
        })
    }
}

fn to_utc(value: &aws_sdk_iam::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(value.secs(), value.subsec_nanos())
}

/// Result of identity introspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CallerIdentity {
    pub(crate) arn: String,
    pub(crate) account: String,
}

impl CallerIdentity {
    /// Last path segment of the caller arn, e.g. `alice` for
    /// `arn:aws:iam::123456789012:user/ops/alice`.
    pub(crate) fn user_name(&self) -> &str {
        let resource = self.arn.rsplit(':').next().unwrap_or_default();
        resource.rsplit('/').next().unwrap_or(resource)
    }
}

/// Key and identity operations available to one set of credentials.
///
/// `user_name` scopes an operation to another iam user; `None` acts on the
/// caller itself.
#[async_trait]
pub(crate) trait IamApi: Send + Sync {
    async fn caller_identity(&self) -> Result<CallerIdentity, ProviderError>;

    async fn list_access_keys(
        &self,
        user_name: Option<&str>,
    ) -> Result<Vec<AccessKey>, ProviderError>;

    async fn create_access_key(
        &self,
        user_name: Option<&str>,
    ) -> Result<NewAccessKey, ProviderError>;

    async fn delete_access_key(
        &self,
        access_key_id: &str,
        user_name: Option<&str>,
    ) -> Result<(), ProviderError>;

    async fn list_users(&self) -> Result<Vec<String>, ProviderError>;

    async fn account_alias(&self) -> Result<Option<String>, ProviderError>;
}

/// Opens an [`IamApi`] session for a profile's credentials.
#[async_trait]
pub(crate) trait Connect: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Box<dyn IamApi>;
}

/// Sessions backed by the AWS SDK.
pub(crate) struct Aws;

#[async_trait]
impl Connect for Aws {
    async fn connect(&self, credentials: &Credentials) -> Box<dyn IamApi> {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(RegionProviderChain::default_provider().or_else(FALLBACK_REGION))
            .credentials_provider(aws_credential_types::Credentials::from(credentials.clone()))
            .load()
            .await;
        Box::new(AwsIam {
            iam: aws_sdk_iam::Client::new(&config),
            sts: aws_sdk_sts::Client::new(&config),
        })
    }
}

struct AwsIam {
    iam: aws_sdk_iam::Client,
    sts: aws_sdk_sts::Client,
}

#[async_trait]
impl IamApi for AwsIam {
    async fn caller_identity(&self) -> Result<CallerIdentity, ProviderError> {
        const OPERATION: &str = "GetCallerIdentity";
        let output = self
            .sts
            .get_caller_identity()
            .send()
            .await
            .map_err(|err| ProviderError::from_sdk(OPERATION, err))?;
        let malformed = |field| ProviderError::Malformed {
            operation: OPERATION,
            field,
        };
        Ok(CallerIdentity {
            arn: output.arn().ok_or_else(|| malformed("Arn"))?.to_owned(),
            account: output.account().ok_or_else(|| malformed("Account"))?.to_owned(),
        })
    }

    async fn list_access_keys(
        &self,
        user_name: Option<&str>,
    ) -> Result<Vec<AccessKey>, ProviderError> {
        let output = self
            .iam
            .list_access_keys()
            .set_user_name(user_name.map(str::to_owned))
            .send()
            .await
            .map_err(|err| ProviderError::from_sdk("ListAccessKeys", err))?;
        output
            .access_key_metadata()
            .iter()
            .map(AccessKey::try_from)
            .collect()
    }

    async fn create_access_key(
        &self,
        user_name: Option<&str>,
    ) -> Result<NewAccessKey, ProviderError> {
        const OPERATION: &str = "CreateAccessKey";
        let output = self
            .iam
            .create_access_key()
            .set_user_name(user_name.map(str::to_owned))
            .send()
            .await
            .map_err(|err| ProviderError::from_sdk(OPERATION, err))?;
        output
            .access_key()
            .ok_or(ProviderError::Malformed {
                operation: OPERATION,
                field: "AccessKey",
            })?
            .try_into()
    }

    async fn delete_access_key(
        &self,
        access_key_id: &str,
        user_name: Option<&str>,
    ) -> Result<(), ProviderError> {
        self.iam
            .delete_access_key()
            .access_key_id(access_key_id)
            .set_user_name(user_name.map(str::to_owned))
            .send()
            .await
            .map_err(|err| ProviderError::from_sdk("DeleteAccessKey", err))?;
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<String>, ProviderError> {
        let mut names = Vec::new();
        let mut marker = None;
        loop {
            let output = self
                .iam
                .list_users()
                .set_marker(marker.take())
                .send()
                .await
                .map_err(|err| ProviderError::from_sdk("ListUsers", err))?;
            names.extend(output.users().iter().map(|user| user.user_name().to_owned()));
            match output.marker() {
                Some(next) => marker = Some(next.to_owned()),
                None => break,
            }
        }
        Ok(names)
    }

    async fn account_alias(&self) -> Result<Option<String>, ProviderError> {
        let output = self
            .iam
            .list_account_aliases()
            .send()
            .await
            .map_err(|err| ProviderError::from_sdk("ListAccountAliases", err))?;
        Ok(output.account_aliases().first().cloned())
    }
}
