//! In-memory provider used by the unit tests.

use crate::iam::{AccessKey, CallerIdentity, Connect, IamApi, KeyStatus, NewAccessKey, ProviderError};
use crate::storage::Credentials;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Provider-side ceiling of keys per user.
pub(crate) const KEY_LIMIT: usize = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    CallerIdentity { user: String },
    ListAccessKeys { user: String },
    CreateAccessKey { user: String, keys_before: usize },
    DeleteAccessKey { user: String, access_key_id: String },
    ListUsers,
    AccountAlias,
}

/// Failure to inject into the next matching call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Fault {
    AccessDenied,
    NoSuchEntity,
    Service,
}

impl Fault {
    fn error(self, operation: &'static str) -> ProviderError {
        let message = "injected".to_owned();
        match self {
            Self::AccessDenied => ProviderError::AccessDenied { operation, message },
            Self::NoSuchEntity => ProviderError::NoSuchEntity { operation, message },
            Self::Service => ProviderError::Service {
                operation,
                code: "ServiceFailure".to_owned(),
                message,
            },
        }
    }
}

#[derive(Clone, Debug)]
struct StoredKey {
    key: AccessKey,
    secret: String,
}

#[derive(Debug, Default)]
struct User {
    account: String,
    keys: Vec<StoredKey>,
}

#[derive(Debug, Default)]
struct State {
    users: BTreeMap<String, User>,
    aliases: BTreeMap<String, String>,
    calls: Vec<Call>,
    delete_fault: Option<Fault>,
    create_fault: Option<Fault>,
    list_fault: Option<Fault>,
    next_key: usize,
}

#[derive(Clone, Default)]
pub(crate) struct FakeCloud {
    state: Arc<Mutex<State>>,
    now: Option<DateTime<Utc>>,
}

impl FakeCloud {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Pins the clock used for keys created by the fake.
    pub(crate) fn at(now: DateTime<Utc>) -> Self {
        Self {
            state: Arc::default(),
            now: Some(now),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub(crate) fn add_user(&self, user: &str, account: &str) {
        self.state().users.insert(
            user.to_owned(),
            User {
                account: account.to_owned(),
                keys: Vec::new(),
            },
        );
    }

    pub(crate) fn set_alias(&self, account: &str, alias: &str) {
        self.state()
            .aliases
            .insert(account.to_owned(), alias.to_owned());
    }

    /// Adds a key created `age_days` ago and returns its credentials.
    pub(crate) fn add_key(&self, user: &str, access_key_id: &str, age_days: i64, status: KeyStatus) -> Credentials {
        let create_date = self.now() - Duration::days(age_days);
        let credentials = Credentials {
            access_key_id: access_key_id.to_owned(),
            secret_access_key: format!("secret-{access_key_id}"),
        };
        self.state()
            .users
            .get_mut(user)
            .unwrap()
            .keys
            .push(StoredKey {
                key: AccessKey {
                    access_key_id: access_key_id.to_owned(),
                    status,
                    create_date,
                },
                secret: credentials.secret_access_key.clone(),
            });
        credentials
    }

    pub(crate) fn keys(&self, user: &str) -> Vec<AccessKey> {
        self.state().users[user]
            .keys
            .iter()
            .map(|k| k.key.clone())
            .collect()
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub(crate) fn fail_delete(&self, fault: Fault) {
        self.state().delete_fault = Some(fault);
    }

    pub(crate) fn fail_create(&self, fault: Fault) {
        self.state().create_fault = Some(fault);
    }

    pub(crate) fn fail_list(&self, fault: Fault) {
        self.state().list_fault = Some(fault);
    }
}

#[async_trait]
impl Connect for FakeCloud {
    async fn connect(&self, credentials: &Credentials) -> Box<dyn IamApi> {
        let caller = self.state().users.iter().find_map(|(name, user)| {
            user.keys
                .iter()
                .any(|k| {
                    k.key.access_key_id == credentials.access_key_id
                        && k.secret == credentials.secret_access_key
                        && k.key.status == KeyStatus::Active
                })
                .then(|| name.clone())
        });
        Box::new(FakeSession {
            cloud: self.clone(),
            caller,
        })
    }
}

/// A session keeps the identity it authenticated as, even if its key is
/// deleted afterwards.
struct FakeSession {
    cloud: FakeCloud,
    caller: Option<String>,
}

impl FakeSession {
    fn caller(&self, operation: &'static str) -> Result<&str, ProviderError> {
        self.caller
            .as_deref()
            .ok_or_else(|| ProviderError::InvalidCredentials {
                operation,
                message: "unknown access key".to_owned(),
            })
    }

    fn target(&self, operation: &'static str, user_name: Option<&str>) -> Result<String, ProviderError> {
        let caller = self.caller(operation)?;
        Ok(user_name.unwrap_or(caller).to_owned())
    }
}

fn no_such_user(operation: &'static str, user: &str) -> ProviderError {
    ProviderError::NoSuchEntity {
        operation,
        message: format!("user {user} not found"),
    }
}

#[async_trait]
impl IamApi for FakeSession {
    async fn caller_identity(&self) -> Result<CallerIdentity, ProviderError> {
        let user = self.caller("GetCallerIdentity")?;
        let mut state = self.cloud.state();
        state.calls.push(Call::CallerIdentity {
            user: user.to_owned(),
        });
        Ok(CallerIdentity {
            arn: format!("arn:aws:iam::{}:user/{user}", state.users[user].account),
            account: state.users[user].account.clone(),
        })
    }

    async fn list_access_keys(&self, user_name: Option<&str>) -> Result<Vec<AccessKey>, ProviderError> {
        const OPERATION: &str = "ListAccessKeys";
        let user = self.target(OPERATION, user_name)?;
        let mut state = self.cloud.state();
        state.calls.push(Call::ListAccessKeys { user: user.clone() });
        if let Some(fault) = state.list_fault.take() {
            return Err(fault.error(OPERATION));
        }
        let keys = &state
            .users
            .get(&user)
            .ok_or_else(|| no_such_user(OPERATION, &user))?
            .keys;
        Ok(keys.iter().map(|k| k.key.clone()).collect())
    }

    async fn create_access_key(&self, user_name: Option<&str>) -> Result<NewAccessKey, ProviderError> {
        const OPERATION: &str = "CreateAccessKey";
        let user = self.target(OPERATION, user_name)?;
        let now = self.cloud.now();
        let mut state = self.cloud.state();
        let keys_before = state.users.get(&user).map_or(0, |u| u.keys.len());
        state.calls.push(Call::CreateAccessKey {
            user: user.clone(),
            keys_before,
        });
        if let Some(fault) = state.create_fault.take() {
            return Err(fault.error(OPERATION));
        }
        if keys_before >= KEY_LIMIT {
            return Err(ProviderError::Service {
                operation: OPERATION,
                code: "LimitExceeded".to_owned(),
                message: format!("{user} already holds {keys_before} keys"),
            });
        }
        state.next_key += 1;
        let access_key_id = format!("AKIANEW{}", state.next_key);
        let credentials = Credentials {
            access_key_id: access_key_id.clone(),
            secret_access_key: format!("secret-{access_key_id}"),
        };
        state
            .users
            .get_mut(&user)
            .ok_or_else(|| no_such_user(OPERATION, &user))?
            .keys
            .push(StoredKey {
                key: AccessKey {
                    access_key_id,
                    status: KeyStatus::Active,
                    create_date: now,
                },
                secret: credentials.secret_access_key.clone(),
            });
        Ok(NewAccessKey {
            user_name: user,
            credentials,
            status: KeyStatus::Active,
            create_date: now,
        })
    }

    async fn delete_access_key(&self, access_key_id: &str, user_name: Option<&str>) -> Result<(), ProviderError> {
        const OPERATION: &str = "DeleteAccessKey";
        let user = self.target(OPERATION, user_name)?;
        let mut state = self.cloud.state();
        state.calls.push(Call::DeleteAccessKey {
            user: user.clone(),
            access_key_id: access_key_id.to_owned(),
        });
        if let Some(fault) = state.delete_fault.take() {
            return Err(fault.error(OPERATION));
        }
        let keys = &mut state
            .users
            .get_mut(&user)
            .ok_or_else(|| no_such_user(OPERATION, &user))?
            .keys;
        let before = keys.len();
        keys.retain(|k| k.key.access_key_id != access_key_id);
        if keys.len() == before {
            return Err(ProviderError::NoSuchEntity {
                operation: OPERATION,
                message: format!("access key {access_key_id} not found"),
            });
        }
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<String>, ProviderError> {
        self.caller("ListUsers")?;
        let mut state = self.cloud.state();
        state.calls.push(Call::ListUsers);
        Ok(state.users.keys().cloned().collect())
    }

    async fn account_alias(&self) -> Result<Option<String>, ProviderError> {
        let user = self.caller("ListAccountAliases")?;
        let mut state = self.cloud.state();
        state.calls.push(Call::AccountAlias);
        let account = &state.users[user].account;
        Ok(state.aliases.get(account).cloned())
    }
}
