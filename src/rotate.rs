use crate::backup::BackupRecord;
use crate::error::RotateError;
use crate::iam::{Connect, IamApi, KeyStatus, NewAccessKey};
use crate::identity::{self, Identity, Subject};
use crate::inventory::{self, Inventory};
use crate::progress;
use crate::settings::{DeprecationPolicy, Settings};
use crate::storage::{Storage, ACCESS_KEY_ID};
use chrono::Utc;
use std::path::PathBuf;

/// Progress of a rotation. A failure may occur in any stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Stage {
    Init,
    Resolved,
    Inventoried,
    Deleting,
    Creating,
    Configured,
    Written,
    Verified,
}

/// Why a key was chosen for retirement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Selection {
    OnlyKey,
    Policy(DeprecationPolicy),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RotationPlan {
    pub(crate) deprecated_key_id: String,
    pub(crate) selection: Selection,
}

/// Chooses the key to retire.
///
/// With one key, that key. With two, `Age` retires the oldest active key and
/// `CurrentInUse` retires the key `in_use` does not name.
pub(crate) fn plan(
    inventory: &Inventory,
    policy: DeprecationPolicy,
    profile: &str,
    in_use: Option<&str>,
) -> Result<RotationPlan, RotateError> {
    let user = || inventory.user_name.clone();
    match inventory.keys.as_slice() {
        [] => Err(RotateError::NoKeys { user: user() }),
        [only] => Ok(RotationPlan {
            deprecated_key_id: only.access_key_id.clone(),
            selection: Selection::OnlyKey,
        }),
        [_, _] => {
            let deprecated_key_id = match policy {
                DeprecationPolicy::Age => {
                    let mut active = inventory
                        .keys
                        .iter()
                        .filter(|k| k.status == KeyStatus::Active)
                        .collect::<Vec<_>>();
                    active.sort_by_key(|k| k.create_date);
                    active
                        .first()
                        .map(|k| k.access_key_id.clone())
                        .ok_or_else(|| RotateError::NoActiveKey { user: user() })?
                }
                DeprecationPolicy::CurrentInUse => {
                    let not_in_use = || RotateError::KeyNotInUse {
                        profile: profile.to_owned(),
                        user: user(),
                        access_key_id: in_use.unwrap_or_default().to_owned(),
                    };
                    let in_use = in_use.ok_or_else(not_in_use)?;
                    if inventory.get(in_use).is_none() {
                        return Err(not_in_use());
                    }
                    inventory
                        .keys
                        .iter()
                        .find(|k| k.access_key_id != in_use)
                        .map(|k| k.access_key_id.clone())
                        .ok_or_else(not_in_use)?
                }
            };
            Ok(RotationPlan {
                deprecated_key_id,
                selection: Selection::Policy(policy),
            })
        }
        keys => Err(RotateError::UnexpectedKeyCount {
            user: user(),
            count: keys.len(),
        }),
    }
}

#[derive(Debug)]
pub(crate) struct Outcome {
    pub(crate) profile: String,
    pub(crate) deprecated_key_id: String,
    pub(crate) access_key_id: String,
    pub(crate) verified: bool,
    pub(crate) stages: Vec<Stage>,
}

/// Drives one rotation (or listing) for a single profile.
pub(crate) struct Rotator<'a> {
    settings: &'a Settings,
    connector: &'a dyn Connect,
    quiet: bool,
    stages: Vec<Stage>,
}

impl<'a> Rotator<'a> {
    pub(crate) fn new(settings: &'a Settings, connector: &'a dyn Connect, quiet: bool) -> Self {
        Self {
            settings,
            connector,
            quiet,
            stages: Vec::new(),
        }
    }

    fn enter(&mut self, stage: Stage) {
        tracing::debug!(stage = ?stage, "rotation stage");
        self.stages.push(stage);
    }

    fn show(&self, inventory: &Inventory, account_id: &str, profile: &str, stage: Option<&str>) {
        if !self.quiet {
            println!(
                "{}",
                inventory::render(
                    inventory,
                    account_id,
                    profile,
                    stage,
                    self.settings.key_metadata.max_age(),
                    Utc::now(),
                )
            );
        }
    }

    /// Opens a session for a long-lived profile and resolves its identity.
    async fn open(
        &self,
        storage: &Storage,
        profile: &str,
    ) -> Result<(Box<dyn IamApi>, Identity), RotateError> {
        let section = storage
            .section(profile)
            .ok_or_else(|| RotateError::ProfileNotFound {
                profile: profile.to_owned(),
                path: storage.file().to_owned(),
            })?;
        if section.is_temporary() {
            return Err(RotateError::TemporaryProfile {
                profile: profile.to_owned(),
            });
        }
        let credentials = section
            .credentials()
            .ok_or_else(|| RotateError::ProfileNotFound {
                profile: profile.to_owned(),
                path: storage.file().to_owned(),
            })?;
        let session = self.connector.connect(&credentials).await;
        let identity = identity::resolve(session.as_ref(), profile)
            .await
            .map_err(|source| {
                if source.is_access_denied() {
                    RotateError::PermissionDenied {
                        profile: profile.to_owned(),
                        source,
                    }
                } else {
                    RotateError::Provider(source)
                }
            })?
            .ok_or_else(|| RotateError::AuthFailure {
                profile: profile.to_owned(),
            })?;
        Ok((session, identity))
    }

    async fn subject(
        &self,
        storage: &Storage,
        session: &dyn IamApi,
        profile: &str,
        acting: Identity,
        surrogate: Option<&str>,
    ) -> Result<Subject, RotateError> {
        let surrogate = match surrogate {
            Some(name) => {
                tracing::info!(surrogate = name, "acting on behalf of surrogate");
                Some(identity::map_surrogate(self.connector, storage, session, profile, name).await?)
            }
            None => None,
        };
        Ok(Subject { acting, surrogate })
    }

    /// Displays the key inventory of a profile (or its surrogate).
    pub(crate) async fn list(
        &mut self,
        storage: &Storage,
        profile: &str,
        surrogate: Option<&str>,
    ) -> Result<Inventory, RotateError> {
        let (session, acting) = self.open(storage, profile).await?;
        let account_id = acting.account_id.clone();
        let subject = self
            .subject(storage, session.as_ref(), profile, acting, surrogate)
            .await?;
        let inventory = inventory::list_keys(session.as_ref(), profile, &subject).await?;
        self.show(&inventory, &account_id, profile, None);
        Ok(inventory)
    }

    /// Replaces one access key of the profile (or its surrogate) and writes the
    /// new keyset into the credential store.
    pub(crate) async fn rotate(
        &mut self,
        storage: &mut Storage,
        profile: &str,
        surrogate: Option<&str>,
    ) -> Result<Outcome, RotateError> {
        self.stages.clear();
        let result = self.run(storage, profile, surrogate).await;
        if let Err(err) = &result {
            tracing::error!(
                profile = profile,
                stage = ?self.stages.last(),
                error = %err,
                "rotation failed"
            );
        }
        result
    }

    async fn run(
        &mut self,
        storage: &mut Storage,
        profile: &str,
        surrogate: Option<&str>,
    ) -> Result<Outcome, RotateError> {
        self.enter(Stage::Init);
        let (session, acting) = self.open(storage, profile).await?;
        let account_id = acting.account_id.clone();
        let subject = self
            .subject(storage, session.as_ref(), profile, acting, surrogate)
            .await?;
        self.enter(Stage::Resolved);

        let inventory = inventory::list_keys(session.as_ref(), profile, &subject).await?;
        self.enter(Stage::Inventoried);
        self.show(&inventory, &account_id, profile, Some("BEFORE ROTATION"));

        let target = target_profile(storage, profile, surrogate, &inventory)?;
        let in_use = storage
            .section(&target)
            .and_then(|section| section.get(ACCESS_KEY_ID))
            .map(str::to_owned);
        let plan = plan(
            &inventory,
            self.settings.key_metadata.key_deprecation,
            &target,
            in_use.as_deref(),
        )?;
        tracing::info!(
            profile = %target,
            user = %subject.user_name(),
            access_key_id = %plan.deprecated_key_id,
            selection = ?plan.selection,
            "deprecated access key identified"
        );

        self.enter(Stage::Deleting);
        match session
            .delete_access_key(&plan.deprecated_key_id, subject.scope())
            .await
        {
            Ok(()) => tracing::info!(access_key_id = %plan.deprecated_key_id, "access key deleted"),
            Err(err) if err.is_no_such_entity() => tracing::warn!(
                access_key_id = %plan.deprecated_key_id,
                error = %err,
                "access key already gone, continuing"
            ),
            Err(source) => {
                return Err(RotateError::DeleteFailed {
                    access_key_id: plan.deprecated_key_id,
                    source,
                })
            }
        }

        // The retired key is gone, so the identity is below the provider ceiling.
        self.enter(Stage::Creating);
        let new_key = session
            .create_access_key(subject.scope())
            .await
            .map_err(|source| {
                if source.is_access_denied() {
                    RotateError::PermissionDenied {
                        profile: profile.to_owned(),
                        source,
                    }
                } else {
                    RotateError::CreateFailed {
                        user: subject.user_name().to_owned(),
                        source,
                    }
                }
            })?;
        tracing::info!(
            user = %new_key.user_name,
            access_key_id = %new_key.credentials.access_key_id,
            "access key created"
        );
        let backup = self.backup(&target, &new_key).await;

        if !storage.merge(&target, &new_key.credentials) {
            return Err(RotateError::ProfileNotFound {
                profile: target,
                path: storage.file().to_owned(),
            });
        }
        self.enter(Stage::Configured);

        storage
            .save()
            .await
            .map_err(|source| RotateError::PersistFailed {
                profile: target.clone(),
                access_key_id: new_key.credentials.access_key_id.clone(),
                path: storage.file().to_owned(),
                backup,
                source,
            })?;
        self.enter(Stage::Written);

        progress::settle(self.settings.key_metadata.rotation_delay(), self.quiet).await;
        let verified = self
            .verify(session.as_ref(), &subject, &new_key, &account_id, profile)
            .await;
        if verified {
            self.enter(Stage::Verified);
        }

        Ok(Outcome {
            profile: target,
            deprecated_key_id: plan.deprecated_key_id,
            access_key_id: new_key.credentials.access_key_id,
            verified,
            stages: self.stages.clone(),
        })
    }

    /// Writes the backup record when enabled and returns where it landed.
    async fn backup(&self, profile: &str, new_key: &NewAccessKey) -> Option<PathBuf> {
        let backup = &self.settings.key_backup;
        if !backup.enabled {
            return None;
        }
        match BackupRecord::new(profile, new_key).write(&backup.location).await {
            Ok(path) => {
                tracing::info!(path = %path.display(), "backup record written");
                if !self.quiet {
                    println!("Copy of new keyset written to: {}", path.display());
                }
                Some(path)
            }
            Err(err) => {
                tracing::warn!(
                    location = %backup.location.display(),
                    error = %err,
                    "failed to write backup record"
                );
                None
            }
        }
    }

    /// Re-lists keys after the settle delay. Failures are reported, never
    /// rolled back.
    async fn verify(
        &self,
        acting: &dyn IamApi,
        subject: &Subject,
        new_key: &NewAccessKey,
        account_id: &str,
        profile: &str,
    ) -> bool {
        // The caller's own keys changed, so authenticate with the new pair.
        let fresh;
        let api = if subject.scope().is_some() {
            acting
        } else {
            fresh = self.connector.connect(&new_key.credentials).await;
            fresh.as_ref()
        };
        let inventory = match inventory::list_keys(api, profile, subject).await {
            Ok(inventory) => inventory,
            Err(err) => {
                tracing::warn!(error = %err, "could not verify rotated keys");
                return false;
            }
        };
        self.show(&inventory, account_id, profile, Some("AFTER ROTATION"));
        let access_key_id = &new_key.credentials.access_key_id;
        match inventory.get(access_key_id) {
            Some(key) if key.status == KeyStatus::Active => {
                tracing::info!(access_key_id = %access_key_id, keys = inventory.keys.len(), "rotation verified");
                true
            }
            Some(key) => {
                tracing::warn!(access_key_id = %access_key_id, status = %key.status, "new access key is not active");
                false
            }
            None => {
                tracing::warn!(access_key_id = %access_key_id, "new access key not listed yet");
                false
            }
        }
    }
}

/// Store section receiving the new keyset: the profile itself, or for a
/// surrogate the section named after it, else the section configured with one
/// of its keys.
fn target_profile(
    storage: &Storage,
    profile: &str,
    surrogate: Option<&str>,
    inventory: &Inventory,
) -> Result<String, RotateError> {
    let name = match surrogate {
        None => profile.to_owned(),
        Some(name) if storage.section(name).is_some() => name.to_owned(),
        Some(name) => inventory
            .key_ids()
            .into_iter()
            .find_map(|id| storage.profile_by_key(id))
            .map(|section| section.name.clone())
            .ok_or_else(|| RotateError::ProfileNotFound {
                profile: name.to_owned(),
                path: storage.file().to_owned(),
            })?,
    };
    if storage.section(&name).map_or(false, |s| s.is_temporary()) {
        return Err(RotateError::TemporaryProfile { profile: name });
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iam::AccessKey;
    use crate::testutil::{Call, Fault, FakeCloud, KEY_LIMIT};
    use chrono::{DateTime, Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
    }

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.key_metadata.rotation_delay_secs = 0;
        settings
    }

    fn key(id: &str, age_days: i64, status: KeyStatus) -> AccessKey {
        AccessKey {
            access_key_id: id.to_owned(),
            status,
            create_date: now() - Duration::days(age_days),
        }
    }

    fn inventory(keys: Vec<AccessKey>) -> Inventory {
        Inventory {
            user_name: "dev2".to_owned(),
            keys,
        }
    }

    fn store(dir: &Path, text: &str) -> Storage {
        let path = dir.join("credentials");
        std::fs::write(&path, text).unwrap();
        Storage::parse(&path, text).unwrap()
    }

    fn profile(name: &str, access_key_id: &str) -> String {
        format!(
            "[{name}]\naws_access_key_id = {access_key_id}\naws_secret_access_key = secret-{access_key_id}\n\n"
        )
    }

    fn creates_below_ceiling(cloud: &FakeCloud) -> bool {
        cloud.calls().iter().all(|call| match call {
            Call::CreateAccessKey { keys_before, .. } => *keys_before < KEY_LIMIT,
            _ => true,
        })
    }

    #[test]
    fn single_key_is_always_deprecated() {
        for policy in [DeprecationPolicy::Age, DeprecationPolicy::CurrentInUse] {
            for status in [KeyStatus::Active, KeyStatus::Inactive] {
                let plan = plan(&inventory(vec![key("AKIA1", 5, status)]), policy, "dev", None).unwrap();
                assert_eq!(plan.deprecated_key_id, "AKIA1");
                assert_eq!(plan.selection, Selection::OnlyKey);
            }
        }
    }

    #[test]
    fn age_policy_retires_oldest_active_key() {
        for keys in [
            vec![key("AKIA10", 10, KeyStatus::Active), key("AKIA20", 20, KeyStatus::Active)],
            vec![key("AKIA20", 20, KeyStatus::Active), key("AKIA10", 10, KeyStatus::Active)],
        ] {
            for in_use in ["AKIA10", "AKIA20"] {
                let plan = plan(&inventory(keys.clone()), DeprecationPolicy::Age, "dev2", Some(in_use)).unwrap();
                assert_eq!(plan.deprecated_key_id, "AKIA20");
            }
        }
    }

    #[test]
    fn age_policy_skips_inactive_oldest_key() {
        let keys = vec![key("AKIAOLD", 90, KeyStatus::Inactive), key("AKIACUR", 20, KeyStatus::Active)];
        let plan = plan(&inventory(keys), DeprecationPolicy::Age, "dev2", None).unwrap();
        assert_eq!(plan.deprecated_key_id, "AKIACUR");

        let keys = vec![key("AKIA1", 90, KeyStatus::Inactive), key("AKIA2", 20, KeyStatus::Inactive)];
        assert!(matches!(
            plan_err(keys, DeprecationPolicy::Age, None),
            RotateError::NoActiveKey { .. }
        ));
    }

    #[test]
    fn current_in_use_policy_retires_the_other_key() {
        let keys = vec![key("AKIA10", 10, KeyStatus::Active), key("AKIA20", 20, KeyStatus::Active)];
        let plan = plan(&inventory(keys.clone()), DeprecationPolicy::CurrentInUse, "dev2", Some("AKIA20")).unwrap();
        assert_eq!(plan.deprecated_key_id, "AKIA10");
        assert_eq!(plan.selection, Selection::Policy(DeprecationPolicy::CurrentInUse));

        assert!(matches!(
            plan_err(keys.clone(), DeprecationPolicy::CurrentInUse, Some("AKIAELSEWHERE")),
            RotateError::KeyNotInUse { .. }
        ));
        assert!(matches!(
            plan_err(keys, DeprecationPolicy::CurrentInUse, None),
            RotateError::KeyNotInUse { .. }
        ));
    }

    #[test]
    fn empty_and_oversized_inventories_are_rejected() {
        assert!(matches!(plan_err(vec![], DeprecationPolicy::Age, None), RotateError::NoKeys { .. }));
        let keys = vec![
            key("AKIA1", 1, KeyStatus::Active),
            key("AKIA2", 2, KeyStatus::Active),
            key("AKIA3", 3, KeyStatus::Active),
        ];
        assert!(matches!(
            plan_err(keys, DeprecationPolicy::Age, None),
            RotateError::UnexpectedKeyCount { count: 3, .. }
        ));
    }

    fn plan_err(keys: Vec<AccessKey>, policy: DeprecationPolicy, in_use: Option<&str>) -> RotateError {
        plan(&inventory(keys), policy, "dev2", in_use).unwrap_err()
    }

    #[tokio::test]
    async fn rotates_single_expired_key() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = FakeCloud::at(now());
        cloud.add_user("dev1", "111111111111");
        cloud.add_key("dev1", "AKIADEV1", 40, KeyStatus::Active);
        let mut storage = store(dir.path(), &(profile("default", "AKIAOTHER") + &profile("dev1", "AKIADEV1")));

        let settings = settings();
        let mut rotator = Rotator::new(&settings, &cloud, true);
        let outcome = rotator.rotate(&mut storage, "dev1", None).await.unwrap();

        assert_eq!(outcome.deprecated_key_id, "AKIADEV1");
        assert!(outcome.verified);
        assert_eq!(
            outcome.stages,
            [
                Stage::Init,
                Stage::Resolved,
                Stage::Inventoried,
                Stage::Deleting,
                Stage::Creating,
                Stage::Configured,
                Stage::Written,
                Stage::Verified,
            ]
        );

        let keys = cloud.keys("dev1");
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].access_key_id, outcome.access_key_id);
        assert_eq!(keys[0].create_date, now());

        let written = Storage::load(storage.file()).await.unwrap();
        let credentials = written.section("dev1").unwrap().credentials().unwrap();
        assert_eq!(credentials.access_key_id, outcome.access_key_id);
        assert_eq!(
            written.section("default").unwrap().credentials().unwrap().access_key_id,
            "AKIAOTHER"
        );
        assert!(creates_below_ceiling(&cloud));
    }

    #[tokio::test]
    async fn two_keys_retire_the_older_one() {
        for local in ["AKIA10", "AKIA20"] {
            let dir = tempfile::tempdir().unwrap();
            let cloud = FakeCloud::at(now());
            cloud.add_user("dev2", "111111111111");
            cloud.add_key("dev2", "AKIA10", 10, KeyStatus::Active);
            cloud.add_key("dev2", "AKIA20", 20, KeyStatus::Active);
            let mut storage = store(dir.path(), &profile("dev2", local));

            let settings = settings();
            let outcome = Rotator::new(&settings, &cloud, true)
                .rotate(&mut storage, "dev2", None)
                .await
                .unwrap();

            assert_eq!(outcome.deprecated_key_id, "AKIA20");
            let ids = cloud
                .keys("dev2")
                .into_iter()
                .map(|k| k.access_key_id)
                .collect::<Vec<_>>();
            assert_eq!(ids, ["AKIA10".to_owned(), outcome.access_key_id.clone()]);
            assert!(creates_below_ceiling(&cloud));
        }
    }

    #[tokio::test]
    async fn missing_key_on_delete_still_creates() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = FakeCloud::at(now());
        cloud.add_user("dev1", "111111111111");
        cloud.add_key("dev1", "AKIADEV1", 40, KeyStatus::Active);
        cloud.fail_delete(Fault::NoSuchEntity);
        let mut storage = store(dir.path(), &profile("dev1", "AKIADEV1"));

        let settings = settings();
        let outcome = Rotator::new(&settings, &cloud, true)
            .rotate(&mut storage, "dev1", None)
            .await
            .unwrap();

        assert!(cloud
            .calls()
            .iter()
            .any(|call| matches!(call, Call::CreateAccessKey { .. })));
        assert_eq!(
            Storage::load(storage.file())
                .await
                .unwrap()
                .section("dev1")
                .unwrap()
                .get(ACCESS_KEY_ID),
            Some(outcome.access_key_id.as_str())
        );
    }

    #[tokio::test]
    async fn denied_delete_aborts_before_create() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = FakeCloud::at(now());
        cloud.add_user("dev2", "111111111111");
        cloud.add_key("dev2", "AKIA10", 10, KeyStatus::Active);
        cloud.add_key("dev2", "AKIA20", 20, KeyStatus::Active);
        cloud.fail_delete(Fault::AccessDenied);
        let text = profile("dev2", "AKIA10");
        let mut storage = store(dir.path(), &text);

        let settings = settings();
        let mut rotator = Rotator::new(&settings, &cloud, true);
        let err = rotator.rotate(&mut storage, "dev2", None).await.unwrap_err();

        assert!(matches!(err, RotateError::DeleteFailed { ref access_key_id, .. } if access_key_id == "AKIA20"));
        assert_eq!(rotator.stages.last(), Some(&Stage::Deleting));
        assert!(!cloud
            .calls()
            .iter()
            .any(|call| matches!(call, Call::CreateAccessKey { .. })));
        assert_eq!(std::fs::read_to_string(storage.file()).unwrap(), text);
        assert_eq!(cloud.keys("dev2").len(), 2);
    }

    #[tokio::test]
    async fn denied_create_is_a_permission_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = FakeCloud::at(now());
        cloud.add_user("dev1", "111111111111");
        cloud.add_key("dev1", "AKIADEV1", 40, KeyStatus::Active);
        cloud.fail_create(Fault::AccessDenied);
        let text = profile("dev1", "AKIADEV1");
        let mut storage = store(dir.path(), &text);

        let settings = settings();
        let err = Rotator::new(&settings, &cloud, true)
            .rotate(&mut storage, "dev1", None)
            .await
            .unwrap_err();

        assert!(matches!(err, RotateError::PermissionDenied { .. }));
        assert_eq!(std::fs::read_to_string(storage.file()).unwrap(), text);
    }

    #[tokio::test]
    async fn failed_create_is_distinct_from_denied_create() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = FakeCloud::at(now());
        cloud.add_user("dev1", "111111111111");
        cloud.add_key("dev1", "AKIADEV1", 40, KeyStatus::Active);
        cloud.fail_create(Fault::Service);
        let mut storage = store(dir.path(), &profile("dev1", "AKIADEV1"));

        let settings = settings();
        let err = Rotator::new(&settings, &cloud, true)
            .rotate(&mut storage, "dev1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RotateError::CreateFailed { .. }));
    }

    #[tokio::test]
    async fn invalid_credentials_stop_before_any_key_operation() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = FakeCloud::at(now());
        cloud.add_user("dev1", "111111111111");
        cloud.add_key("dev1", "AKIADEV1", 40, KeyStatus::Active);
        let mut storage = store(dir.path(), &profile("dev1", "AKIASTALE"));

        let settings = settings();
        let err = Rotator::new(&settings, &cloud, true)
            .rotate(&mut storage, "dev1", None)
            .await
            .unwrap_err();

        assert!(matches!(err, RotateError::AuthFailure { .. }));
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn temporary_profiles_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = FakeCloud::at(now());
        let mut storage = store(
            dir.path(),
            "[gcreds-dev1]\naws_access_key_id = ASIA1\naws_secret_access_key = s\naws_session_token = t\n",
        );

        let settings = settings();
        let err = Rotator::new(&settings, &cloud, true)
            .rotate(&mut storage, "gcreds-dev1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RotateError::TemporaryProfile { .. }));
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_profile_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = FakeCloud::at(now());
        let mut storage = store(dir.path(), &profile("dev1", "AKIADEV1"));

        let settings = settings();
        let err = Rotator::new(&settings, &cloud, true)
            .rotate(&mut storage, "prod", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RotateError::ProfileNotFound { ref profile, .. } if profile == "prod"));
    }

    #[tokio::test]
    async fn surrogate_keys_land_in_surrogate_profile() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = FakeCloud::at(now());
        cloud.add_user("admin", "111111111111");
        cloud.add_user("svc-batch", "111111111111");
        cloud.add_key("admin", "AKIAADMIN", 5, KeyStatus::Active);
        cloud.add_key("svc-batch", "AKIASVC", 45, KeyStatus::Active);
        let mut storage = store(
            dir.path(),
            &(profile("admin", "AKIAADMIN") + &profile("batch", "AKIASVC")),
        );

        let settings = settings();
        let outcome = Rotator::new(&settings, &cloud, true)
            .rotate(&mut storage, "admin", Some("svc-batch"))
            .await
            .unwrap();

        assert_eq!(outcome.profile, "batch");
        assert_eq!(outcome.deprecated_key_id, "AKIASVC");
        assert!(outcome.verified);
        let written = Storage::load(storage.file()).await.unwrap();
        assert_eq!(
            written.section("batch").unwrap().get(ACCESS_KEY_ID),
            Some(outcome.access_key_id.as_str())
        );
        assert_eq!(written.section("admin").unwrap().get(ACCESS_KEY_ID), Some("AKIAADMIN"));
        assert!(cloud.calls().contains(&Call::DeleteAccessKey {
            user: "svc-batch".to_owned(),
            access_key_id: "AKIASVC".to_owned(),
        }));
        assert_eq!(cloud.keys("admin").len(), 1);
    }

    #[tokio::test]
    async fn persist_failure_keeps_the_new_key_visible() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = FakeCloud::at(now());
        cloud.add_user("dev1", "111111111111");
        cloud.add_key("dev1", "AKIADEV1", 40, KeyStatus::Active);
        let path = dir.path().join("missing").join("credentials");
        let mut storage = Storage::parse(&path, &profile("dev1", "AKIADEV1")).unwrap();

        let mut settings = settings();
        settings.key_backup.enabled = true;
        settings.key_backup.location = dir.path().to_owned();
        let err = Rotator::new(&settings, &cloud, true)
            .rotate(&mut storage, "dev1", None)
            .await
            .unwrap_err();

        let (access_key_id, backup) = match err {
            RotateError::PersistFailed {
                access_key_id,
                backup,
                ..
            } => (access_key_id, backup),
            other => panic!("unexpected error: {other}"),
        };
        let backup = backup.unwrap();
        assert!(backup.starts_with(dir.path()));
        let record: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&backup).unwrap()).unwrap();
        assert_eq!(record["AccessKeyId"], access_key_id.as_str());
        assert_eq!(cloud.keys("dev1")[0].access_key_id, access_key_id);
        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with("-dev1-accessKeys.json"))
            .count();
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn list_shows_inventory_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = FakeCloud::at(now());
        cloud.add_user("dev2", "111111111111");
        cloud.add_key("dev2", "AKIA10", 10, KeyStatus::Active);
        cloud.add_key("dev2", "AKIA20", 20, KeyStatus::Active);
        let storage = store(dir.path(), &profile("dev2", "AKIA10"));

        let settings = settings();
        let inventory = Rotator::new(&settings, &cloud, true)
            .list(&storage, "dev2", None)
            .await
            .unwrap();
        assert_eq!(inventory.key_ids(), ["AKIA10", "AKIA20"]);
        assert!(cloud.calls().iter().all(|call| !matches!(
            call,
            Call::CreateAccessKey { .. } | Call::DeleteAccessKey { .. }
        )));
    }
}
