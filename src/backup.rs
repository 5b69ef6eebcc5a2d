use crate::iam::{KeyStatus, NewAccessKey};
use chrono::{DateTime, Local, Utc};
use serde::{Serialize, Serializer};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Copy of a newly created keyset, one file per rotation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct BackupRecord<'a> {
    pub(crate) profile: &'a str,
    pub(crate) user_name: &'a str,
    pub(crate) access_key_id: &'a str,
    pub(crate) secret_access_key: &'a str,
    #[serde(serialize_with = "serialize_status")]
    pub(crate) status: KeyStatus,
    #[serde(serialize_with = "serialize_date")]
    pub(crate) create_date: DateTime<Utc>,
}

fn serialize_status<S: Serializer>(status: &KeyStatus, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(status)
}

fn serialize_date<S: Serializer>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&date.format("%Y-%m-%dT%H:%M:%S"))
}

impl<'a> BackupRecord<'a> {
    pub(crate) fn new(profile: &'a str, key: &'a NewAccessKey) -> Self {
        Self {
            profile,
            user_name: &key.user_name,
            access_key_id: &key.credentials.access_key_id,
            secret_access_key: &key.credentials.secret_access_key,
            status: key.status,
            create_date: key.create_date,
        }
    }

    pub(crate) fn file_name(&self, today: chrono::NaiveDate) -> String {
        format!("{}-{}-accessKeys.json", today.format("%Y-%m-%d"), self.profile)
    }

    /// Writes the record into `location`, which must already exist.
    pub(crate) async fn write(&self, location: &Path) -> io::Result<PathBuf> {
        if !fs::metadata(location).await?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a directory", location.display()),
            ));
        }
        let path = location.join(self.file_name(Local::now().date_naive()));
        if fs::metadata(&path).await.is_ok() {
            tracing::info!(path = %path.display(), "overwriting existing backup record");
        }
        let bytes = serde_json::to_vec_pretty(self).map_err(io::Error::from)?;
        fs::write(&path, bytes).await?;
        Ok(path)
    }
}
