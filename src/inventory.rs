use crate::error::RotateError;
use crate::iam::{AccessKey, IamApi, KeyStatus};
use crate::identity::Subject;
use chrono::{DateTime, Utc};
use colored::Colorize;
use std::fmt::Write;
use std::time::Duration;

/// Keys held by one iam user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Inventory {
    pub(crate) user_name: String,
    pub(crate) keys: Vec<AccessKey>,
}

impl Inventory {
    pub(crate) fn key_ids(&self) -> Vec<&str> {
        self.keys.iter().map(|k| k.access_key_id.as_str()).collect()
    }

    pub(crate) fn get(&self, access_key_id: &str) -> Option<&AccessKey> {
        self.keys.iter().find(|k| k.access_key_id == access_key_id)
    }
}

/// Lists the subject's keys. An empty list is a valid answer here; callers
/// decide whether it is acceptable.
pub(crate) async fn list_keys(
    api: &dyn IamApi,
    profile: &str,
    subject: &Subject,
) -> Result<Inventory, RotateError> {
    let user_name = subject.user_name().to_owned();
    let keys = api
        .list_access_keys(subject.scope())
        .await
        .map_err(|source| {
            if source.is_access_denied() {
                RotateError::PermissionDenied {
                    profile: profile.to_owned(),
                    source,
                }
            } else if source.is_no_such_entity() {
                RotateError::IdentityNotFound {
                    user: user_name.clone(),
                    source,
                }
            } else {
                RotateError::Provider(source)
            }
        })?;
    for key in &keys {
        tracing::info!(
            profile = profile,
            user = %user_name,
            access_key_id = %key.access_key_id,
            status = %key.status,
            create_date = %key.create_date.format("%Y-%m-%dT%H:%M:%SZ"),
            "access key found"
        );
    }
    Ok(Inventory { user_name, keys })
}

/// Human readable age in days and hours, or below one day to the hour
/// (to the minute below one hour).
pub(crate) fn format_age(age: chrono::Duration) -> String {
    let age = age.max(chrono::Duration::zero());
    let days = age.num_days();
    let hours = age.num_hours() % 24;
    match (days, hours) {
        (0, _) => {
            let secs = age.num_seconds() as u64;
            let unit = if secs >= 3600 { 3600 } else { 60 };
            humantime::format_duration(Duration::from_secs(secs / unit * unit)).to_string()
        }
        (1, 0) => "1day".to_owned(),
        (1, hours) => format!("1day {hours}h"),
        (days, 0) => format!("{days}days"),
        (days, hours) => format!("{days}days {hours}h"),
    }
}

/// Renders the key list shown before and after a rotation.
pub(crate) fn render(
    inventory: &Inventory,
    account_id: &str,
    profile: &str,
    stage: Option<&str>,
    max_age: chrono::Duration,
    now: DateTime<Utc>,
) -> String {
    let mut out = String::new();
    let title = match stage {
        Some(stage) => format!("Access Key List {stage}"),
        None => "Access Key List".to_owned(),
    };
    let _ = writeln!(out, "\n    {}\n", title.bold());
    let _ = writeln!(out, "  AWS Account:     {account_id}");
    let _ = writeln!(out, "  ------------------------------------------");
    let _ = writeln!(out, "  IAM User:        {}", inventory.user_name);
    let _ = writeln!(out, "  Profile Name:    {profile}\n");

    let numbered = inventory.keys.len() > 1;
    for (index, key) in inventory.keys.iter().enumerate() {
        let age = now - key.create_date;
        let age_text = format_age(age);
        let age_text = if age > max_age {
            age_text.red().to_string()
        } else {
            age_text
        };
        let status = match key.status {
            KeyStatus::Active => key.status.to_string().green(),
            KeyStatus::Inactive => key.status.to_string().yellow(),
        };
        let header = if numbered {
            format!("AccessKeyId {}:", index + 1)
        } else {
            "AccessKeyId:".to_owned()
        };
        let _ = writeln!(out, "  {:<17}{}", header.bold(), key.access_key_id.bold());
        let _ = writeln!(
            out,
            "  {:<17}{}",
            "CreateDate:",
            key.create_date.format("%Y-%m-%d %H:%M UTC")
        );
        let _ = writeln!(out, "  {:<17}{age_text}", "Age:");
        let _ = writeln!(out, "  {:<17}{status}\n", "Status:");
    }
    out
}
