use crate::iam::{AccessKey, Connect, IamApi};
use crate::identity::{self, Subject};
use crate::inventory;
use crate::progress;
use crate::settings::KeyMetadata;
use crate::storage::{Storage, ACCESS_KEY_ID};
use chrono::{DateTime, Duration, Utc};
use colored::{ColoredString, Colorize};
use std::collections::HashMap;
use std::fmt::{self, Write};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum KeyHealth {
    Valid,
    NearExpiration,
    Expired,
}

impl fmt::Display for KeyHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Valid => "Valid",
            Self::NearExpiration => "Warning",
            Self::Expired => "Expired",
        })
    }
}

impl KeyHealth {
    fn paint(self, text: &str) -> ColoredString {
        match self {
            Self::Valid => text.green(),
            Self::NearExpiration => text.yellow(),
            Self::Expired => text.red(),
        }
    }
}

/// Classifies a key by age. A key is expired once its age reaches the
/// maximum, and near expiration when less than `warning` remains.
pub(crate) fn classify(
    create_date: DateTime<Utc>,
    now: DateTime<Utc>,
    max_age: Duration,
    warning: Duration,
) -> KeyHealth {
    let remaining = max_age - (now - create_date);
    if remaining <= Duration::zero() {
        KeyHealth::Expired
    } else if remaining < warning {
        KeyHealth::NearExpiration
    } else {
        KeyHealth::Valid
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Row {
    pub(crate) profile: String,
    pub(crate) iam_user: String,
    pub(crate) account: String,
    pub(crate) access_key_id: String,
    pub(crate) create_date: DateTime<Utc>,
    pub(crate) remaining: Duration,
    pub(crate) health: KeyHealth,
}

/// A profile the report could not query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Exception {
    pub(crate) profile: String,
    pub(crate) reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Report {
    pub(crate) rows: Vec<Row>,
    pub(crate) exceptions: Vec<Exception>,
}

/// Queries every long-lived profile in the store. Never mutates provider or
/// local state; per-profile failures become exceptions.
pub(crate) async fn build(
    connector: &dyn Connect,
    storage: &Storage,
    key_metadata: &KeyMetadata,
    now: DateTime<Utc>,
) -> Report {
    let mut report = Report::default();
    let mut aliases = HashMap::new();
    for profile in storage.profile_names() {
        match query(connector, storage, profile, key_metadata, now, &mut aliases).await {
            Ok(row) => {
                tracing::debug!(
                    profile = profile,
                    access_key_id = %row.access_key_id,
                    health = %row.health,
                    "profile classified"
                );
                report.rows.push(row);
            }
            Err(reason) => {
                tracing::warn!(profile = profile, reason = %reason, "profile excluded from report");
                report.exceptions.push(Exception {
                    profile: profile.to_owned(),
                    reason,
                });
            }
        }
    }
    report
}

async fn query(
    connector: &dyn Connect,
    storage: &Storage,
    profile: &str,
    key_metadata: &KeyMetadata,
    now: DateTime<Utc>,
    aliases: &mut HashMap<String, String>,
) -> Result<Row, String> {
    let section = storage
        .section(profile)
        .ok_or_else(|| "profile not found".to_owned())?;
    let credentials = section
        .credentials()
        .ok_or_else(|| "no access key configured".to_owned())?;
    let session = connector.connect(&credentials).await;
    let acting = identity::resolve(session.as_ref(), profile)
        .await
        .map_err(|err| err.to_string())?
        .ok_or_else(|| "expired or invalid credentials".to_owned())?;
    let subject = Subject {
        acting,
        surrogate: None,
    };
    let inventory = inventory::list_keys(session.as_ref(), profile, &subject)
        .await
        .map_err(|err| err.to_string())?;
    let key = local_key(&inventory.keys, section.get(ACCESS_KEY_ID))
        .ok_or_else(|| "no access keys".to_owned())?;

    let account = account_label(session.as_ref(), &subject.acting.account_id, aliases).await;
    let max_age = key_metadata.max_age();
    Ok(Row {
        profile: profile.to_owned(),
        iam_user: inventory.user_name.clone(),
        account,
        access_key_id: key.access_key_id.clone(),
        create_date: key.create_date,
        remaining: max_age - (now - key.create_date),
        health: classify(key.create_date, now, max_age, key_metadata.warning()),
    })
}

/// The key configured locally, else the first one listed.
fn local_key<'a>(keys: &'a [AccessKey], configured: Option<&str>) -> Option<&'a AccessKey> {
    configured
        .and_then(|id| keys.iter().find(|k| k.access_key_id == id))
        .or_else(|| keys.first())
}

async fn account_label(
    api: &dyn IamApi,
    account_id: &str,
    aliases: &mut HashMap<String, String>,
) -> String {
    if let Some(label) = aliases.get(account_id) {
        return label.clone();
    }
    let label = match api.account_alias().await {
        Ok(Some(alias)) => alias,
        Ok(None) => account_id.to_owned(),
        Err(err) => {
            tracing::debug!(account = account_id, error = %err, "account alias unavailable");
            account_id.to_owned()
        }
    };
    aliases.insert(account_id.to_owned(), label.clone());
    label
}

fn time_remaining(row: &Row) -> String {
    if row.health == KeyHealth::Expired {
        "overdue".to_owned()
    } else if row.remaining >= Duration::days(1) {
        format!("{} days", row.remaining.num_days())
    } else {
        format!("{} hrs", row.remaining.num_hours())
    }
}

pub(crate) fn render(report: &Report, key_metadata: &KeyMetadata) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n    {}\n", "Access Key Report".bold());
    let _ = writeln!(
        out,
        "  {:<20}{:<20}{:<18}{:<22}{:<16}{}",
        "ProfileName", "IAM User", "AWS Account", "CreateDate", "Time Remaining", "Status"
    );
    let _ = writeln!(out, "  {}", "-".repeat(104));
    for row in &report.rows {
        let _ = writeln!(
            out,
            "  {:<20}{:<20}{:<18}{:<22}{:<16}{}",
            row.profile,
            row.iam_user,
            row.account,
            row.create_date.format("%Y-%m-%d %H:%M UTC").to_string(),
            time_remaining(row),
            row.health.paint(&row.health.to_string()),
        );
    }

    let _ = writeln!(out, "\n  Legend:");
    let _ = writeln!(
        out,
        "    {}  key younger than {} days",
        KeyHealth::Valid.paint(&format!("{:<8}", KeyHealth::Valid)),
        key_metadata.keyage_max_days
    );
    let _ = writeln!(
        out,
        "    {}  key expires within {} days",
        KeyHealth::NearExpiration.paint(&format!("{:<8}", KeyHealth::NearExpiration)),
        key_metadata.keyage_warning_days
    );
    let _ = writeln!(
        out,
        "    {}  key is {} days old or older, rotate now",
        KeyHealth::Expired.paint(&format!("{:<8}", KeyHealth::Expired)),
        key_metadata.keyage_max_days
    );

    if !report.exceptions.is_empty() {
        let _ = writeln!(out, "\n  {}", "Profiles not reported:".bold());
        for exception in &report.exceptions {
            let _ = writeln!(out, "    {:<20}{}", exception.profile, exception.reason);
        }
    }
    out
}

/// Builds the report behind a progress indicator and prints it.
pub(crate) async fn run(
    connector: &dyn Connect,
    storage: &Storage,
    key_metadata: &KeyMetadata,
    quiet: bool,
) -> Report {
    let report = progress::with_progress(
        "Querying key metadata",
        std::time::Duration::ZERO,
        quiet,
        build(connector, storage, key_metadata, Utc::now()),
    )
    .await;
    tracing::info!(
        profiles = report.rows.len(),
        exceptions = report.exceptions.len(),
        "key report generated"
    );
    if !quiet {
        println!("{}", render(&report, key_metadata));
    }
    report
}
