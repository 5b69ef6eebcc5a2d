use std::env;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::fs;

pub(crate) const ACCESS_KEY_ID: &str = "aws_access_key_id";
pub(crate) const SECRET_ACCESS_KEY: &str = "aws_secret_access_key";

/// Keys marking a section as temporary (session or role) credentials.
const TEMPORARY_MARKERS: [&str; 3] = ["aws_security_token", "aws_session_token", "role_arn"];

#[derive(Debug, Error)]
pub(crate) enum StoreError {
    #[error("failed to read credentials {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}:{line}: {reason}", .path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        reason: &'static str,
    },
    #[error("missing home directory")]
    NoHome,
}

/// Long-lived access key pair of a profile.
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct Credentials {
    pub(crate) access_key_id: String,
    pub(crate) secret_access_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .finish()
    }
}

impl From<Credentials> for aws_credential_types::Credentials {
    fn from(value: Credentials) -> Self {
        Self::new(
            value.access_key_id,
            value.secret_access_key,
            None,
            None,
            "aws-key-rotate",
        )
    }
}

/// One `[name]` section; entries keep their file order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Section {
    pub(crate) name: String,
    entries: Vec<(String, String)>,
}

impl Section {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn set(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_owned(),
            None => self.entries.push((key.to_owned(), value.to_owned())),
        }
    }

    pub(crate) fn is_temporary(&self) -> bool {
        TEMPORARY_MARKERS.iter().any(|marker| self.get(marker).is_some())
    }

    pub(crate) fn credentials(&self) -> Option<Credentials> {
        Some(Credentials {
            access_key_id: self.get(ACCESS_KEY_ID)?.to_owned(),
            secret_access_key: self.get(SECRET_ACCESS_KEY)?.to_owned(),
        })
    }
}

/// The profile-keyed shared credentials file.
///
/// Sections and their entries round-trip in order; comments and blank lines
/// are not preserved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Storage {
    path: PathBuf,
    sections: Vec<Section>,
}

impl Storage {
    /// `$AWS_SHARED_CREDENTIALS_FILE`, or `~/.aws/credentials`.
    pub(crate) fn path() -> Result<PathBuf, StoreError> {
        if let Some(path) = env::var_os("AWS_SHARED_CREDENTIALS_FILE") {
            return Ok(PathBuf::from(path));
        }
        Ok(dirs::home_dir()
            .ok_or(StoreError::NoHome)?
            .join(".aws")
            .join("credentials"))
    }

    pub(crate) async fn load(path: &Path) -> Result<Self, StoreError> {
        let text = fs::read_to_string(path)
            .await
            .map_err(|source| StoreError::Read {
                path: path.to_owned(),
                source,
            })?;
        Self::parse(path, &text)
    }

    pub(crate) fn parse(path: &Path, text: &str) -> Result<Self, StoreError> {
        let parse_err = |line, reason| StoreError::Parse {
            path: path.to_owned(),
            line,
            reason,
        };
        let mut sections: Vec<Section> = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(header) = line.strip_prefix('[') {
                let name = header
                    .strip_suffix(']')
                    .ok_or_else(|| parse_err(index + 1, "unterminated section header"))?
                    .trim();
                if name.is_empty() {
                    return Err(parse_err(index + 1, "empty section name"));
                }
                if sections.iter().any(|s| s.name == name) {
                    return Err(parse_err(index + 1, "duplicate section"));
                }
                sections.push(Section::new(name));
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| parse_err(index + 1, "expected key = value"))?;
            let section = sections
                .last_mut()
                .ok_or_else(|| parse_err(index + 1, "entry outside of a section"))?;
            section.set(key.trim(), value.trim());
        }
        Ok(Self {
            path: path.to_owned(),
            sections,
        })
    }

    pub(crate) fn file(&self) -> &Path {
        &self.path
    }

    pub(crate) fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }

    pub(crate) fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Names of the sections holding long-lived keys.
    pub(crate) fn profile_names(&self) -> Vec<&str> {
        self.sections()
            .filter(|s| !s.is_temporary() && s.credentials().is_some())
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Finds the section configured with `access_key_id`.
    pub(crate) fn profile_by_key(&self, access_key_id: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| s.get(ACCESS_KEY_ID) == Some(access_key_id))
    }

    /// Overwrites the key pair of an existing profile. Returns `false` when the
    /// profile does not exist.
    #[must_use]
    pub(crate) fn merge(&mut self, profile: &str, credentials: &Credentials) -> bool {
        match self.sections.iter_mut().find(|s| s.name == profile) {
            Some(section) => {
                section.set(ACCESS_KEY_ID, &credentials.access_key_id);
                section.set(SECRET_ACCESS_KEY, &credentials.secret_access_key);
                true
            }
            None => false,
        }
    }

    /// Copy of the store with temporary sections removed.
    pub(crate) fn without_temporary(&self) -> Self {
        Self {
            path: self.path.clone(),
            sections: self
                .sections
                .iter()
                .filter(|s| !s.is_temporary())
                .cloned()
                .collect(),
        }
    }

    pub(crate) fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            out.push('[');
            out.push_str(&section.name);
            out.push_str("]\n");
            for (key, value) in &section.entries {
                out.push_str(key);
                out.push_str(" = ");
                out.push_str(value);
                out.push('\n');
            }
            out.push('\n');
        }
        out
    }

    /// Rewrites the whole file, then refreshes a sibling `<path>.orig` copy
    /// (without temporary sections) if one exists. Only the primary write can
    /// fail the call.
    pub(crate) async fn save(&self) -> io::Result<()> {
        tracing::info!(path = %self.path.display(), "writing credentials file");
        replace(&self.path, self.render()).await?;

        let sibling = sibling_path(&self.path);
        if fs::metadata(&sibling).await.is_ok() {
            tracing::info!(path = %sibling.display(), "updating alternate credentials file");
            match replace(&sibling, self.without_temporary().render()).await {
                Ok(()) => tracing::info!(path = %sibling.display(), "alternate credentials file updated"),
                Err(err) => tracing::warn!(
                    path = %sibling.display(),
                    error = %err,
                    "failed to update alternate credentials file"
                ),
            }
        }
        Ok(())
    }
}

/// Writes `contents` to a temporary file next to `path` and renames it over
/// `path`. On failure the existing file is left as it was.
async fn replace(path: &Path, contents: String) -> io::Result<()> {
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || {
        let dir = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut file = NamedTempFile::new_in(dir)?;
        if let Ok(metadata) = std::fs::metadata(&path) {
            file.as_file().set_permissions(metadata.permissions())?;
        }
        file.write_all(contents.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(&path).map_err(|err| err.error)?;
        Ok(())
    })
    .await
    .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
}

fn sibling_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".orig");
    PathBuf::from(name)
}
