use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::ModelError;

/// Identity of a quarantined session: `(project, timestamp, folder)`.
///
/// A session may arrive before its project assignment is known, in which
/// case `project` is `None` and the session sits in the unassigned area.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionKey {
    pub project: Option<String>,
    pub timestamp: String,
    pub folder_name: String,
}

impl SessionKey {
    pub fn new(
        project: Option<impl Into<String>>,
        timestamp: impl Into<String>,
        folder_name: impl Into<String>,
    ) -> Self {
        Self {
            project: project.map(Into::into),
            timestamp: timestamp.into(),
            folder_name: folder_name.into(),
        }
    }

    /// Project label used in paths and log output for unassigned sessions.
    pub const UNASSIGNED: &'static str = "Unassigned";

    pub fn project_or_unassigned(&self) -> &str {
        self.project.as_deref().unwrap_or(Self::UNASSIGNED)
    }

    /// Same identity under a different project (used when relocating).
    pub fn with_project(&self, project: impl Into<String>) -> Self {
        Self {
            project: Some(project.into()),
            timestamp: self.timestamp.clone(),
            folder_name: self.folder_name.clone(),
        }
    }

    /// Same project and timestamp under a different folder (used when a
    /// session splits into sub-sessions).
    pub fn with_folder(&self, folder_name: impl Into<String>) -> Self {
        Self {
            project: self.project.clone(),
            timestamp: self.timestamp.clone(),
            folder_name: folder_name.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.project_or_unassigned(),
            self.timestamp,
            self.folder_name
        )
    }
}

/// Lifecycle status of a prearchive session.
///
/// Busy variants mark an in-flight operation holding the session; the
/// compare-and-set transition into a busy variant is the only mutex in the
/// system. `Deleting` keeps the leading underscore of its wire form so old
/// rows parse.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionStatus {
    Receiving,
    ReceivingInterrupt,
    QueuedBuilding,
    Building,
    Archiving,
    Moving,
    Separating,
    Deleting,
    Ready,
    Conflict,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Receiving => "RECEIVING",
            SessionStatus::ReceivingInterrupt => "RECEIVING_INTERRUPT",
            SessionStatus::QueuedBuilding => "QUEUED_BUILDING",
            SessionStatus::Building => "BUILDING",
            SessionStatus::Archiving => "ARCHIVING",
            SessionStatus::Moving => "MOVING",
            SessionStatus::Separating => "SEPARATING",
            SessionStatus::Deleting => "_DELETING",
            SessionStatus::Ready => "READY",
            SessionStatus::Conflict => "CONFLICT",
            SessionStatus::Error => "ERROR",
        }
    }

    /// True when an in-progress marker holds the session.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SessionStatus::QueuedBuilding
                | SessionStatus::Building
                | SessionStatus::Archiving
                | SessionStatus::Moving
                | SessionStatus::Separating
                | SessionStatus::Deleting
        )
    }

    pub fn receiving_like(&self) -> bool {
        matches!(
            self,
            SessionStatus::Receiving | SessionStatus::ReceivingInterrupt
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RECEIVING" => Ok(SessionStatus::Receiving),
            "RECEIVING_INTERRUPT" => Ok(SessionStatus::ReceivingInterrupt),
            "QUEUED_BUILDING" => Ok(SessionStatus::QueuedBuilding),
            "BUILDING" => Ok(SessionStatus::Building),
            "ARCHIVING" => Ok(SessionStatus::Archiving),
            "MOVING" => Ok(SessionStatus::Moving),
            "SEPARATING" => Ok(SessionStatus::Separating),
            "_DELETING" => Ok(SessionStatus::Deleting),
            "READY" => Ok(SessionStatus::Ready),
            "CONFLICT" => Ok(SessionStatus::Conflict),
            "ERROR" => Ok(SessionStatus::Error),
            other => Err(ModelError::UnknownStatus(other.to_string())),
        }
    }
}

/// What happens to a session once its metadata has been rebuilt while it was
/// still receiving.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AutoArchivePolicy {
    #[default]
    None,
    Archive,
    ArchiveOverwrite,
}

impl AutoArchivePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoArchivePolicy::None => "none",
            AutoArchivePolicy::Archive => "archive",
            AutoArchivePolicy::ArchiveOverwrite => "archive-overwrite",
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, AutoArchivePolicy::None)
    }

    pub fn overwrites(&self) -> bool {
        matches!(self, AutoArchivePolicy::ArchiveOverwrite)
    }
}

impl fmt::Display for AutoArchivePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AutoArchivePolicy {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(AutoArchivePolicy::None),
            "archive" => Ok(AutoArchivePolicy::Archive),
            "archive-overwrite" => Ok(AutoArchivePolicy::ArchiveOverwrite),
            other => Err(ModelError::UnknownPolicy(other.to_string())),
        }
    }
}

/// One row of the session store: everything the state machine knows about a
/// quarantined session between operations.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionRecord {
    pub key: SessionKey,
    pub status: SessionStatus,
    /// Content-derived correlation id (typically the study instance UID).
    pub tag: Option<String>,
    pub autoarchive: AutoArchivePolicy,
    pub session_dir: PathBuf,
    /// Opaque key/value overrides folded into the rebuilt document.
    pub additional_fields: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(key: SessionKey, session_dir: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            key,
            status: SessionStatus::Receiving,
            tag: None,
            autoarchive: AutoArchivePolicy::None,
            session_dir: session_dir.into(),
            additional_fields: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}
