use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Model error: {0}")]
    Model(#[from] prearchive_model::ModelError),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("duplicate content-identified entry {uid} ({uri})")]
    DuplicateContentEntry { uid: String, uri: String },

    #[error("duplicate path-identified entry at {uri}")]
    DuplicatePath { uri: String },

    #[error(
        "cannot overwrite {uri}: existing content identity {existing_uid:?} \
         does not match incoming {incoming_uid}"
    )]
    CrossIdentityConflict {
        uri: String,
        incoming_uid: String,
        existing_uid: Option<String>,
    },

    #[error("destination session already exists: {destination}")]
    DestinationExists { destination: String },

    #[error("session {key} is locked by another operation")]
    Locked { key: String },

    #[error("user {username} may not modify project {project}")]
    PermissionDenied { username: String, project: String },

    #[error("session not found: {key}")]
    SessionNotFound { key: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ArchiveError {
    /// Conflicts map to HTTP 409 at the API layer.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ArchiveError::DuplicateContentEntry { .. }
                | ArchiveError::DuplicatePath { .. }
                | ArchiveError::CrossIdentityConflict { .. }
                | ArchiveError::DestinationExists { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;
