use crate::domain_model::*;
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A deferred storage write. Applied at most once, possibly never.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistTask {
    SaveMessage {
        channel_id: ChannelId,
        user_id: UserId,
        payload: Bytes,
    },
    SaveRefreshToken {
        user_id: UserId,
        token: String,
        expires_at: DateTime<Utc>,
    },
    SaveSubjectMessage {
        subject: Subject,
        payload: Bytes,
    },
}

impl PersistTask {
    pub fn kind(&self) -> &'static str {
        match self {
            PersistTask::SaveMessage { .. } => "save_message",
            PersistTask::SaveRefreshToken { .. } => "save_refresh_token",
            PersistTask::SaveSubjectMessage { .. } => "save_subject_message",
        }
    }
}

pub trait TaskQueue: Send + Sync {
    /// Never blocks. Returns `false` when the task was dropped.
    fn submit(&self, task: PersistTask) -> bool;
}
