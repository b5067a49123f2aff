use crate::domain_model::ChannelId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Subject used when the caller names neither a subject nor a channel.
pub const DEFAULT_SUBJECT: &str = "storm.events";

/// A bus subject. Caller-supplied values are restricted to `[A-Za-z0-9._-]+`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Subject(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid subject")]
pub struct InvalidSubject;

impl Subject {
    pub fn for_channel(id: ChannelId) -> Self {
        Subject(format!("channels.{}", id.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_valid(raw: &str) -> bool {
        !raw.is_empty()
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
    }
}

impl Default for Subject {
    fn default() -> Self {
        Subject(DEFAULT_SUBJECT.to_owned())
    }
}

impl FromStr for Subject {
    type Err = InvalidSubject;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if Self::is_valid(s) {
            Ok(Subject(s.to_owned()))
        } else {
            Err(InvalidSubject)
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a streaming connection is attached: a bare subject, or a channel
/// (which implies its derived subject).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub subject: Subject,
    pub channel_id: Option<ChannelId>,
}

impl StreamTarget {
    /// `channel_id` wins over `subject`; neither yields the default subject.
    pub fn resolve(
        subject: Option<&str>,
        channel_id: Option<&str>,
    ) -> Result<Self, TargetError> {
        if let Some(raw) = channel_id.filter(|s| !s.is_empty()) {
            let id = raw.parse::<ChannelId>().map_err(|_| TargetError::Channel)?;
            return Ok(StreamTarget {
                subject: Subject::for_channel(id),
                channel_id: Some(id),
            });
        }
        Ok(StreamTarget {
            subject: Self::subject_only(subject)?,
            channel_id: None,
        })
    }

    /// Resolves the `subject` parameter alone, falling back to the default.
    pub fn subject_only(subject: Option<&str>) -> Result<Subject, TargetError> {
        match subject.filter(|s| !s.is_empty()) {
            Some(raw) => raw.parse().map_err(|_| TargetError::Subject),
            None => Ok(Subject::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("invalid subject")]
    Subject,
    #[error("invalid channel id")]
    Channel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_charset() {
        assert!("orders.eu-west_1".parse::<Subject>().is_ok());
        assert!("".parse::<Subject>().is_err());
        assert!("bad subject".parse::<Subject>().is_err());
        assert!("a.>".parse::<Subject>().is_err());
        assert!("a.*".parse::<Subject>().is_err());
    }

    #[test]
    fn test_resolve_prefers_channel() {
        let target = StreamTarget::resolve(Some("other"), Some("42")).unwrap();
        assert_eq!(target.subject.as_str(), "channels.42");
        assert_eq!(target.channel_id, Some(ChannelId(42)));
    }

    #[test]
    fn test_resolve_defaults() {
        let target = StreamTarget::resolve(None, None).unwrap();
        assert_eq!(target.subject.as_str(), DEFAULT_SUBJECT);
        assert_eq!(target.channel_id, None);

        let target = StreamTarget::resolve(Some(""), Some("")).unwrap();
        assert_eq!(target.subject.as_str(), DEFAULT_SUBJECT);
    }

    #[test]
    fn test_resolve_rejects() {
        assert_eq!(
            StreamTarget::resolve(None, Some("x1")),
            Err(TargetError::Channel)
        );
        assert_eq!(
            StreamTarget::resolve(Some("no spaces"), None),
            Err(TargetError::Subject)
        );
    }
}
