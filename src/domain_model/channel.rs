use crate::domain_model::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub i64);

impl ChannelId {
    /// Key under which the presence counter of this channel is kept.
    pub fn presence_key(&self) -> String {
        format!("channel:{}", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid id")]
pub struct InvalidId;

impl FromStr for ChannelId {
    type Err = InvalidId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<i64>() {
            Ok(id) if id > 0 => Ok(ChannelId(id)),
            _ => Err(InvalidId),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub id: i64,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub subject: Subject,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_parse() {
        assert_eq!("42".parse::<ChannelId>(), Ok(ChannelId(42)));
        assert!("0".parse::<ChannelId>().is_err());
        assert!("-3".parse::<ChannelId>().is_err());
        assert!("abc".parse::<ChannelId>().is_err());
    }

    #[test]
    fn test_presence_key() {
        assert_eq!(ChannelId(7).presence_key(), "channel:7");
    }
}
