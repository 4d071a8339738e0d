use std::fmt;

use thiserror::Error;

use crate::models::PeerId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic is empty")]
    Empty,

    #[error("topic must be relative, got leading '/'")]
    Absolute,

    #[error("topic contains invalid character {0:?}")]
    InvalidChar(char),

    #[error("topic contains an empty or parent segment")]
    BadSegment,
}

/// What a channel carries, inferred from its topic path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Swipe,
    Notifications,
    Messages(PeerId),
    Other,
}

/// Path of a push-stream channel relative to the streaming prefix,
/// e.g. `swipe/` or `message/42/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    pub fn parse(raw: &str) -> Result<Self, TopicError> {
        if raw.is_empty() {
            return Err(TopicError::Empty);
        }
        if raw.starts_with('/') {
            return Err(TopicError::Absolute);
        }
        if let Some(c) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_')))
        {
            return Err(TopicError::InvalidChar(c));
        }
        let trimmed = raw.strip_suffix('/').unwrap_or(raw);
        if trimmed.split('/').any(|seg| seg.is_empty() || seg == "..") {
            return Err(TopicError::BadSegment);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn swipe() -> Self {
        Self("swipe/".into())
    }

    pub fn notifications() -> Self {
        Self("notification/".into())
    }

    pub fn messages(peer: PeerId) -> Self {
        Self(format!("message/{}/", peer))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> TopicKind {
        let mut segments = self.0.split('/').filter(|s| !s.is_empty());
        match (segments.next(), segments.next(), segments.next()) {
            (Some("swipe"), None, _) => TopicKind::Swipe,
            (Some("notification"), None, _) => TopicKind::Notifications,
            (Some("message"), Some(id), None) => id
                .parse::<u64>()
                .map(|id| TopicKind::Messages(PeerId(id)))
                .unwrap_or(TopicKind::Other),
            _ => TopicKind::Other,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
