use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Conversation partition key.
///
/// Format: `group:{group_id}` or `private:{user_id}`. A group session's
/// transcript is shared across all member users, so every per-conversation
/// store (context, topics, traces) is keyed by this string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey(pub String);

impl SessionKey {
    pub fn for_group(group_id: &str) -> Self {
        Self(format!("group:{}", group_id))
    }

    pub fn for_private(user_id: &str) -> Self {
        Self(format!("private:{}", user_id))
    }

    /// Resolve from the (user, optional group) pair the orchestrator carries.
    /// Group wins when both are present.
    pub fn resolve(user_id: &str, group_id: Option<&str>) -> Self {
        match group_id {
            Some(gid) if !gid.trim().is_empty() => Self::for_group(gid.trim()),
            _ => Self::for_private(user_id.trim()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_group(&self) -> bool {
        self.0.starts_with("group:")
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-chat-request identifier (random UUID, not persisted beyond traces).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_wins_over_private() {
        let key = SessionKey::resolve("42", Some("777"));
        assert_eq!(key.as_str(), "group:777");
        assert!(key.is_group());
    }

    #[test]
    fn empty_group_falls_back_to_private() {
        let key = SessionKey::resolve("42", Some("  "));
        assert_eq!(key.as_str(), "private:42");
        assert!(!key.is_group());
    }
}
