use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one session, `sess_<uuid v7>`.
///
/// Sessions are never persisted; the id only tags log spans.
/// Ids sort in creation order.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    const PREFIX: &'static str = "sess";

    pub fn new() -> Self {
        Self(format!("{}_{}", Self::PREFIX, Uuid::now_v7()))
    }

    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_has_prefix() {
        let id = SessionId::new();
        assert!(id.as_str().starts_with("sess_"), "got: {id}");
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn serde_is_transparent() {
        let id = SessionId::from_raw("sess_fixed");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"sess_fixed\"");
    }

    #[test]
    fn creation_order_is_preserved() {
        let ids: Vec<SessionId> = (0..100).map(|_| SessionId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0].as_str() < w[1].as_str(), "not ordered: {} >= {}", w[0], w[1]);
        }
    }
}
