use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub uuid::Uuid);

impl UserId {
    pub fn new_random() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Stable id derived from a handle, used by fixtures and the console demo.
    pub fn from_handle(handle: &str) -> Self {
        Self(uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, handle.as_bytes()))
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::from_str(s).map(UserId)
    }
}

/// Unordered pair of identities; `(a, b)` and `(b, a)` compare equal.
#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct UserPair(UserId, UserId);

impl UserPair {
    pub fn new(a: UserId, b: UserId) -> Self {
        if a < b { Self(a, b) } else { Self(b, a) }
    }

    pub fn first(&self) -> UserId {
        self.0
    }

    pub fn second(&self) -> UserId {
        self.1
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.0 == user || self.1 == user
    }

    /// The member of the pair that is not `me`.
    pub fn other(&self, me: UserId) -> Option<UserId> {
        if self.0 == me {
            Some(self.1)
        } else if self.1 == me {
            Some(self.0)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Profile {
    pub fn new(id: UserId, username: &str) -> Self {
        Self {
            id,
            username: username.to_owned(),
            full_name: None,
            avatar_url: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.full_name.as_deref().unwrap_or(&self.username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_pair_is_order_independent() {
        let a = UserId::from_handle("alice");
        let b = UserId::from_handle("bob");

        assert_eq!(UserPair::new(a, b), UserPair::new(b, a));
        assert_eq!(UserPair::new(a, b).other(a), Some(b));
        assert_eq!(UserPair::new(a, b).other(UserId::from_handle("carol")), None);
    }

    #[test]
    fn pair_members_come_out_sorted() {
        let a = UserId::from_handle("alice");
        let b = UserId::from_handle("bob");
        let pair = UserPair::new(b, a);

        assert!(pair.first() < pair.second());
        assert_eq!([pair.first(), pair.second()], [a.min(b), a.max(b)]);
    }

    #[test]
    fn handles_map_to_stable_ids() {
        assert_eq!(UserId::from_handle("alice"), UserId::from_handle("alice"));
        assert_ne!(UserId::from_handle("alice"), UserId::from_handle("bob"));
    }
}
