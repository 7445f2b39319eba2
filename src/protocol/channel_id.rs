//! Channel identifiers
//!
//! A channel identifier names the session between two participants of a
//! tenant. Both peers derive it independently, so it must not depend on
//! which side computes it:
//!
//! ```text
//! tenant-<T>-usr-<minId>-usr-<maxId>
//! ```

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

const TENANT_PREFIX: &str = "tenant-";
const USER_SEPARATOR: &str = "-usr-";

/// A participant of a tenant (the local identity of a peer)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Participant {
    pub tenant: String,
    pub user_id: String,
}

impl Participant {
    pub fn new(tenant: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            user_id: user_id.into(),
        }
    }

    /// Channel identifier for a session with `peer_id` in the same tenant
    pub fn channel_with(&self, peer_id: &str) -> ChannelId {
        ChannelId::for_pair(&self.tenant, &self.user_id, peer_id)
    }
}

/// Deterministic key for the session between two participants
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Derive the channel identifier for an unordered pair of participants.
    ///
    /// `for_pair(t, a, b) == for_pair(t, b, a)` for every `a` and `b`.
    pub fn for_pair(tenant: &str, a: &str, b: &str) -> Self {
        let (min, max) = match compare_user_ids(a, b) {
            Ordering::Greater => (b, a),
            _ => (a, b),
        };
        Self(format!(
            "{TENANT_PREFIX}{tenant}{USER_SEPARATOR}{min}{USER_SEPARATOR}{max}"
        ))
    }

    /// Wrap an identifier received from the wire without validating it
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split the identifier into `(tenant, min_user, max_user)`.
    ///
    /// Returns `None` when the identifier does not follow the
    /// `tenant-<T>-usr-<a>-usr-<b>` layout.
    pub fn parts(&self) -> Option<(&str, &str, &str)> {
        let rest = self.0.strip_prefix(TENANT_PREFIX)?;
        let mut parts = rest.split(USER_SEPARATOR);
        let tenant = parts.next()?;
        let first = parts.next()?;
        let second = parts.next()?;
        if parts.next().is_some() || tenant.is_empty() || first.is_empty() || second.is_empty() {
            return None;
        }
        Some((tenant, first, second))
    }

    /// Check whether this channel belongs to `participant`
    pub fn involves(&self, participant: &Participant) -> bool {
        match self.parts() {
            Some((tenant, a, b)) => {
                tenant == participant.tenant
                    && (a == participant.user_id || b == participant.user_id)
            }
            None => false,
        }
    }

    /// The other participant's user id, seen from `participant`
    pub fn remote_user<'a>(&'a self, participant: &Participant) -> Option<&'a str> {
        let (tenant, a, b) = self.parts()?;
        if tenant != participant.tenant {
            return None;
        }
        if a == participant.user_id {
            Some(b)
        } else if b == participant.user_id {
            Some(a)
        } else {
            None
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(raw: &str) -> Self {
        Self::from_raw(raw)
    }
}

/// Order user ids numerically when both are integers, otherwise by bytes
fn compare_user_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_is_symmetric() {
        let pairs = [("1", "2"), ("alice", "bob"), ("42", "7"), ("x", "x"), ("10", "9")];
        for (a, b) in pairs {
            assert_eq!(
                ChannelId::for_pair("acme", a, b),
                ChannelId::for_pair("acme", b, a)
            );
        }
    }

    #[test]
    fn test_channel_id_format() {
        let id = ChannelId::for_pair("7", "12", "3");
        assert_eq!(id.as_str(), "tenant-7-usr-3-usr-12");
    }

    #[test]
    fn test_non_numeric_ids_sort_lexicographically() {
        let id = ChannelId::for_pair("t", "zed", "amy");
        assert_eq!(id.as_str(), "tenant-t-usr-amy-usr-zed");
    }

    #[test]
    fn test_parts_roundtrip() {
        let id = ChannelId::for_pair("acme", "5", "9");
        assert_eq!(id.parts(), Some(("acme", "5", "9")));
    }

    #[test]
    fn test_parts_rejects_foreign_layout() {
        assert!(ChannelId::from_raw("room-1").parts().is_none());
        assert!(ChannelId::from_raw("tenant-a-usr-1").parts().is_none());
        assert!(ChannelId::from_raw("tenant-a-usr-1-usr-2-usr-3").parts().is_none());
        assert!(ChannelId::from_raw("tenant--usr-1-usr-2").parts().is_none());
    }

    #[test]
    fn test_involves_and_remote_user() {
        let me = Participant::new("acme", "5");
        let id = me.channel_with("9");

        assert!(id.involves(&me));
        assert_eq!(id.remote_user(&me), Some("9"));

        let stranger = Participant::new("acme", "6");
        assert!(!id.involves(&stranger));
        assert_eq!(id.remote_user(&stranger), None);

        let other_tenant = Participant::new("other", "5");
        assert!(!id.involves(&other_tenant));
    }
}
