use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Identifies which live sessions should see an event.
///
/// Durable delivery ignores the audience entirely; only the real-time
/// fan-out path resolves it against connected sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Audience {
    /// Every session whose verified audience scope contains `name` (e.g. "org-42").
    Channel { name: String },
    /// Every session belonging to one identity.
    User { user_id: String },
    /// Every connected session.
    Broadcast,
}

impl Audience {
    pub fn channel(name: impl Into<String>) -> Self {
        Audience::Channel { name: name.into() }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Audience::User {
            user_id: user_id.into(),
        }
    }

    /// Returns true when a session with this identity and scope set is part of the audience.
    pub fn matches(&self, user_id: &str, scopes: &HashSet<String>) -> bool {
        match self {
            Audience::Channel { name } => scopes.contains(name),
            Audience::User { user_id: target } => target == user_id,
            Audience::Broadcast => true,
        }
    }

    /// Suffix appended to the fan-out channel prefix when publishing to this audience.
    pub fn channel_suffix(&self) -> String {
        match self {
            Audience::Channel { name } => name.clone(),
            Audience::User { user_id } => format!("user.{user_id}"),
            Audience::Broadcast => "all".to_string(),
        }
    }
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Audience::Channel { name } => write!(f, "channel:{name}"),
            Audience::User { user_id } => write!(f, "user:{user_id}"),
            Audience::Broadcast => write!(f, "broadcast"),
        }
    }
}
