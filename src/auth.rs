use serde::Deserialize;
use ulid::Ulid;

use crate::model::{Actor, Role};

/// First frame every client must send, before any request.
#[derive(Debug, Deserialize)]
pub struct Hello {
    pub token: String,
    pub actor_id: Ulid,
    pub role: Role,
}

#[derive(Debug, PartialEq, Eq)]
pub struct BadToken;

impl std::fmt::Display for BadToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "authentication failed: bad token")
    }
}

impl std::error::Error for BadToken {}

/// Check the shared token and build the connection's actor. The role is
/// taken as presented; the engine still enforces per-booking ownership.
pub fn authenticate(expected_token: &str, hello: &Hello) -> Result<Actor, BadToken> {
    if hello.token != expected_token {
        return Err(BadToken);
    }
    Ok(Actor { id: hello.actor_id, role: hello.role })
}
