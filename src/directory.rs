//! User-profile lookups, consumed as an external capability.
//!
//! Account storage, friendships and profile data live in the CRUD layer
//! outside this crate; the signaling core only asks the questions below.

use crate::types::user::UserId;
use async_trait::async_trait;

#[async_trait]
pub trait Directory: Send + Sync {
    async fn user_exists(&self, user: &UserId) -> bool;

    /// Display identity for UI surfacing. `None` means the lookup failed
    /// or the user is unknown.
    async fn display_name(&self, user: &UserId) -> Option<String>;

    /// Whether an accepted friendship exists between the two users.
    async fn are_friends(&self, a: &UserId, b: &UserId) -> bool;
}

/// Directory that admits everyone; stands in until the account service
/// is wired up.
#[derive(Debug, Default)]
pub struct PermissiveDirectory;

#[async_trait]
impl Directory for PermissiveDirectory {
    async fn user_exists(&self, _user: &UserId) -> bool {
        true
    }

    async fn display_name(&self, user: &UserId) -> Option<String> {
        Some(user.as_str().to_string())
    }

    async fn are_friends(&self, _a: &UserId, _b: &UserId) -> bool {
        true
    }
}
