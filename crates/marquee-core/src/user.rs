//! User identities and permission levels.
//!
//! Users are identified by their reward address. Native addresses carry the
//! `ban_` prefix; `nano_` addresses are valid but belong to the alien chain
//! and are rewarded in points instead of on-chain payouts. Applications act
//! as users with an application id and no meaningful address of their own.

use serde::{Deserialize, Serialize};

use crate::error::Error;

const NATIVE_PREFIX: &str = "ban_";
const ALIEN_PREFIX: &str = "nano_";
const ADDRESS_ALPHABET: &str = "13456789abcdefghijkmnopqrstuwxyz";

/// Permission level of a user, ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    #[default]
    Unauthenticated,
    User,
    Moderator,
    Admin,
}

impl PermissionLevel {
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "unauthenticated" => Ok(Self::Unauthenticated),
            "user" => Ok(Self::User),
            "moderator" => Ok(Self::Moderator),
            "admin" => Ok(Self::Admin),
            other => Err(Error::Config(format!("unknown permission level {other}"))),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::User => "user",
            Self::Moderator => "moderator",
            Self::Admin => "admin",
        }
    }
}

/// A user of the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    application_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nickname: Option<String>,
    #[serde(default)]
    permission_level: PermissionLevel,
}

impl User {
    /// A user known only by reward address.
    pub fn address_only(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            application_id: None,
            nickname: None,
            permission_level: PermissionLevel::Unauthenticated,
        }
    }

    pub fn with_permission_level(
        address: impl Into<String>,
        permission_level: PermissionLevel,
    ) -> Self {
        Self {
            address: address.into(),
            application_id: None,
            nickname: None,
            permission_level,
        }
    }

    /// The synthetic user an application acts as.
    pub fn application(application_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            application_id: Some(application_id.into()),
            nickname: None,
            permission_level: PermissionLevel::User,
        }
    }

    pub fn unknown() -> Self {
        Self::address_only("")
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn application_id(&self) -> Option<&str> {
        self.application_id.as_deref()
    }

    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }

    pub fn set_nickname(&mut self, nickname: Option<String>) {
        self.nickname = nickname;
    }

    pub const fn permission_level(&self) -> PermissionLevel {
        self.permission_level
    }

    pub fn is_unknown(&self) -> bool {
        self.address.is_empty() && self.application_id.is_none()
    }

    pub fn is_from_alien_chain(&self) -> bool {
        self.address.starts_with(ALIEN_PREFIX)
    }

    pub fn permission_level_is_at_least(&self, level: PermissionLevel) -> bool {
        self.permission_level >= level
    }
}

/// Checks that an address is a well-formed native reward address.
pub fn is_valid_reward_address(address: &str) -> bool {
    is_well_formed(address, NATIVE_PREFIX)
}

/// Checks that an address is well-formed on either supported chain.
pub fn is_valid_any_chain_address(address: &str) -> bool {
    is_well_formed(address, NATIVE_PREFIX) || is_well_formed(address, ALIEN_PREFIX)
}

fn is_well_formed(address: &str, prefix: &str) -> bool {
    let Some(body) = address.strip_prefix(prefix) else {
        return false;
    };
    body.len() == 60 && body.chars().all(|c| ADDRESS_ALPHABET.contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native(fill: char) -> String {
        format!("ban_{}", fill.to_string().repeat(60))
    }

    #[test]
    fn validates_native_addresses() {
        assert!(is_valid_reward_address(&native('1')));
        assert!(!is_valid_reward_address("ban_short"));
        assert!(!is_valid_reward_address(&format!(
            "nano_{}",
            "1".repeat(60)
        )));
        // '0' and 'l' are not in the address alphabet
        assert!(!is_valid_reward_address(&native('0')));
        assert!(!is_valid_reward_address(&native('l')));
    }

    #[test]
    fn alien_chain_detection() {
        let user = User::address_only(format!("nano_{}", "1".repeat(60)));
        assert!(user.is_from_alien_chain());
        assert!(!User::address_only(native('1')).is_from_alien_chain());
    }

    #[test]
    fn permission_levels_are_ordered() {
        assert!(PermissionLevel::Admin > PermissionLevel::Moderator);
        assert!(PermissionLevel::Moderator > PermissionLevel::User);
        assert!(
            User::with_permission_level(native('3'), PermissionLevel::Moderator)
                .permission_level_is_at_least(PermissionLevel::User)
        );
    }

    #[test]
    fn parse_round_trips() {
        for level in [
            PermissionLevel::Unauthenticated,
            PermissionLevel::User,
            PermissionLevel::Moderator,
            PermissionLevel::Admin,
        ] {
            assert_eq!(PermissionLevel::parse(level.as_str()).unwrap(), level);
        }
    }
}
