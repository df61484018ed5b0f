//! User accounts and e-mail verification records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role granted to a user account.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Regular account holder; may only act on their own account.
    #[default]
    Depositor,
    /// Staff account; may act on any account.
    Banker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Depositor => "depositor",
            Role::Banker => "banker",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "depositor" => Some(Role::Depositor),
            "banker" => Some(Role::Banker),
            _ => None,
        }
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered user. The username is the primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
    pub role: Role,
    pub is_email_verified: bool,
    pub password_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A one-time secret code mailed to a user to prove ownership of an address.
///
/// Once `is_used` is set the record never changes again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub secret_code: String,
    pub is_used: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl VerificationRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether `code` may still be redeemed against this record at `now`.
    pub fn can_redeem(&self, code: &str, now: DateTime<Utc>) -> bool {
        !self.is_used && !self.is_expired(now) && self.secret_code == code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(now: DateTime<Utc>) -> VerificationRecord {
        VerificationRecord {
            id: 1,
            username: "alice".into(),
            email: "alice@example.com".into(),
            secret_code: "s3cret".into(),
            is_used: false,
            created_at: now,
            expires_at: now + Duration::minutes(15),
        }
    }

    #[test]
    fn redeem_requires_matching_unused_unexpired_code() {
        let now = Utc::now();
        let rec = record(now);

        assert!(rec.can_redeem("s3cret", now));
        assert!(!rec.can_redeem("wrong", now));
        assert!(!rec.can_redeem("s3cret", now + Duration::minutes(15)));

        let used = VerificationRecord { is_used: true, ..rec };
        assert!(!used.can_redeem("s3cret", now));
    }

    #[test]
    fn role_round_trips_through_str() {
        for role in [Role::Depositor, Role::Banker] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("admin"), None);
    }
}
