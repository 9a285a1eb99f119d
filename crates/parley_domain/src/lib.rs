#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Numeric account identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl UserId {
	/// Sentinel id meaning "everyone" in a mention list.
	pub const AT_ALL: UserId = UserId(-1);

	pub const fn as_i64(self) -> i64 {
		self.0
	}

	/// Whether this id is the "mention everyone" sentinel.
	pub const fn is_everyone(self) -> bool {
		self.0 == Self::AT_ALL.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		s.parse::<i64>()
			.map(UserId)
			.map_err(|_| ParseIdError::InvalidFormat(format!("expected integer user id, got {s:?}")))
	}
}

/// Opaque group identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
	/// Create a non-empty `GroupId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for GroupId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for GroupId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		GroupId::new(s.to_string())
	}
}

/// Message identifier, client-supplied or generated server-side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgId(String);

impl MsgId {
	/// Create a non-empty `MsgId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	/// Generate a fresh random message id.
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for MsgId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for MsgId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		MsgId::new(s.to_string())
	}
}

/// Group membership role, as reported by the group service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	Owner,
	Admin,
	Member,
}

impl Role {
	/// Decode the integer role code used on service wire formats.
	pub const fn from_code(code: i32) -> Option<Self> {
		match code {
			1 => Some(Role::Owner),
			2 => Some(Role::Admin),
			3 => Some(Role::Member),
			_ => None,
		}
	}

	pub const fn as_code(self) -> i32 {
		match self {
			Role::Owner => 1,
			Role::Admin => 2,
			Role::Member => 3,
		}
	}

	/// Only owners and admins may mention everyone.
	pub const fn can_at_all(self) -> bool {
		matches!(self, Role::Owner | Role::Admin)
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Role::Owner => "owner",
			Role::Admin => "admin",
			Role::Member => "member",
		};
		f.write_str(s)
	}
}

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn user_id_parse_and_display() {
		assert_eq!("42".parse::<UserId>().unwrap(), UserId(42));
		assert_eq!(" -1 ".parse::<UserId>().unwrap(), UserId::AT_ALL);
		assert_eq!(UserId(7).to_string(), "7");
		assert!("abc".parse::<UserId>().is_err());
		assert!("".parse::<UserId>().is_err());
	}

	#[test]
	fn at_all_sentinel() {
		assert!(UserId(-1).is_everyone());
		assert!(!UserId(1).is_everyone());
	}

	#[test]
	fn role_codes_roundtrip() {
		assert_eq!(Role::from_code(1), Some(Role::Owner));
		assert_eq!(Role::from_code(2), Some(Role::Admin));
		assert_eq!(Role::from_code(3), Some(Role::Member));
		assert_eq!(Role::from_code(0), None);
		assert_eq!(Role::Admin.as_code(), 2);
	}

	#[test]
	fn only_owner_and_admin_can_at_all() {
		assert!(Role::Owner.can_at_all());
		assert!(Role::Admin.can_at_all());
		assert!(!Role::Member.can_at_all());
	}

	#[test]
	fn rejects_empty_ids() {
		assert!(GroupId::new("").is_err());
		assert!(MsgId::new("   ").is_err());
	}

	#[test]
	fn msg_id_generate_is_unique() {
		assert_ne!(MsgId::generate(), MsgId::generate());
	}

	#[test]
	fn secret_string_redacts() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
		assert_eq!(s.to_string(), "<redacted>");
		assert_eq!(s.expose(), "hunter2");
	}
}
