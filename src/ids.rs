// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Opaque identifier newtypes enforcing the wire shapes from the data model:
//! `deviceId` (bare UUIDv4), `user_<uuid>`, `a_<uuid>`, `s_<uuid>`, `c_<client-chosen>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! prefixed_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh random id.
            pub fn generate() -> Self {
                Self(format!("{}{}", $prefix, Uuid::new_v4()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let rest = s.strip_prefix($prefix).ok_or(IdError::BadShape)?;
                Uuid::parse_str(rest).map_err(|_| IdError::BadShape)?;
                Ok(Self(s.to_owned()))
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }
    };
}

prefixed_id!(UserId, "user_");
prefixed_id!(AssetId, "a_");
prefixed_id!(EventId, "s_");

/// A bare UUIDv4 device identifier (no prefix, per the data model).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map_err(|_| IdError::BadShape)?;
        Ok(Self(s.to_owned()))
    }
}

impl TryFrom<String> for DeviceId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> String {
        id.0
    }
}

/// A client-chosen message id, `c_<anything>` (uniqueness is the client's problem).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId(String);

impl ClientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ClientId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("c_") && s.len() > 2 {
            Ok(Self(s.to_owned()))
        } else {
            Err(IdError::BadShape)
        }
    }
}

impl TryFrom<String> for ClientId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ClientId> for String {
    fn from(id: ClientId) -> String {
        id.0
    }
}

/// An opaque in-memory session identifier (not persisted).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("identifier does not match the expected shape")]
    BadShape,
}

#[cfg(test)]
mod ids_tests {
    use super::*;

    #[test]
    fn user_id_requires_prefix_and_uuid() {
        let good = format!("user_{}", Uuid::new_v4());
        assert!(good.parse::<UserId>().is_ok());
        assert!("user_not-a-uuid".parse::<UserId>().is_err());
        assert!(Uuid::new_v4().to_string().parse::<UserId>().is_err());
    }

    #[test]
    fn device_id_rejects_prefixed_strings() {
        assert!(Uuid::new_v4().to_string().parse::<DeviceId>().is_ok());
        assert!(format!("user_{}", Uuid::new_v4()).parse::<DeviceId>().is_err());
    }

    #[test]
    fn client_id_requires_c_prefix() {
        assert!("c_1".parse::<ClientId>().is_ok());
        assert!("c_".parse::<ClientId>().is_err());
        assert!("x_1".parse::<ClientId>().is_err());
    }
}
