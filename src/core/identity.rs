//! Who is connecting: the key for per-identity counters and buckets

use std::fmt;

use crate::error::{Result, RustyGateError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    user_id: Option<i64>,
    ip_address: String,
}

impl Identity {
    /// Build an identity; at least one of the two fields must be present
    pub fn new(user_id: Option<i64>, ip_address: impl Into<String>) -> Result<Self> {
        let ip_address = ip_address.into().trim().to_string();
        if user_id.is_none() && ip_address.is_empty() {
            return Err(RustyGateError::InvalidIdentity(
                "identity needs a user id or an IP address".to_string(),
            ));
        }
        Ok(Self {
            user_id,
            ip_address,
        })
    }

    pub fn user(user_id: i64, ip_address: impl Into<String>) -> Result<Self> {
        Self::new(Some(user_id), ip_address)
    }

    pub fn anonymous(ip_address: impl Into<String>) -> Result<Self> {
        Self::new(None, ip_address)
    }

    pub fn user_id(&self) -> Option<i64> {
        self.user_id
    }

    pub fn ip_address(&self) -> &str {
        &self.ip_address
    }

    /// `user:{id}`, if the identity carries a user id
    pub fn user_key(&self) -> Option<String> {
        self.user_id.map(|id| format!("user:{}", id))
    }

    /// `ip:{address}`, if the identity carries an address
    pub fn ip_key(&self) -> Option<String> {
        if self.ip_address.is_empty() {
            None
        } else {
            Some(format!("ip:{}", self.ip_address))
        }
    }

    /// Key for message-rate state: the user when known, otherwise the address
    pub fn bucket_key(&self) -> String {
        self.user_key()
            .or_else(|| self.ip_key())
            .unwrap_or_default()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.user_id {
            Some(id) if self.ip_address.is_empty() => write!(f, "user {}", id),
            Some(id) => write!(f, "user {} ({})", id, self.ip_address),
            None => write!(f, "anonymous ({})", self.ip_address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_requires_a_field() {
        assert!(Identity::new(None, "").is_err());
        assert!(Identity::new(None, "   ").is_err());
        assert!(Identity::new(Some(1), "").is_ok());
        assert!(Identity::new(None, "10.0.0.1").is_ok());
    }

    #[test]
    fn test_keys() {
        let user = Identity::user(42, "10.0.0.1").unwrap();
        assert_eq!(user.user_key().as_deref(), Some("user:42"));
        assert_eq!(user.ip_key().as_deref(), Some("ip:10.0.0.1"));
        assert_eq!(user.bucket_key(), "user:42");

        let anon = Identity::anonymous("10.0.0.2").unwrap();
        assert_eq!(anon.user_key(), None);
        assert_eq!(anon.bucket_key(), "ip:10.0.0.2");

        let no_ip = Identity::new(Some(7), "").unwrap();
        assert_eq!(no_ip.ip_key(), None);
    }
}
