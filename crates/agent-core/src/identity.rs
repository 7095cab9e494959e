//! Identity Context
//!
//! Validated caller identity handed to the core by the transport layer and
//! stamped onto every execution node.

use serde::{Deserialize, Serialize};

/// Opaque platform credential. Never printed, never serialized out.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Raw secret, for building outbound auth headers
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Who a node executes as
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityContext {
    pub user_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_user_id: Option<String>,

    #[serde(default, skip_serializing)]
    pub platform_credential: Option<Credential>,
}

impl IdentityContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_platform_user(mut self, platform_user_id: impl Into<String>) -> Self {
        self.platform_user_id = Some(platform_user_id.into());
        self
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.platform_credential = Some(Credential::new(credential));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_is_redacted() {
        let identity = IdentityContext::new("u1").with_credential("s3cret");
        let debug = format!("{identity:?}");
        assert!(!debug.contains("s3cret"));

        let json = serde_json::to_string(&identity).unwrap();
        assert!(!json.contains("s3cret"));
        assert!(json.contains("u1"));
    }
}
