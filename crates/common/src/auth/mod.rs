//! Request-scoped identity and the authorization seam.
//!
//! Identity is never looked up ambiently: whoever handles a request builds a
//! [`RequestContext`] once, after authenticating, and passes it along to
//! everything that needs to know who is asking.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{TopLevelFilesystem, ADMIN_NAMESPACE};

/// Id of the built-in administrator
pub const ADMIN_USER_ID: &str = "00000000-0000-0000-0000-000000000000";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl User {
    pub fn admin() -> Self {
        Self {
            id: ADMIN_USER_ID.to_string(),
            name: ADMIN_NAMESPACE.to_string(),
            ..Default::default()
        }
    }
}

/// How the user behind a request proved who they are
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticationType {
    #[default]
    None,
    Password,
    #[serde(rename = "apikey")]
    ApiKey,
}

impl FromStr for AuthenticationType {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "none" => Ok(AuthenticationType::None),
            "password" => Ok(AuthenticationType::Password),
            "apikey" | "api-key" => Ok(AuthenticationType::ApiKey),
            other => Err(AuthError::Codec(format!(
                "unknown authentication type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for AuthenticationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthenticationType::None => "none",
            AuthenticationType::Password => "password",
            AuthenticationType::ApiKey => "apikey",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("HTTP Error: {status} body: {body:?}")]
    Http { status: u16, body: String },
    #[error("authorization service unreachable: {0}")]
    Transport(String),
    #[error("malformed authorization payload: {0}")]
    Codec(String),
    #[error("invalid credentials")]
    Unauthenticated,
    #[error("user {user} may not access {resource}")]
    Forbidden { user: String, resource: String },
}

/// Who is making a request, threaded explicitly through every call that
///  acts on their behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub user: User,
    pub authentication: AuthenticationType,
}

impl RequestContext {
    pub fn new(user: User, authentication: AuthenticationType) -> Self {
        Self {
            user,
            authentication,
        }
    }

    /// Context for work the node does on its own account, such as serving
    ///  the volume plugin
    pub fn admin() -> Self {
        Self::new(User::admin(), AuthenticationType::ApiKey)
    }

    pub fn user_id(&self) -> &str {
        &self.user.id
    }

    /// Fail with `Forbidden` unless the authorizer allows this user to act
    ///  on `filesystem`
    pub async fn require<A: Authorizer + ?Sized>(
        &self,
        authorizer: &A,
        owner_action: bool,
        filesystem: &TopLevelFilesystem,
    ) -> Result<(), AuthError> {
        if authorizer
            .authorize(&self.user, owner_action, filesystem)
            .await?
        {
            Ok(())
        } else {
            Err(AuthError::Forbidden {
                user: self.user.name.clone(),
                resource: filesystem.name.to_string(),
            })
        }
    }
}

/// Decides who a caller is and what they may do
#[async_trait]
pub trait Authorizer: Send + Sync + fmt::Debug + 'static {
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(User, AuthenticationType), AuthError>;

    /// May `user` act on `filesystem`? `owner_action` marks operations
    ///  reserved to the owner, as opposed to collaborators.
    async fn authorize(
        &self,
        user: &User,
        owner_action: bool,
        filesystem: &TopLevelFilesystem,
    ) -> Result<bool, AuthError>;

    async fn user_is_namespace_administrator(
        &self,
        user: &User,
        namespace: &str,
    ) -> Result<bool, AuthError>;
}

/// Single-tenant authorizer: any non-empty username is accepted and every
///  action is allowed.
#[derive(Debug, Clone, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authenticate(
        &self,
        username: &str,
        _password: &str,
    ) -> Result<(User, AuthenticationType), AuthError> {
        if username.is_empty() {
            return Err(AuthError::Unauthenticated);
        }
        if username == ADMIN_NAMESPACE {
            return Ok((User::admin(), AuthenticationType::Password));
        }
        let user = User {
            id: username.to_string(),
            name: username.to_string(),
            ..Default::default()
        };
        Ok((user, AuthenticationType::Password))
    }

    async fn authorize(
        &self,
        _user: &User,
        _owner_action: bool,
        _filesystem: &TopLevelFilesystem,
    ) -> Result<bool, AuthError> {
        Ok(true)
    }

    async fn user_is_namespace_administrator(
        &self,
        _user: &User,
        _namespace: &str,
    ) -> Result<bool, AuthError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FilesystemId, VolumeName};

    #[derive(Debug)]
    struct DenyAll;

    #[async_trait]
    impl Authorizer for DenyAll {
        async fn authenticate(
            &self,
            _username: &str,
            _password: &str,
        ) -> Result<(User, AuthenticationType), AuthError> {
            Err(AuthError::Unauthenticated)
        }

        async fn authorize(
            &self,
            _user: &User,
            _owner_action: bool,
            _filesystem: &TopLevelFilesystem,
        ) -> Result<bool, AuthError> {
            Ok(false)
        }

        async fn user_is_namespace_administrator(
            &self,
            _user: &User,
            _namespace: &str,
        ) -> Result<bool, AuthError> {
            Ok(false)
        }
    }

    fn tlf() -> TopLevelFilesystem {
        TopLevelFilesystem {
            filesystem_id: FilesystemId::from("fs"),
            name: VolumeName::new("alice", "data"),
            owner_id: "alice".to_string(),
        }
    }

    #[tokio::test]
    async fn test_require() {
        let ctx = RequestContext::admin();
        ctx.require(&AllowAll, true, &tlf()).await.unwrap();
        let denied = ctx.require(&DenyAll, true, &tlf()).await;
        assert!(matches!(denied, Err(AuthError::Forbidden { .. })));
    }

    #[tokio::test]
    async fn test_allow_all_authenticate() {
        let (user, kind) = AllowAll.authenticate("bob", "pw").await.unwrap();
        assert_eq!(user.name, "bob");
        assert_eq!(kind, AuthenticationType::Password);
        assert!(matches!(
            AllowAll.authenticate("", "pw").await,
            Err(AuthError::Unauthenticated)
        ));
    }

    #[test]
    fn test_authentication_type_parsing() {
        assert_eq!(
            "apikey".parse::<AuthenticationType>().unwrap(),
            AuthenticationType::ApiKey
        );
        assert_eq!(
            "password".parse::<AuthenticationType>().unwrap(),
            AuthenticationType::Password
        );
        assert!("token".parse::<AuthenticationType>().is_err());
    }

    #[test]
    fn test_user_wire_format() {
        let json = serde_json::to_value(User::admin()).unwrap();
        assert_eq!(json["Id"], ADMIN_USER_ID);
        assert_eq!(json["Name"], "admin");
        assert!(json.get("ApiKey").is_none());
    }
}
