//! Authenticated session of the current user.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bidroom_shared::{BackendError, PresenceMember};
use serde::{Deserialize, Serialize};

/// Who the client is acting as.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthSession {
    pub user_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user_metadata: Option<UserMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct UserMetadata {
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

impl AuthSession {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            access_token: None,
        }
    }

    /// Build a session from a backend-issued JWT.
    ///
    /// Only the claims are read; the signature is the backend's concern.
    pub fn from_access_token(token: &str) -> Result<Self, BackendError> {
        let payload = token
            .split('.')
            .nth(1)
            .ok_or_else(|| BackendError::Deserialize("access token is not a JWT".to_string()))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| BackendError::Deserialize(format!("invalid token payload: {e}")))?;
        let claims: Claims = serde_json::from_slice(&bytes)?;

        let metadata = claims.user_metadata.unwrap_or_default();
        let display_name = metadata
            .full_name
            .or(metadata.name)
            .filter(|n| !n.trim().is_empty())
            .or_else(|| {
                claims
                    .email
                    .as_deref()
                    .and_then(|e| e.split('@').next())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| claims.sub.clone());

        Ok(Self {
            user_id: claims.sub,
            display_name,
            access_token: Some(token.to_string()),
        })
    }

    pub fn member(&self) -> PresenceMember {
        PresenceMember {
            user_id: self.user_id.clone(),
            name: self.display_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{header}.{body}.signature")
    }

    #[test]
    fn reads_name_from_metadata() {
        let jwt = token(serde_json::json!({
            "sub": "user-1",
            "email": "ada@example.com",
            "user_metadata": { "full_name": "Ada Lovelace" }
        }));
        let session = AuthSession::from_access_token(&jwt).unwrap();
        assert_eq!(session.user_id, "user-1");
        assert_eq!(session.display_name, "Ada Lovelace");
        assert_eq!(session.access_token.as_deref(), Some(jwt.as_str()));
    }

    #[test]
    fn falls_back_to_email_local_part() {
        let jwt = token(serde_json::json!({ "sub": "user-2", "email": "grace@example.com" }));
        assert_eq!(AuthSession::from_access_token(&jwt).unwrap().display_name, "grace");
    }

    #[test]
    fn rejects_garbage() {
        assert!(AuthSession::from_access_token("not-a-token").is_err());
    }
}
