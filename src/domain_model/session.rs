use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(pub String);

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefreshToken(pub String);

impl AccessToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl RefreshToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// tokens never reach the logs
impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken(***{})", tail(&self.0))
    }
}

impl fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RefreshToken(***{})", tail(&self.0))
    }
}

fn tail(token: &str) -> &str {
    let start = token
        .char_indices()
        .rev()
        .nth(3)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &token[start..]
}

/// Which portal the signed-in principal belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortalKind {
    #[default]
    Admin,
    Merchant,
    Cashier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub portal: PortalKind,
}

/// The credential record of the signed-in principal.
///
/// Created on login, replaced on refresh, cleared on logout or when a refresh
/// fails. The principal survives token rotation unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: AccessToken,
    pub refresh_token: RefreshToken,
    pub principal: Principal,
    pub issued_at: DateTime<Utc>,
}

impl Session {
    pub fn new(access_token: AccessToken, refresh_token: RefreshToken, principal: Principal) -> Self {
        Self {
            access_token,
            refresh_token,
            principal,
            issued_at: Utc::now(),
        }
    }

    pub fn rotated(&self, access_token: AccessToken, refresh_token: RefreshToken) -> Self {
        Self {
            access_token,
            refresh_token,
            principal: self.principal.clone(),
            issued_at: Utc::now(),
        }
    }
}

/// Body of `POST /auth/refresh`.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// `data` of a successful refresh response.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshGrant {
    pub token: String,
    pub refresh_token: String,
}
