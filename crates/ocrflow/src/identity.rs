//! Bearer-token identity.
//!
//! Tokens come from configuration and are held as [`SecretString`]s. A
//! token's source is one of: a direct value, a file (`~` expanded), or an
//! environment variable, tried in that order.

use std::fmt;
use std::fs;

use secrecy::{ExposeSecret, SecretString};

use crate::config::schema::expand_home;
use crate::config::ApiTokenConfig;

/// Identity of an authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing credentials")]
    MissingCredentials,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("No token source configured for user '{user_id}'")]
    NoSourceProvided { user_id: String },

    #[error("Failed to read token file '{path}': {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },
}

/// Validates a bearer credential.
pub trait IdentityProvider: Send + Sync {
    fn authenticate(&self, bearer: &str) -> Result<UserId, AuthError>;
}

/// Identity backed by a fixed list of API tokens.
pub struct StaticTokenIdentity {
    tokens: Vec<(SecretString, UserId)>,
}

impl StaticTokenIdentity {
    pub fn new(tokens: Vec<(SecretString, UserId)>) -> Self {
        Self { tokens }
    }

    /// Resolves every configured token. Any token that cannot be resolved
    /// fails the whole set.
    pub fn from_config(entries: &[ApiTokenConfig]) -> Result<Self, AuthError> {
        let mut tokens = Vec::with_capacity(entries.len());
        for entry in entries {
            let secret = resolve_token(entry)?;
            tokens.push((secret, UserId::new(entry.user_id.clone())));
        }
        Ok(Self { tokens })
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl IdentityProvider for StaticTokenIdentity {
    fn authenticate(&self, bearer: &str) -> Result<UserId, AuthError> {
        let bearer = bearer.trim();
        if bearer.is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        // Every token is compared so the match position does not leak.
        let mut found = None;
        for (secret, user) in &self.tokens {
            if constant_time_eq(secret.expose_secret().as_bytes(), bearer.as_bytes())
                && found.is_none()
            {
                found = Some(user.clone());
            }
        }
        found.ok_or(AuthError::InvalidCredentials)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn resolve_token(entry: &ApiTokenConfig) -> Result<SecretString, AuthError> {
    if let Some(value) = entry.token.as_deref().filter(|v| !v.is_empty()) {
        return Ok(SecretString::from(value.to_string()));
    }

    if let Some(path) = entry.token_file.as_deref().filter(|p| !p.is_empty()) {
        let expanded = expand_home(path);
        return match fs::read_to_string(&expanded) {
            Ok(content) => Ok(SecretString::from(content.trim().to_string())),
            Err(e) => Err(AuthError::FileReadError {
                path: expanded,
                source: e,
            }),
        };
    }

    if let Some(name) = entry.token_env.as_deref().filter(|n| !n.is_empty()) {
        return match std::env::var(name) {
            // env vars may carry a trailing newline
            Ok(value) => Ok(SecretString::from(value.trim().to_string())),
            Err(std::env::VarError::NotPresent) => Err(AuthError::EnvVarNotSet {
                name: name.to_string(),
            }),
            Err(std::env::VarError::NotUnicode(_)) => Err(AuthError::EnvVarNotUnicode {
                name: name.to_string(),
            }),
        };
    }

    Err(AuthError::NoSourceProvided {
        user_id: entry.user_id.clone(),
    })
}
