//! In-memory user directory and the credential gate the server loop logs
//! connections in through.
//!
//! Provides:
//! - A single administrator, provisioned once at startup
//! - Teacher and student registration with input validation
//! - Plaintext email + password verification

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Opaque identifier assigned to every account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserId(u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an account is allowed to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Student,
}

/// The authenticated principal attached to an active connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: UserId,
    pub email: String,
    pub role: Role,
}

/// Verifies login credentials.
///
/// Implementations are called from the server loop thread and must return
/// quickly; a slow gate stalls every connection.
pub trait CredentialGate {
    /// Returns the identity for a matching email and password, or `None`
    /// for unknown email, wrong password, or malformed input.
    fn verify(&self, email: &str, password: &str) -> Option<Identity>;
}

impl<G: CredentialGate + ?Sized> CredentialGate for &G {
    fn verify(&self, email: &str, password: &str) -> Option<Identity> {
        (**self).verify(email, password)
    }
}

impl<G: CredentialGate + ?Sized> CredentialGate for Arc<G> {
    fn verify(&self, email: &str, password: &str) -> Option<Identity> {
        (**self).verify(email, password)
    }
}

impl<G: CredentialGate + ?Sized> CredentialGate for Box<G> {
    fn verify(&self, email: &str, password: &str) -> Option<Identity> {
        (**self).verify(email, password)
    }
}

/// Account details for a new teacher or student.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
    pub role: Role,
}

/// Directory errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("{0} cannot be empty")]
    MissingField(&'static str),
    #[error("email already used: {0}")]
    EmailTaken(String),
    #[error("an administrator is already provisioned")]
    AdminExists,
    #[error("administrators cannot be registered")]
    AdminRegistration,
}

/// A stored account
#[derive(Debug, Clone)]
struct UserRecord {
    identity: Identity,
    first_name: String,
    last_name: String,
    password: String,
}

/// In-memory account store keyed by email.
#[derive(Debug, Default)]
pub struct UserDirectory {
    users: HashMap<String, UserRecord>,
    admin: Option<UserId>,
    next_id: u64,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_user_id(&mut self) -> UserId {
        let id = UserId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Provision the administrator account. Only one may exist.
    pub fn provision_admin(&mut self, email: &str, password: &str) -> Result<Identity, DirectoryError> {
        if self.admin.is_some() {
            return Err(DirectoryError::AdminExists);
        }

        let identity = self.insert(NewUser {
            first_name: "admin".to_string(),
            last_name: "admin".to_string(),
            email: email.to_string(),
            password: password.to_string(),
            role: Role::Admin,
        })?;
        self.admin = Some(identity.id);

        info!(id = %identity.id, email = %identity.email, "Administrator provisioned");
        Ok(identity)
    }

    /// Register a teacher or student.
    pub fn register(&mut self, user: NewUser) -> Result<Identity, DirectoryError> {
        if user.role == Role::Admin {
            return Err(DirectoryError::AdminRegistration);
        }

        let identity = self.insert(user)?;
        info!(id = %identity.id, email = %identity.email, role = ?identity.role, "User registered");
        Ok(identity)
    }

    fn insert(&mut self, user: NewUser) -> Result<Identity, DirectoryError> {
        for (value, field) in [
            (&user.first_name, "first name"),
            (&user.last_name, "last name"),
            (&user.email, "email"),
            (&user.password, "password"),
        ] {
            if value.trim().is_empty() {
                return Err(DirectoryError::MissingField(field));
            }
        }

        if self.users.contains_key(&user.email) {
            return Err(DirectoryError::EmailTaken(user.email));
        }

        let identity = Identity {
            id: self.next_user_id(),
            email: user.email.clone(),
            role: user.role,
        };

        self.users.insert(
            user.email,
            UserRecord {
                identity: identity.clone(),
                first_name: user.first_name,
                last_name: user.last_name,
                password: user.password,
            },
        );

        Ok(identity)
    }

    /// Look up an account by email.
    pub fn lookup(&self, email: &str) -> Option<Identity> {
        self.users.get(email).map(|record| record.identity.clone())
    }

    /// First and last name of an account, joined by a space.
    pub fn full_name(&self, email: &str) -> Option<String> {
        self.users
            .get(email)
            .map(|record| format!("{} {}", record.first_name, record.last_name))
    }

    /// Number of stored accounts, administrator included.
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl CredentialGate for UserDirectory {
    fn verify(&self, email: &str, password: &str) -> Option<Identity> {
        if email.trim().is_empty() || password.is_empty() {
            return None;
        }

        match self.users.get(email) {
            Some(record) if record.password == password => Some(record.identity.clone()),
            Some(_) => {
                debug!(email, "Password mismatch");
                None
            }
            None => {
                debug!(email, "Unknown email");
                None
            }
        }
    }
}
