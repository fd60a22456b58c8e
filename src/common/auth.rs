//! Users, roles and key-space authorization
//!
//! Roles grant read and write access to key patterns. A pattern ending in
//! `*` matches every key with that prefix; any other pattern matches exactly
//! one key. The `root` role is built in and grants everything. When auth is
//! enabled, requests without credentials are evaluated as the `guest` role.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::http::StatusCode;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

pub const ROOT_ROLE: &str = "root";
pub const ROOT_USER: &str = "root";
pub const GUEST_ROLE: &str = "guest";

/// Authentication errors
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("auth: {0}")]
    NotFound(String),
    #[error("auth: {0}")]
    Conflict(String),
    #[error("auth: {0}")]
    Invalid(String),
    #[error("auth: {0}")]
    Forbidden(String),
    #[error("auth: insufficient credentials")]
    Unauthorized,
    #[error("auth: hash error: {0}")]
    HashError(String),
}

impl AuthError {
    pub fn http_status(&self) -> StatusCode {
        match self {
            AuthError::NotFound(_) => StatusCode::NOT_FOUND,
            AuthError::Conflict(_) => StatusCode::CONFLICT,
            AuthError::Invalid(_) => StatusCode::BAD_REQUEST,
            AuthError::Forbidden(_) => StatusCode::FORBIDDEN,
            AuthError::Unauthorized => StatusCode::UNAUTHORIZED,
            AuthError::HashError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type AuthResult<T> = std::result::Result<T, AuthError>;

/// Basic credentials presented with a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

fn pattern_match(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

fn prefix_match(pattern: &str, key: &str) -> bool {
    pattern
        .strip_suffix('*')
        .map_or(false, |prefix| key.starts_with(prefix))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RwPermission {
    #[serde(default)]
    pub read: Vec<String>,
    #[serde(default)]
    pub write: Vec<String>,
}

impl RwPermission {
    fn list(&self, write: bool) -> &[String] {
        if write {
            &self.write
        } else {
            &self.read
        }
    }

    pub fn has_access(&self, key: &str, write: bool) -> bool {
        self.list(write).iter().any(|p| pattern_match(p, key))
    }

    pub fn has_recursive_access(&self, key: &str, write: bool) -> bool {
        self.list(write).iter().any(|p| prefix_match(p, key))
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty()
    }

    fn grant(&mut self, other: &RwPermission) {
        for p in &other.read {
            if !self.read.contains(p) {
                self.read.push(p.clone());
            }
        }
        for p in &other.write {
            if !self.write.contains(p) {
                self.write.push(p.clone());
            }
        }
    }

    fn revoke(&mut self, other: &RwPermission) -> AuthResult<()> {
        for (held, gone) in [(&mut self.read, &other.read), (&mut self.write, &other.write)] {
            for p in gone {
                let before = held.len();
                held.retain(|h| h != p);
                if held.len() == before {
                    return Err(AuthError::Invalid(format!("permission {} is not granted", p)));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub kv: RwPermission,
}

impl Permissions {
    pub fn is_empty(&self) -> bool {
        self.kv.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub role: String,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant: Option<Permissions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke: Option<Permissions>,
}

impl Role {
    fn root() -> Self {
        Self {
            role: ROOT_ROLE.to_string(),
            permissions: Permissions {
                kv: RwPermission {
                    read: vec!["/*".into()],
                    write: vec!["/*".into()],
                },
            },
            ..Default::default()
        }
    }

    pub fn has_key_access(&self, key: &str, write: bool) -> bool {
        self.role == ROOT_ROLE || self.permissions.kv.has_access(key, write)
    }

    pub fn has_recursive_access(&self, key: &str, write: bool) -> bool {
        self.role == ROOT_ROLE || self.permissions.kv.has_recursive_access(key, write)
    }
}

/// User record on the wire. The password is accepted but never serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grant: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revoke: Vec<String>,
}

struct StoredUser {
    password_hash: String,
    roles: Vec<String>,
}

impl StoredUser {
    fn to_user(&self, name: &str) -> User {
        User {
            user: name.to_string(),
            roles: self.roles.clone(),
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct AuthInner {
    enabled: bool,
    users: BTreeMap<String, StoredUser>,
    roles: BTreeMap<String, Role>,
}

/// In-memory user and role store
pub struct AuthStore {
    inner: RwLock<AuthInner>,
    argon2: Argon2<'static>,
}

impl Default for AuthStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(AuthInner::default()),
            argon2: Argon2::default(),
        }
    }

    fn hash_password(&self, password: &str) -> AuthResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| AuthError::HashError(e.to_string()))
    }

    fn verify_password(&self, hash: &str, password: &str) -> bool {
        PasswordHash::new(hash)
            .map(|parsed| {
                self.argon2
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok()
            })
            .unwrap_or(false)
    }

    pub fn auth_enabled(&self) -> bool {
        self.inner.read().enabled
    }

    /// Enable auth. A `root` user must exist; a permissive `guest` role is
    /// created unless one is already defined.
    pub fn enable_auth(&self) -> AuthResult<()> {
        let mut inner = self.inner.write();
        if inner.enabled {
            return Err(AuthError::Conflict("already enabled".into()));
        }
        if !inner.users.contains_key(ROOT_USER) {
            return Err(AuthError::Conflict(
                "no root user available, please create one".into(),
            ));
        }
        inner
            .roles
            .entry(GUEST_ROLE.to_string())
            .or_insert_with(|| Role {
                role: GUEST_ROLE.to_string(),
                permissions: Permissions {
                    kv: RwPermission {
                        read: vec!["*".into()],
                        write: vec!["*".into()],
                    },
                },
                ..Default::default()
            });
        inner.enabled = true;
        info!("Auth enabled");
        Ok(())
    }

    pub fn disable_auth(&self) -> AuthResult<()> {
        let mut inner = self.inner.write();
        if !inner.enabled {
            return Err(AuthError::Conflict("already disabled".into()));
        }
        inner.enabled = false;
        info!("Auth disabled");
        Ok(())
    }

    pub fn all_users(&self) -> Vec<String> {
        self.inner.read().users.keys().cloned().collect()
    }

    /// Every role name, including the built-in `root`.
    pub fn all_roles(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut roles: Vec<String> = inner.roles.keys().cloned().collect();
        roles.push(ROOT_ROLE.to_string());
        roles.sort();
        roles
    }

    pub fn get_user(&self, name: &str) -> AuthResult<User> {
        self.inner
            .read()
            .users
            .get(name)
            .map(|u| u.to_user(name))
            .ok_or_else(|| AuthError::NotFound(format!("user {} does not exist", name)))
    }

    fn check_roles_exist(inner: &AuthInner, roles: &[String]) -> AuthResult<()> {
        for r in roles {
            if r != ROOT_ROLE && !inner.roles.contains_key(r) {
                return Err(AuthError::NotFound(format!("role {} does not exist", r)));
            }
        }
        Ok(())
    }

    pub fn create_user(&self, user: User) -> AuthResult<User> {
        if user.password.is_empty() {
            return Err(AuthError::Invalid(format!(
                "cannot create user {} with an empty password",
                user.user
            )));
        }
        let hash = self.hash_password(&user.password)?;
        let mut inner = self.inner.write();
        if inner.users.contains_key(&user.user) {
            return Err(AuthError::Conflict(format!("user {} already exists", user.user)));
        }
        Self::check_roles_exist(&inner, &user.roles)?;
        let stored = StoredUser {
            password_hash: hash,
            roles: user.roles,
        };
        let out = stored.to_user(&user.user);
        inner.users.insert(user.user.clone(), stored);
        info!(user = %user.user, "Created user");
        Ok(out)
    }

    /// Create the user, or change its password if it exists. Returns whether
    /// the user was created.
    pub fn create_or_update_user(&self, user: User) -> AuthResult<(User, bool)> {
        if self.inner.read().users.contains_key(&user.user) {
            return self.update_user(user).map(|u| (u, false));
        }
        self.create_user(user).map(|u| (u, true))
    }

    /// Apply a password change and role grants/revocations.
    pub fn update_user(&self, user: User) -> AuthResult<User> {
        let hash = if user.password.is_empty() {
            None
        } else {
            Some(self.hash_password(&user.password)?)
        };
        let mut inner = self.inner.write();
        Self::check_roles_exist(&inner, &user.grant)?;
        let stored = inner
            .users
            .get_mut(&user.user)
            .ok_or_else(|| AuthError::NotFound(format!("user {} does not exist", user.user)))?;

        let mut roles = stored.roles.clone();
        for r in &user.grant {
            if roles.contains(r) {
                return Err(AuthError::Conflict(format!(
                    "user {} already has role {}",
                    user.user, r
                )));
            }
            roles.push(r.clone());
        }
        for r in &user.revoke {
            let before = roles.len();
            roles.retain(|held| held != r);
            if roles.len() == before {
                return Err(AuthError::Invalid(format!(
                    "user {} does not have role {}",
                    user.user, r
                )));
            }
        }
        stored.roles = roles;
        if let Some(h) = hash {
            stored.password_hash = h;
        }
        Ok(stored.to_user(&user.user))
    }

    pub fn delete_user(&self, name: &str) -> AuthResult<()> {
        let mut inner = self.inner.write();
        if inner.enabled && name == ROOT_USER {
            return Err(AuthError::Forbidden(
                "cannot delete root user while auth is enabled".into(),
            ));
        }
        inner
            .users
            .remove(name)
            .map(|_| info!(user = name, "Deleted user"))
            .ok_or_else(|| AuthError::NotFound(format!("user {} does not exist", name)))
    }

    pub fn get_role(&self, name: &str) -> AuthResult<Role> {
        if name == ROOT_ROLE {
            return Ok(Role::root());
        }
        self.inner
            .read()
            .roles
            .get(name)
            .cloned()
            .ok_or_else(|| AuthError::NotFound(format!("role {} does not exist", name)))
    }

    pub fn create_role(&self, role: Role) -> AuthResult<Role> {
        if role.role == ROOT_ROLE {
            return Err(AuthError::Forbidden("cannot modify role root".into()));
        }
        let mut inner = self.inner.write();
        if inner.roles.contains_key(&role.role) {
            return Err(AuthError::Conflict(format!("role {} already exists", role.role)));
        }
        let stored = Role {
            role: role.role.clone(),
            permissions: role.permissions,
            grant: None,
            revoke: None,
        };
        inner.roles.insert(role.role.clone(), stored.clone());
        info!(role = %role.role, "Created role");
        Ok(stored)
    }

    /// Merge `grant` into and subtract `revoke` from the role's permissions.
    pub fn update_role(&self, role: Role) -> AuthResult<Role> {
        if role.role == ROOT_ROLE {
            return Err(AuthError::Forbidden("cannot modify role root".into()));
        }
        let mut inner = self.inner.write();
        let stored = inner
            .roles
            .get_mut(&role.role)
            .ok_or_else(|| AuthError::NotFound(format!("role {} does not exist", role.role)))?;
        let mut perms = stored.permissions.kv.clone();
        if let Some(grant) = &role.grant {
            perms.grant(&grant.kv);
        }
        if let Some(revoke) = &role.revoke {
            perms.revoke(&revoke.kv)?;
        }
        stored.permissions.kv = perms;
        Ok(stored.clone())
    }

    /// Delete a role and strip it from every user holding it.
    pub fn delete_role(&self, name: &str) -> AuthResult<()> {
        if name == ROOT_ROLE {
            return Err(AuthError::Forbidden("cannot delete role root".into()));
        }
        let mut inner = self.inner.write();
        if inner.roles.remove(name).is_none() {
            return Err(AuthError::NotFound(format!("role {} does not exist", name)));
        }
        for user in inner.users.values_mut() {
            user.roles.retain(|r| r != name);
        }
        info!(role = name, "Deleted role");
        Ok(())
    }

    /// Resolve credentials to the user's role names, or `None` if the user is
    /// unknown or the password is wrong.
    fn authenticate(&self, creds: &Credentials) -> Option<Vec<String>> {
        let (hash, roles) = {
            let inner = self.inner.read();
            let Some(user) = inner.users.get(&creds.username) else {
                warn!(user = %creds.username, "auth: no such user");
                return None;
            };
            (user.password_hash.clone(), user.roles.clone())
        };
        if !self.verify_password(&hash, &creds.password) {
            warn!(user = %creds.username, "auth: incorrect password");
            return None;
        }
        Some(roles)
    }

    /// Decide whether a key-space request may proceed.
    ///
    /// The first of the user's roles granting access allows the request.
    pub fn has_key_prefix_access(
        &self,
        creds: Option<&Credentials>,
        key: &str,
        recursive: bool,
        write: bool,
    ) -> bool {
        if !self.auth_enabled() {
            return true;
        }
        let Some(creds) = creds else {
            return self.has_guest_access(key, write);
        };
        let Some(roles) = self.authenticate(creds) else {
            return false;
        };
        let granted = roles.iter().any(|name| {
            self.get_role(name).map_or(false, |role| {
                if recursive {
                    role.has_recursive_access(key, write)
                } else {
                    role.has_key_access(key, write)
                }
            })
        });
        if !granted {
            warn!(user = %creds.username, key, "auth: invalid access");
        }
        granted
    }

    fn has_guest_access(&self, key: &str, write: bool) -> bool {
        let allowed = self
            .get_role(GUEST_ROLE)
            .map_or(false, |role| role.has_key_access(key, write));
        if !allowed {
            warn!(key, "auth: invalid access for unauthenticated user");
        }
        allowed
    }

    /// Whether the credentials belong to a user holding the `root` role.
    pub fn has_root_access(&self, creds: Option<&Credentials>) -> bool {
        if !self.auth_enabled() {
            return true;
        }
        let Some(creds) = creds else {
            return false;
        };
        let Some(roles) = self.authenticate(creds) else {
            return false;
        };
        let ok = roles.iter().any(|r| r == ROOT_ROLE);
        if !ok {
            warn!(user = %creds.username, "auth: user does not have the root role");
        }
        ok
    }

    /// Reads always pass; writes need root access.
    pub fn has_write_root_access(&self, is_read: bool, creds: Option<&Credentials>) -> bool {
        is_read || self.has_root_access(creds)
    }
}
