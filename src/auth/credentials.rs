use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use dashmap::DashMap;

#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub username: String,
    pub roles: Vec<String>,
    pub scopes: Vec<String>,
}

pub enum RegisterOutcome {
    Created(CredentialRecord),
    AlreadyExists,
}

/// In-process user registry, the default implementation of the "credential
/// verifier" external collaborator the auth module depends on. Swappable:
/// nothing outside this file assumes an in-memory backing.
pub struct CredentialStore {
    users: DashMap<String, StoredUser>,
}

struct StoredUser {
    password_hash: String,
    roles: Vec<String>,
    scopes: Vec<String>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
        }
    }

    pub fn register(&self, username: &str, password: &str) -> RegisterOutcome {
        if self.users.contains_key(username) {
            return RegisterOutcome::AlreadyExists;
        }
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .expect("argon2 hashing with a freshly generated salt cannot fail")
            .to_string();
        let record = CredentialRecord {
            username: username.to_string(),
            roles: vec!["user".to_string()],
            scopes: vec!["read".to_string()],
        };
        self.users.insert(
            username.to_string(),
            StoredUser {
                password_hash,
                roles: record.roles.clone(),
                scopes: record.scopes.clone(),
            },
        );
        RegisterOutcome::Created(record)
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Option<CredentialRecord> {
        let user = self.users.get(username)?;
        let parsed = PasswordHash::new(&user.password_hash).ok()?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .ok()?;
        Some(CredentialRecord {
            username: username.to_string(),
            roles: user.roles.clone(),
            scopes: user.scopes.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_authenticates_a_user() {
        let store = CredentialStore::new();
        assert!(matches!(
            store.register("alice", "hunter2"),
            RegisterOutcome::Created(_)
        ));
        let record = store.authenticate("alice", "hunter2").unwrap();
        assert_eq!(record.username, "alice");
    }

    #[test]
    fn rejects_wrong_password() {
        let store = CredentialStore::new();
        store.register("alice", "hunter2");
        assert!(store.authenticate("alice", "wrong").is_none());
    }

    #[test]
    fn rejects_duplicate_registration() {
        let store = CredentialStore::new();
        store.register("alice", "hunter2");
        assert!(matches!(
            store.register("alice", "another"),
            RegisterOutcome::AlreadyExists
        ));
    }
}
