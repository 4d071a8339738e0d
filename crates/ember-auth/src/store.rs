use std::sync::RwLock;

use anyhow::Result;

use ember_types::models::UserSnapshot;

/// Everything the client persists about the signed-in account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access: Option<String>,
    pub refresh: Option<String>,
    pub user: Option<UserSnapshot>,
}

impl Credentials {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: Some(access.into()),
            refresh: Some(refresh.into()),
            user: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.access.is_none() && self.refresh.is_none() && self.user.is_none()
    }
}

/// Storage collaborator for credentials. Every write replaces the affected
/// values atomically; readers never observe half of an update.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Result<Credentials>;

    /// Replace the whole record.
    fn replace(&self, credentials: Credentials) -> Result<()>;

    /// Replace the access credential, and the refresh credential when the
    /// server rotated it.
    fn set_access(&self, access: &str, refresh: Option<&str>) -> Result<()>;

    fn set_user(&self, user: &UserSnapshot) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

/// Process-local store, used by tests and short-lived sessions.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    inner: RwLock<Credentials>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            inner: RwLock::new(credentials),
        }
    }

    fn write<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Credentials),
    {
        let mut guard = self
            .inner
            .write()
            .map_err(|e| anyhow::anyhow!("token store lock poisoned: {}", e))?;
        f(&mut *guard);
        Ok(())
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Credentials> {
        let guard = self
            .inner
            .read()
            .map_err(|e| anyhow::anyhow!("token store lock poisoned: {}", e))?;
        Ok(guard.clone())
    }

    fn replace(&self, credentials: Credentials) -> Result<()> {
        self.write(|c| *c = credentials)
    }

    fn set_access(&self, access: &str, refresh: Option<&str>) -> Result<()> {
        self.write(|c| {
            c.access = Some(access.to_string());
            if let Some(refresh) = refresh {
                c.refresh = Some(refresh.to_string());
            }
        })
    }

    fn set_user(&self, user: &UserSnapshot) -> Result<()> {
        self.write(|c| c.user = Some(user.clone()))
    }

    fn clear(&self) -> Result<()> {
        self.write(|c| *c = Credentials::default())
    }
}
