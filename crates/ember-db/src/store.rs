use anyhow::Result;
use tracing::warn;

use ember_auth::{Credentials, TokenStore};
use ember_types::models::UserSnapshot;

use crate::Database;
use crate::models::SessionRow;

impl TokenStore for Database {
    fn load(&self) -> Result<Credentials> {
        let row = self.get_session()?;
        // A corrupt snapshot is dropped; hydration fetches a fresh one anyway
        let user = row.user_json.as_deref().and_then(|json| {
            serde_json::from_str::<UserSnapshot>(json)
                .map_err(|e| warn!("Discarding unreadable user snapshot: {}", e))
                .ok()
        });
        Ok(Credentials {
            access: row.access,
            refresh: row.refresh,
            user,
        })
    }

    fn replace(&self, credentials: Credentials) -> Result<()> {
        let user_json = credentials.user.as_ref().map(serde_json::to_string).transpose()?;
        self.put_session(&SessionRow {
            access: credentials.access,
            refresh: credentials.refresh,
            user_json,
        })
    }

    fn set_access(&self, access: &str, refresh: Option<&str>) -> Result<()> {
        self.update_access(access, refresh)
    }

    fn set_user(&self, user: &UserSnapshot) -> Result<()> {
        self.update_user(&serde_json::to_string(user)?)
    }

    fn clear(&self) -> Result<()> {
        self.delete_session()
    }
}
