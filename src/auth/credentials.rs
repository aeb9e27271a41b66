// Credential persistence for the Embedded runtime

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::types::SessionCredentials;
use crate::runtime::Runtime;
use crate::storage::{KeyValueStore, ScopedStore};

/// Fixed namespace so credentials cannot collide with other stored values
pub const CREDENTIALS_NAMESPACE: &str = "session.credentials:";

const ACCESS_TOKEN_KEY: &str = "access_token";
const REFRESH_TOKEN_KEY: &str = "refresh_token";
const UPDATED_AT_KEY: &str = "updated_at";

/// Owns the bearer/refresh token pair
///
/// In the Web runtime the session lives in HTTP-only cookies, so every
/// operation is a no-op; construction still purges tokens left behind by an
/// earlier Embedded session on the same device.
pub struct CredentialStore {
    runtime: Runtime,
    store: ScopedStore,
}

impl CredentialStore {
    pub fn new(runtime: Runtime, backing: Arc<dyn KeyValueStore>) -> Result<Self> {
        let store = Self {
            runtime,
            store: ScopedStore::new(backing, CREDENTIALS_NAMESPACE),
        };

        if runtime == Runtime::Web {
            store.purge_stale()?;
        }

        Ok(store)
    }

    pub fn runtime(&self) -> Runtime {
        self.runtime
    }

    fn purge_stale(&self) -> Result<()> {
        if self.store.get(ACCESS_TOKEN_KEY)?.is_some()
            || self.store.get(REFRESH_TOKEN_KEY)?.is_some()
        {
            tracing::warn!("Purging stale embedded credentials in web runtime");
        }
        self.remove_all()
    }

    fn remove_all(&self) -> Result<()> {
        self.store.remove(ACCESS_TOKEN_KEY)?;
        self.store.remove(REFRESH_TOKEN_KEY)?;
        self.store.remove(UPDATED_AT_KEY)?;
        Ok(())
    }

    /// Current credentials, `None` when signed out or in the Web runtime
    pub fn get(&self) -> Result<Option<SessionCredentials>> {
        if self.runtime == Runtime::Web {
            return Ok(None);
        }

        let access_token = match self.store.get(ACCESS_TOKEN_KEY)? {
            Some(token) if !token.is_empty() => token,
            _ => return Ok(None),
        };
        let refresh_token = self
            .store
            .get(REFRESH_TOKEN_KEY)?
            .filter(|token| !token.is_empty());
        let updated_at = self
            .store
            .get(UPDATED_AT_KEY)?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(Some(SessionCredentials {
            access_token,
            refresh_token,
            updated_at,
        }))
    }

    /// Store a new pair; `refresh = None` removes any stored refresh token
    pub fn set(&self, access: &str, refresh: Option<&str>) -> Result<()> {
        if self.runtime == Runtime::Web {
            tracing::debug!("Ignoring credential write in web runtime");
            return Ok(());
        }

        self.store
            .set(ACCESS_TOKEN_KEY, access)
            .context("Failed to store access token")?;
        match refresh {
            Some(refresh) => self
                .store
                .set(REFRESH_TOKEN_KEY, refresh)
                .context("Failed to store refresh token")?,
            None => self.store.remove(REFRESH_TOKEN_KEY)?,
        }
        self.store
            .set(UPDATED_AT_KEY, &Utc::now().to_rfc3339())?;

        tracing::debug!(has_refresh = refresh.is_some(), "Credentials stored");
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        if self.runtime == Runtime::Web {
            return Ok(());
        }
        self.remove_all().context("Failed to clear credentials")?;
        tracing::info!("Credentials cleared");
        Ok(())
    }
}
