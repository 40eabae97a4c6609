//! Bearer token kept in memory and persisted under its own key.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::persistence::{self, KeyValueStore};

pub const AUTH_KEY: &str = "auth";

/// Tokens this close to expiry are treated as expired.
const EXPIRY_SKEW_SECS: i64 = 30;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Credentials {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(exp) => exp - Duration::seconds(EXPIRY_SKEW_SECS) <= now,
            None => false,
        }
    }
}

pub struct TokenStore {
    kv: Arc<dyn KeyValueStore>,
    current: RwLock<Option<Credentials>>,
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenStore").finish_non_exhaustive()
    }
}

impl TokenStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            current: RwLock::new(None),
        }
    }

    /// Restore the persisted token, if any. A corrupt entry is dropped.
    pub async fn restore(&self) -> Result<()> {
        let creds = match persistence::load_json::<Credentials>(self.kv.as_ref(), AUTH_KEY).await {
            Ok(creds) => creds,
            Err(err) => {
                warn!(?err, "discarding unreadable auth entry");
                self.kv.remove(AUTH_KEY).await?;
                None
            }
        };
        if creds.is_some() {
            info!("restored auth token");
        }
        *self.current.write().await = creds;
        Ok(())
    }

    pub async fn set(&self, creds: Credentials) -> Result<()> {
        persistence::save_json(self.kv.as_ref(), AUTH_KEY, &creds).await?;
        *self.current.write().await = Some(creds);
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.kv.remove(AUTH_KEY).await?;
        *self.current.write().await = None;
        Ok(())
    }

    /// Token usable right now, or None if missing or expired.
    pub async fn bearer(&self) -> Option<String> {
        let guard = self.current.read().await;
        guard
            .as_ref()
            .filter(|c| !c.is_expired_at(Utc::now()))
            .map(|c| c.token.clone())
    }
}
