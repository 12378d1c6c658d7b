//! What the connected role and server can do.
//!
//! Collectors consult [`Capabilities`] once, while building their metrics, to
//! decide whether a metric is computed at all and which query variant it uses.

use crate::gauges::query::{fetch_scalar, fetch_text};
use anyhow::Result;
use parking_lot::RwLock;
use sqlx::PgPool;
use std::{collections::HashMap, fmt, time::Duration};
use tokio::sync::OnceCell;
use tracing::debug;

const SUPERUSER_QUERY: &str = "SELECT rolsuper FROM pg_roles WHERE rolname = current_user";
const EXTENSION_QUERY: &str = "SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = $1)";
const VERSION_QUERY: &str = "SHOW server_version";

/// Something a metric needs from the connected role or server before it can be computed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requirement {
    Superuser,
    Extension(&'static str),
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Superuser => write!(f, "it requires a superuser"),
            Self::Extension(name) => write!(f, "the {name} extension is not installed"),
        }
    }
}

/// Role privilege, installed extensions and server version, each resolved on
/// first use and cached. Failed lookups are not cached.
pub struct Capabilities {
    pool: PgPool,
    timeout: Duration,
    superuser: OnceCell<bool>,
    version: OnceCell<String>,
    extensions: RwLock<HashMap<String, bool>>,
}

impl Capabilities {
    #[must_use]
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self {
            pool,
            timeout,
            superuser: OnceCell::new(),
            version: OnceCell::new(),
            extensions: RwLock::new(HashMap::new()),
        }
    }

    /// Whether the connected role is a superuser.
    ///
    /// # Errors
    ///
    /// Returns an error if the role lookup fails.
    pub async fn is_superuser(&self) -> Result<bool> {
        self.superuser
            .get_or_try_init(|| async {
                let flag = fetch_scalar(&self.pool, SUPERUSER_QUERY, &[], self.timeout).await?;
                debug!(superuser = flag > 0.0, "resolved role privilege");
                Ok::<_, anyhow::Error>(flag > 0.0)
            })
            .await
            .copied()
    }

    /// Whether `name` is installed in the current database.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog lookup fails.
    pub async fn has_extension(&self, name: &str) -> Result<bool> {
        if let Some(installed) = self.extensions.read().get(name).copied() {
            return Ok(installed);
        }

        let params = [name.to_string()];
        let installed = fetch_scalar(&self.pool, EXTENSION_QUERY, &params, self.timeout).await? > 0.0;
        debug!(extension = name, installed, "resolved extension");

        self.extensions.write().insert(name.to_string(), installed);
        Ok(installed)
    }

    /// Server version, trimmed to its leading token (`"16.2 (Debian ...)"` is `"16.2"`).
    ///
    /// # Errors
    ///
    /// Returns an error if `SHOW server_version` fails.
    pub async fn server_version(&self) -> Result<String> {
        self.version
            .get_or_try_init(|| async {
                let raw = fetch_text(&self.pool, VERSION_QUERY, &[], self.timeout).await?;
                let version = normalize_version(&raw);
                debug!(version = %version, "resolved server version");
                Ok::<_, anyhow::Error>(version)
            })
            .await
            .cloned()
    }
}

#[must_use]
pub fn normalize_version(raw: &str) -> String {
    raw.split_whitespace().next().unwrap_or_default().to_string()
}

/// 9.6 reports waits through `wait_event`.
#[must_use]
pub fn is_pg96(version: &str) -> bool {
    version.starts_with("9.6.")
}

/// Anything before 10 still uses the `xlog`/`location` naming.
#[must_use]
pub fn is_pre_pg10(version: &str) -> bool {
    version.starts_with("9.")
}
