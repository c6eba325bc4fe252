//! Monitored endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type SiteId = i64;

/// An endpoint probed once per cycle while `is_active` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredSite {
    pub id: SiteId,
    pub url: String,
    pub name: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl MonitoredSite {
    /// Name for log lines and tables: the display name, falling back to the URL.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }
}

/// Fields supplied when registering or editing a site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteDraft {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl SiteDraft {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
            is_active: true,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Reject drafts the prober could never use.
    pub fn validate(&self) -> Result<(), String> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err("site url must not be empty".to_string());
        }
        if url.contains(char::is_whitespace) {
            return Err(format!("site url '{url}' contains whitespace"));
        }
        Ok(())
    }
}
