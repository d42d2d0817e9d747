//! Login boundary checked before monitoring starts.

use std::collections::BTreeMap;

use crate::settings::PipelineSettings;

/// Maps a credential pair to allowed / denied. Implementations must not touch
/// pipeline state.
pub trait CredentialCheck: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> bool;
}

/// Username to password table from settings. An empty table lets everyone in.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    credentials: BTreeMap<String, String>,
}

impl AllowList {
    pub fn new(credentials: BTreeMap<String, String>) -> Self {
        Self { credentials }
    }

    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self::new(settings.credentials.clone())
    }

    pub fn requires_login(&self) -> bool {
        !self.credentials.is_empty()
    }
}

impl CredentialCheck for AllowList {
    fn authenticate(&self, username: &str, password: &str) -> bool {
        if !self.requires_login() {
            return true;
        }
        self.credentials
            .get(username)
            .is_some_and(|expected| expected == password)
    }
}
