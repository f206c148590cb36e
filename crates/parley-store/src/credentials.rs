//! In-process credential store.

use std::collections::HashMap;

use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretString};

use parley_core::{CredentialPort, ProviderConfig, ServerId};

/// API keys held in memory, keyed by `<server_id>_<provider_type>`.
/// Values are wrapped in [`SecretString`] so they never show up in `Debug`
/// output or logs.
#[derive(Default)]
pub struct MemoryCredentials {
    keys: RwLock<HashMap<String, SecretString>>,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.keys
            .write()
            .insert(key.into(), SecretString::from(value.into()));
    }

    /// Store the key a provider-backed server will be looked up under.
    pub fn set_for(&self, server_id: &ServerId, config: &ProviderConfig, value: impl Into<String>) {
        self.set(config.credential_key(server_id), value);
    }

    pub fn remove(&self, key: &str) -> bool {
        self.keys.write().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

impl std::fmt::Debug for MemoryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.keys.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("MemoryCredentials").field("keys", &names).finish()
    }
}

impl CredentialPort for MemoryCredentials {
    fn get_api_key(&self, key: &str) -> Option<String> {
        self.keys
            .read()
            .get(key)
            .map(|secret| secret.expose_secret().to_string())
            .filter(|value| !value.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use parley_core::ProviderType;

    use super::*;

    #[test]
    fn lookup_by_server_and_provider() {
        let creds = MemoryCredentials::new();
        let config = ProviderConfig::new(ProviderType::OpenAi, "gpt-4o");
        creds.set_for(&ServerId::from_raw("srv_a"), &config, "sk-1");

        assert_eq!(creds.get_api_key("srv_a_openai").as_deref(), Some("sk-1"));
        assert_eq!(creds.get_api_key("srv_b_openai"), None);
        assert!(creds.remove("srv_a_openai"));
        assert!(creds.is_empty());
    }

    #[test]
    fn empty_key_counts_as_missing() {
        let creds = MemoryCredentials::new();
        creds.set("srv_a_groq", "");
        assert_eq!(creds.get_api_key("srv_a_groq"), None);
    }

    #[test]
    fn debug_hides_values() {
        let creds = MemoryCredentials::new();
        creds.set("srv_a_openai", "sk-secret");
        let shown = format!("{creds:?}");
        assert!(shown.contains("srv_a_openai"));
        assert!(!shown.contains("sk-secret"));
    }
}
