use anyhow::Result;
use std::fmt;

use crate::config::ExchangeConfig;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Source of exchange credentials. Only process bootstrap calls this; the
/// trading core receives a constructed client.
pub trait SecretsProvider {
    fn credentials(&self) -> Result<Option<Credentials>>;
}

/// Reads `BYBIT_API_KEY` / `BYBIT_API_SECRET`, falling back to the values
/// in the exchange config.
pub struct EnvSecrets {
    key_var: String,
    secret_var: String,
    fallback_key: Option<String>,
    fallback_secret: Option<String>,
}

impl EnvSecrets {
    pub fn new(config: &ExchangeConfig) -> Self {
        Self {
            key_var: "BYBIT_API_KEY".to_string(),
            secret_var: "BYBIT_API_SECRET".to_string(),
            fallback_key: config.api_key.clone(),
            fallback_secret: config.api_secret.clone(),
        }
    }

    pub fn with_vars(mut self, key_var: &str, secret_var: &str) -> Self {
        self.key_var = key_var.to_string();
        self.secret_var = secret_var.to_string();
        self
    }
}

impl SecretsProvider for EnvSecrets {
    fn credentials(&self) -> Result<Option<Credentials>> {
        let key = std::env::var(&self.key_var)
            .ok()
            .or_else(|| self.fallback_key.clone())
            .filter(|k| !k.is_empty());
        let secret = std::env::var(&self.secret_var)
            .ok()
            .or_else(|| self.fallback_secret.clone())
            .filter(|s| !s.is_empty());

        match (key, secret) {
            (Some(api_key), Some(api_secret)) => Ok(Some(Credentials { api_key, api_secret })),
            (None, None) => Ok(None),
            _ => anyhow::bail!(
                "only one of {} / {} is set",
                self.key_var,
                self.secret_var
            ),
        }
    }
}
