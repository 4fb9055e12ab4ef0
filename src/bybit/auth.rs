use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::secrets::Credentials;

type HmacSha256 = Hmac<Sha256>;

/// Request signer for Bybit v5 private endpoints.
pub struct BybitAuth {
    api_key: String,
    api_secret: String,
}

impl BybitAuth {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            api_key: credentials.api_key,
            api_secret: credentials.api_secret,
        }
    }

    pub fn get_api_key(&self) -> &str {
        &self.api_key
    }

    /// HMAC-SHA256 over `timestamp + api_key + recv_window + payload`, hex
    /// encoded. `payload` is the JSON body for POST and the query string for
    /// GET.
    pub fn generate_signature(&self, timestamp: i64, recv_window: u64, payload: &str) -> String {
        let sign_str = format!("{}{}{}{}", timestamp, &self.api_key, recv_window, payload);

        // HMAC accepts keys of any length, so this never fails in practice.
        let mut mac = match HmacSha256::new_from_slice(self.api_secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(sign_str.as_bytes());

        hex::encode(mac.finalize().into_bytes())
    }

    /// Current timestamp in milliseconds.
    pub fn get_timestamp() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}
