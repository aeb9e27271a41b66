// Authentication types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bearer credentials held by the Embedded runtime
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCredentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// When the pair was last written
    pub updated_at: Option<DateTime<Utc>>,
}

/// Embedded refresh request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Token fields as the server sends them
#[derive(Deserialize, Default, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TokenBody {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

/// Refresh response, either bare or wrapped in the API's `{ status, data }` envelope
#[derive(Deserialize, Default, Debug)]
pub struct RefreshResponse {
    #[serde(default)]
    pub data: Option<TokenBody>,
    #[serde(flatten)]
    pub top: TokenBody,
}

impl RefreshResponse {
    /// Prefer the enveloped tokens, fall back to top-level fields
    pub fn into_tokens(self) -> TokenBody {
        match self.data {
            Some(data) if data.access_token.is_some() => data,
            _ => self.top,
        }
    }
}
