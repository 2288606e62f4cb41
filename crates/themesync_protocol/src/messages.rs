//! JSON bodies of the theme assets API.

use crate::asset::{Asset, AssetKey, Checksum};
use crate::error::ProtocolResult;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One asset as returned by the list and get endpoints.
///
/// The list endpoint omits content; the get endpoint carries either a text
/// `value` or a base64 `attachment`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    /// Asset key.
    pub key: String,
    /// Hex MD5 of the content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Last modification time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// MIME type reported by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Text content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Base64 binary content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
}

impl AssetRecord {
    /// Converts the inventory fields into an [`Asset`].
    ///
    /// A malformed checksum is treated as unknown rather than fatal, so the
    /// asset will always be considered out of sync.
    pub fn to_asset(&self) -> ProtocolResult<Asset> {
        let key = AssetKey::new(&self.key)?;
        let checksum = self
            .checksum
            .as_deref()
            .and_then(|hex| Checksum::from_hex(hex).ok());
        Ok(Asset::remote(
            key,
            checksum,
            self.size.unwrap_or(0),
            self.updated_at,
        ))
    }

    /// Returns the decoded content carried by a get response.
    pub fn content(&self) -> ProtocolResult<Vec<u8>> {
        if let Some(value) = &self.value {
            return Ok(value.clone().into_bytes());
        }
        if let Some(attachment) = &self.attachment {
            return Ok(STANDARD.decode(attachment)?);
        }
        Ok(Vec::new())
    }
}

/// Body of `GET assets.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetListResponse {
    /// One page of the inventory.
    #[serde(default)]
    pub assets: Vec<AssetRecord>,
}

/// Body of `GET assets.json?asset[key]=...` and of successful `PUT`s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetEnvelope {
    /// The asset.
    pub asset: AssetRecord,
}

/// Asset fields sent on `PUT`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetBody {
    /// Asset key.
    pub key: String,
    /// Text content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Base64 binary content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
}

/// Body of `PUT assets.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetUpload {
    /// The asset to write.
    pub asset: AssetBody,
}

impl AssetUpload {
    /// Builds an upload body, choosing `value` for UTF-8 content and a
    /// base64 `attachment` otherwise.
    pub fn new(key: &AssetKey, content: &[u8]) -> Self {
        let (value, attachment) = match std::str::from_utf8(content) {
            Ok(text) => (Some(text.to_string()), None),
            Err(_) => (None, Some(STANDARD.encode(content))),
        };
        Self {
            asset: AssetBody {
                key: key.as_str().to_string(),
                value,
                attachment,
            },
        }
    }

    /// Serializes the body.
    pub fn to_json(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Returns the content this body will store.
    pub fn content(&self) -> ProtocolResult<Vec<u8>> {
        if let Some(value) = &self.asset.value {
            return Ok(value.clone().into_bytes());
        }
        match &self.asset.attachment {
            Some(attachment) => Ok(STANDARD.decode(attachment)?),
            None => Ok(Vec::new()),
        }
    }
}

/// One theme in `GET themes.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeRecord {
    /// Numeric theme id.
    pub id: u64,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// `main` for the published theme, `unpublished` or `demo` otherwise.
    #[serde(default)]
    pub role: String,
}

/// Body of `GET themes.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThemeListResponse {
    /// All themes of the store.
    #[serde(default)]
    pub themes: Vec<ThemeRecord>,
}

impl ThemeListResponse {
    /// Returns the published theme.
    pub fn main_theme(&self) -> Option<&ThemeRecord> {
        self.themes.iter().find(|theme| theme.role == "main")
    }
}

/// Error body returned with 4xx responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Either a string or a map of field to messages.
    pub errors: serde_json::Value,
}

impl ErrorBody {
    /// Flattens the errors into one line.
    pub fn message(&self) -> String {
        match &self.errors {
            serde_json::Value::String(text) => text.clone(),
            serde_json::Value::Object(fields) => fields
                .iter()
                .map(|(field, messages)| match messages {
                    serde_json::Value::Array(items) => {
                        let joined: Vec<String> = items
                            .iter()
                            .map(|m| m.as_str().map(str::to_string).unwrap_or_else(|| m.to_string()))
                            .collect();
                        format!("{}: {}", field, joined.join(", "))
                    }
                    other => format!("{}: {}", field, other),
                })
                .collect::<Vec<_>>()
                .join("; "),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_response_parsing() {
        let body = r#"{"assets":[
            {"key":"layout/theme.liquid","checksum":"D41D8CD98F00B204E9800998ECF8427E","size":0,
             "updated_at":"2024-03-01T10:00:00-05:00","content_type":"text/x-liquid"},
            {"key":"assets/logo.png","checksum":null,"size":120}
        ]}"#;
        let parsed: AssetListResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.assets.len(), 2);

        let theme = parsed.assets[0].to_asset().unwrap();
        assert_eq!(theme.key.as_str(), "layout/theme.liquid");
        assert_eq!(theme.checksum, Some(Checksum::of(b"")));
        assert_eq!(
            theme.updated_at.unwrap().to_rfc3339(),
            "2024-03-01T15:00:00+00:00"
        );

        let logo = parsed.assets[1].to_asset().unwrap();
        assert_eq!(logo.checksum, None);
        assert_eq!(logo.size, 120);
    }

    #[test]
    fn text_upload_uses_value() {
        let key = AssetKey::new("snippets/a.liquid").unwrap();
        let upload = AssetUpload::new(&key, b"{{ 'hi' }}");
        assert_eq!(upload.asset.value.as_deref(), Some("{{ 'hi' }}"));
        assert!(upload.asset.attachment.is_none());

        let json = String::from_utf8(upload.to_json().unwrap()).unwrap();
        assert!(json.contains("\"key\":\"snippets/a.liquid\""));
        assert!(!json.contains("attachment"));
    }

    #[test]
    fn binary_upload_uses_attachment() {
        let key = AssetKey::new("assets/logo.png").unwrap();
        let bytes = vec![0x89, 0x50, 0x4e, 0x47, 0xff, 0x00];
        let upload = AssetUpload::new(&key, &bytes);
        assert!(upload.asset.value.is_none());
        assert_eq!(upload.content().unwrap(), bytes);
    }

    #[test]
    fn get_response_content() {
        let body = r#"{"asset":{"key":"assets/logo.png","attachment":"iVBORw=="}}"#;
        let parsed: AssetEnvelope = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.asset.content().unwrap(), vec![0x89, 0x50, 0x4e, 0x47]);

        let body = r#"{"asset":{"key":"x","attachment":"***"}}"#;
        let parsed: AssetEnvelope = serde_json::from_str(body).unwrap();
        assert!(parsed.asset.content().is_err());
    }

    #[test]
    fn main_theme_lookup() {
        let body = r#"{"themes":[{"id":1,"name":"Draft","role":"unpublished"},{"id":42,"name":"Dawn","role":"main"}]}"#;
        let parsed: ThemeListResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.main_theme().map(|t| t.id), Some(42));
        assert!(ThemeListResponse::default().main_theme().is_none());
    }

    #[test]
    fn error_body_flattening() {
        let body: ErrorBody = serde_json::from_str(r#"{"errors":"Not Found"}"#).unwrap();
        assert_eq!(body.message(), "Not Found");

        let body: ErrorBody =
            serde_json::from_str(r#"{"errors":{"asset":["is invalid","is too big"]}}"#).unwrap();
        assert_eq!(body.message(), "asset: is invalid, is too big");
    }
}
