//! Content part types
//!
//! The tagged content sum carried by [`RawMessage`](crate::message::RawMessage).

use serde::{Deserialize, Serialize};

/// A content part in a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ContentPart {
    /// Text content
    Text {
        /// The text content
        text: String,
    },

    /// Image content
    Image {
        /// Image location and fidelity
        image_url: ImageUrl,
    },

    /// A prompt-caching boundary hint
    CacheCheckpoint {
        /// Cache variant to request
        cache_type: CacheType,
    },

    /// A verbatim value passed through untouched
    Opaque {
        /// The opaque payload
        value: serde_json::Value,
    },
}

impl ContentPart {
    /// Create a text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create an image part from a URL.
    pub fn image(url: impl Into<String>, detail: Option<ImageDetail>) -> Self {
        Self::Image {
            image_url: ImageUrl {
                url: url.into(),
                detail,
            },
        }
    }

    /// Create a cache checkpoint part.
    pub fn cache_checkpoint(cache_type: CacheType) -> Self {
        Self::CacheCheckpoint { cache_type }
    }

    /// Create an opaque part.
    pub fn opaque(value: serde_json::Value) -> Self {
        Self::Opaque { value }
    }

    /// Get text content if this is a text part.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        }
    }
}

/// Location and fidelity of an image part.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    /// Image URL (remote or data URI)
    pub url: String,

    /// Requested processing fidelity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<ImageDetail>,
}

/// Processing fidelity for image parts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageDetail {
    /// Reduced-cost processing
    Low,

    /// Full-fidelity processing
    High,
}

/// Cache variant requested by a checkpoint.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// Short-lived cache entry
    #[default]
    Ephemeral,
}
