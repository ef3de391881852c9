//! Content blocks coming from the conversation history, this is what we count
//! tokens over.

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Image {
        #[serde(default)]
        source: Option<ImageSource>,
    },
    /// tool_use, tool_result and friends, these are not counted
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// base64 encoded image bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn base64_image(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        ContentBlock::Image {
            source: Some(ImageSource {
                source_type: Some("base64".to_owned()),
                media_type: Some(media_type.into()),
                data: Some(data.into()),
            }),
        }
    }

    /// The embedded image payload if there is one
    pub fn image_data(&self) -> Option<&str> {
        match self {
            ContentBlock::Image {
                source: Some(ImageSource {
                    data: Some(data), ..
                }),
            } => Some(data.as_str()),
            _ => None,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, ContentBlock::Image { .. })
    }
}
