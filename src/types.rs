use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::document::DocumentKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileState {
    StateUnspecified,
    Processing,
    Active,
    Failed,
    #[serde(other)]
    Unknown,
}

impl Default for FileState {
    fn default() -> Self {
        FileState::StateUnspecified
    }
}

impl FileState {
    pub fn is_terminal(self) -> bool {
        self != FileState::Processing
    }
}

/// A file record as assigned by the remote service. The display name is decoded into a
/// `DocumentKey` once, at the wire boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub name: String,
    #[serde(rename = "displayName", default = "empty_key")]
    pub key: DocumentKey,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub state: FileState,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn empty_key() -> DocumentKey {
    DocumentKey::Literal(String::new())
}

impl UploadedFile {
    pub fn display_name(&self) -> String {
        self.key.display_name()
    }
}

impl Serialize for DocumentKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DocumentKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(DocumentKey::parse(&raw))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilesResponse {
    #[serde(default)]
    pub files: Vec<UploadedFile>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    Function,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    pub fn function_call(&self) -> Option<&FunctionCall> {
        self.parts.iter().find_map(|part| match part {
            Part::FunctionCall { function_call } => Some(function_call),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub file_uri: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: Value,
}

/// One element of a turn. Unknown part kinds survive as `Other`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: FunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: FunctionResponse,
    },
    FileData {
        #[serde(rename = "fileData")]
        file_data: FileData,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
    Text {
        text: String,
    },
    Other(Map<String, Value>),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn file(file: &UploadedFile) -> Self {
        Part::FileData {
            file_data: FileData {
                file_uri: file.uri.clone(),
                mime_type: file.mime_type.clone(),
            },
        }
    }

    pub fn inline(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        Part::InlineData {
            inline_data: InlineData {
                mime_type: mime_type.into(),
                data: BASE64.encode(bytes),
            },
        }
    }

    pub fn function_response(name: &str, content: Value) -> Self {
        Part::FunctionResponse {
            function_response: FunctionResponse {
                name: name.to_string(),
                response: serde_json::json!({ "name": name, "content": content }),
            },
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_token_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates_token_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_token_count: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    pub usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: Option<CandidateContent>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CandidateContent {
    pub parts: Option<Vec<Part>>,
}

impl Candidate {
    /// `None` for a terminal completion that carried no content parts.
    pub fn parts(&self) -> Option<&[Part]> {
        self.content
            .as_ref()
            .and_then(|content| content.parts.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn uploaded_file_decodes_display_name_into_key() {
        let file: UploadedFile = serde_json::from_value(json!({
            "name": "files/abc",
            "displayName": "fileId@doc1$page@2$maxPage@3",
            "mimeType": "image/png",
            "uri": "https://generativelanguage.googleapis.com/v1beta/files/abc",
            "state": "ACTIVE",
            "sizeBytes": "1024"
        }))
        .unwrap();
        assert_eq!(file.key, DocumentKey::paged("doc1", 2, 3));
        assert_eq!(file.state, FileState::Active);
        assert_eq!(file.extra.get("sizeBytes"), Some(&json!("1024")));

        let back = serde_json::to_value(&file).unwrap();
        assert_eq!(back["displayName"], json!("fileId@doc1$page@2$maxPage@3"));
        assert_eq!(back["sizeBytes"], json!("1024"));
    }

    #[test]
    fn unknown_state_is_tolerated() {
        let file: UploadedFile =
            serde_json::from_value(json!({"name": "files/x", "state": "ARCHIVED"})).unwrap();
        assert_eq!(file.state, FileState::Unknown);
        assert!(file.state.is_terminal());
        assert!(!FileState::Processing.is_terminal());
    }

    #[test]
    fn parts_use_wire_field_names() {
        let parts: Vec<Part> = serde_json::from_value(json!([
            {"text": "hi"},
            {"fileData": {"fileUri": "u", "mimeType": "application/pdf"}},
            {"functionCall": {"name": "lookupWeather", "args": {"city": "Tokyo"}}},
            {"executableCode": {"code": "print(1)"}}
        ]))
        .unwrap();
        assert_eq!(parts[0], Part::text("hi"));
        assert!(matches!(&parts[1], Part::FileData { file_data } if file_data.file_uri == "u"));
        assert!(
            matches!(&parts[2], Part::FunctionCall { function_call } if function_call.name == "lookupWeather")
        );
        assert!(matches!(&parts[3], Part::Other(map) if map.contains_key("executableCode")));

        let response = serde_json::to_value(Part::function_response("f", json!({"tempC": 18}))).unwrap();
        assert_eq!(
            response,
            json!({"functionResponse": {"name": "f", "response": {"name": "f", "content": {"tempC": 18}}}})
        );
    }

    #[test]
    fn candidate_without_parts_is_terminal() {
        let resp: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{"finishReason": "SAFETY"}],
            "usageMetadata": {"promptTokenCount": 5, "totalTokenCount": 5}
        }))
        .unwrap();
        assert!(resp.candidates[0].parts().is_none());
        assert_eq!(resp.usage_metadata.unwrap().prompt_token_count, Some(5));
    }
}
