use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct LabelsResponse {
    #[serde(default)]
    pub labels: Vec<Label>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Label {
    pub id: String,
    pub name: String,
    #[serde(rename = "messagesTotal")]
    pub messages_total: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesResponse {
    // Gmail omits the field entirely when a page is empty.
    #[serde(default)]
    pub messages: Vec<MessageRef>,
    #[serde(rename = "nextPageToken")]
    pub next_page_token: Option<String>,
    #[serde(rename = "resultSizeEstimate")]
    pub result_size_estimate: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MessageRef {
    pub id: String,
    #[serde(rename = "threadId")]
    pub thread_id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Message {
    pub id: String,
    #[serde(rename = "threadId")]
    pub thread_id: String,
    #[serde(rename = "historyId")]
    pub history_id: Option<String>,
    #[serde(rename = "labelIds", default)]
    pub label_ids: Vec<String>,
    pub raw: Option<String>,
    pub snippet: Option<String>,
    pub payload: Option<MessagePart>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MessagePart {
    #[serde(rename = "mimeType")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub headers: Vec<Header>,
    pub body: Option<MessagePartBody>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MessagePartBody {
    pub data: Option<String>,
}

// Insertion body. Carries only what the destination should see, so the
// source account's id, threadId and historyId cannot leak through.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OutgoingMessage {
    pub raw: String,
    #[serde(rename = "labelIds")]
    pub label_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormat {
    Raw,
    Full,
}

impl MessageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageFormat::Raw => "raw",
            MessageFormat::Full => "full",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListParams {
    pub label_ids: Vec<String>,
    pub query: Option<String>,
    pub include_spam_and_trash: bool,
}

impl Default for ListParams {
    fn default() -> Self {
        ListParams {
            label_ids: Vec::new(),
            query: None,
            include_spam_and_trash: true,
        }
    }
}
