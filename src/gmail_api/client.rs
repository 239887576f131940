use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{Error, Result};
use crate::gmail_api::auth::Authenticator;
use crate::types::{
    Label, LabelsResponse, ListMessagesResponse, ListParams, Message, MessageFormat,
    OutgoingMessage,
};

pub const GMAIL_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// Fixed page size for message listing.
pub const PAGE_SIZE: u32 = 500;

/// Mailbox operations the rest of the crate is written against.
/// `GmailClient` is the production implementation; tests drive the
/// pipeline with scripted fakes instead.
#[async_trait]
pub trait MailApi: Send + Sync {
    async fn list_labels(&self) -> Result<Vec<Label>>;

    async fn get_label(&self, label_id: &str) -> Result<Label>;

    /// Fetch one page of message refs. Callers follow `next_page_token`
    /// themselves; `list_messages` in this crate does it lazily.
    async fn list_messages_page(
        &self,
        params: &ListParams,
        page_token: Option<&str>,
    ) -> Result<ListMessagesResponse>;

    async fn get_message(&self, message_id: &str, format: MessageFormat) -> Result<Message>;

    /// Insert into the bound account with `internalDateSource=dateHeader`,
    /// so the stored date comes from the message's own Date header.
    async fn insert_message(&self, message: &OutgoingMessage) -> Result<()>;
}

#[derive(Clone)]
pub struct GmailClient {
    http: reqwest::Client,
    auth: Arc<Authenticator>,
}

impl GmailClient {
    pub fn new(auth: Arc<Authenticator>) -> Self {
        GmailClient {
            http: reqwest::Client::new(),
            auth,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T> {
        let token = self.auth.access_token().await?;
        let response = self
            .http
            .get(url)
            .query(query)
            .bearer_auth(&token)
            .send()
            .await?;
        read_json(response).await
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        Ok(response.json::<T>().await?)
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(Error::from_status(status.as_u16(), body))
    }
}

fn list_query(params: &ListParams, page_token: Option<&str>) -> Vec<(&'static str, String)> {
    let mut query = vec![("maxResults", PAGE_SIZE.to_string())];
    for label_id in &params.label_ids {
        query.push(("labelIds", label_id.clone()));
    }
    if let Some(q) = &params.query {
        query.push(("q", q.clone()));
    }
    if params.include_spam_and_trash {
        query.push(("includeSpamTrash", "true".to_string()));
    }
    if let Some(token) = page_token {
        query.push(("pageToken", token.to_string()));
    }
    query
}

#[async_trait]
impl MailApi for GmailClient {
    async fn list_labels(&self) -> Result<Vec<Label>> {
        let url = format!("{GMAIL_BASE_URL}/labels");
        let data: LabelsResponse = self.get_json(&url, &[]).await?;
        debug!("listed {} labels", data.labels.len());
        Ok(data.labels)
    }

    async fn get_label(&self, label_id: &str) -> Result<Label> {
        let url = format!("{GMAIL_BASE_URL}/labels/{label_id}");
        self.get_json(&url, &[]).await
    }

    async fn list_messages_page(
        &self,
        params: &ListParams,
        page_token: Option<&str>,
    ) -> Result<ListMessagesResponse> {
        let url = format!("{GMAIL_BASE_URL}/messages");
        let page: ListMessagesResponse =
            self.get_json(&url, &list_query(params, page_token)).await?;
        debug!(
            "listed page of {} message refs (more: {})",
            page.messages.len(),
            page.next_page_token.is_some()
        );
        Ok(page)
    }

    async fn get_message(&self, message_id: &str, format: MessageFormat) -> Result<Message> {
        let url = format!("{GMAIL_BASE_URL}/messages/{message_id}");
        self.get_json(&url, &[("format", format.as_str().to_string())])
            .await
    }

    async fn insert_message(&self, message: &OutgoingMessage) -> Result<()> {
        let url = format!("{GMAIL_BASE_URL}/messages");
        let token = self.auth.access_token().await?;
        let response = self
            .http
            .post(&url)
            .query(&[("internalDateSource", "dateHeader")])
            .bearer_auth(&token)
            .json(message)
            .send()
            .await?;
        let inserted: Message = read_json(response).await?;
        debug!("inserted message {}", inserted.id);
        Ok(())
    }
}
