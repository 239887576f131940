use tracing::debug;

use crate::error::{Error, Result};
use crate::gmail_api::client::MailApi;

// Look up a label id by its display name. Matching is exact and
// case-sensitive, like the Gmail UI sidebar.
pub async fn resolve_label_id<C: MailApi + ?Sized>(client: &C, name: &str) -> Result<String> {
    let labels = client.list_labels().await?;
    match labels.into_iter().find(|label| label.name == name) {
        Some(label) => {
            debug!("label {name:?} resolved to {}", label.id);
            Ok(label.id)
        }
        None => Err(Error::LabelNotFound {
            name: name.to_string(),
        }),
    }
}
