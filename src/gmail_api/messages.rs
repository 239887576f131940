use futures::stream::{self, Stream, TryStreamExt};

use crate::error::{Error, Result};
use crate::gmail_api::client::MailApi;
use crate::types::{ListParams, MessageRef};

enum PageCursor {
    Start,
    Next(String),
    Done,
}

/// Lazily enumerate message refs, one page request at a time. Page N+1 is
/// requested with exactly the token page N returned; a page without a
/// token ends the stream. No request is made until the stream is polled,
/// and at most one page is held in memory.
pub fn list_messages<'a, C>(
    client: &'a C,
    params: ListParams,
) -> impl Stream<Item = Result<MessageRef>> + 'a
where
    C: MailApi + ?Sized,
{
    stream::try_unfold(
        (PageCursor::Start, params),
        move |(cursor, params)| async move {
            let token = match cursor {
                PageCursor::Start => None,
                PageCursor::Next(token) => Some(token),
                // The annotation pins the unfold's error type; nothing else
                // in the closure names it.
                PageCursor::Done => return Ok::<_, Error>(None),
            };
            let page = client.list_messages_page(&params, token.as_deref()).await?;
            let next = match page.next_page_token {
                Some(token) => PageCursor::Next(token),
                None => PageCursor::Done,
            };
            let refs: Vec<Result<MessageRef>> = page.messages.into_iter().map(Ok).collect();
            Ok(Some((stream::iter(refs), (next, params))))
        },
    )
    .try_flatten()
}
