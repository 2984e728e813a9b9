//! Conversations and message threads.

use chrono::Utc;

use super::types::{Conversation, Message, MessageDirection, MessageStatus, NewMessage};
use super::wire::MaybeWrapped;
use super::{segment, temp_id, CrmClient};
use crate::cache::{fetcher, CacheKey, CacheResult, CacheTxn, QueryOptions, Record};
use crate::error::Result;
use crate::query::Query;
use crate::realtime::RealtimeBridge;

const ROOT: &str = "messages";

mod keys {
  use super::*;

  pub fn all() -> CacheKey {
    CacheKey::new(ROOT)
  }

  pub fn conversations() -> CacheKey {
    all().with("conversations")
  }

  pub fn thread(conversation_id: &str) -> CacheKey {
    all().with("thread").with(conversation_id)
  }
}

/// Append a message to a cached thread unless it is already there.
fn append(txn: &mut CacheTxn<'_>, message: &Message) -> Result<bool> {
  txn.update::<Vec<Message>, _>(&keys::thread(&message.conversation_id), |thread| {
    if !thread.iter().any(|m| m.id == message.id) {
      thread.push(message.clone());
    }
  })
}

fn touch_conversation(txn: &mut CacheTxn<'_>, message: &Message, unread: bool) -> Result<bool> {
  txn.update::<Vec<Conversation>, _>(&keys::conversations(), |list| {
    if let Some(c) = list.iter_mut().find(|c| c.id == message.conversation_id) {
      c.last_message = Some(message.body.clone());
      c.updated_at = message.sent_at.or(c.updated_at);
      if unread {
        c.unread_count += 1;
      }
    }
  })
}

pub struct Messages<'a> {
  client: &'a CrmClient,
}

impl<'a> Messages<'a> {
  pub(crate) fn new(client: &'a CrmClient) -> Self {
    Self { client }
  }

  fn options(&self) -> &QueryOptions {
    &self.client.policies().messages
  }

  pub async fn conversations(&self) -> Result<CacheResult<Vec<Conversation>>> {
    let api = self.client.api().clone();
    self
      .client
      .layer()
      .fetch_query(
        &keys::conversations(),
        self.options(),
        fetcher(move || {
          let api = api.clone();
          async move {
            api
              .get_json::<MaybeWrapped<Vec<Conversation>>>("/api/messages/conversations")
              .await?
              .into_records()
          }
        }),
      )
      .await
  }

  fn thread_fetcher(&self, conversation_id: &str) -> Result<crate::cache::Fetcher<Vec<Message>>> {
    let path = format!(
      "/api/messages/conversations/{}/messages",
      segment(conversation_id)?
    );
    let api = self.client.api().clone();
    Ok(fetcher(move || {
      let api = api.clone();
      let path = path.clone();
      async move {
        api
          .get_json::<MaybeWrapped<Vec<Message>>>(&path)
          .await?
          .into_records()
      }
    }))
  }

  pub async fn messages(&self, conversation_id: &str) -> Result<CacheResult<Vec<Message>>> {
    let fetch = self.thread_fetcher(conversation_id)?;
    self
      .client
      .layer()
      .fetch_query(&keys::thread(conversation_id), self.options(), fetch)
      .await
  }

  /// Query handle for a thread; switch threads with [`Query::set_key`]
  /// and [`thread_key`](Self::thread_key).
  pub fn thread_query(&self, conversation_id: &str) -> Result<Query<Vec<Message>>> {
    Ok(Query::new(
      self.client.layer().clone(),
      keys::thread(conversation_id),
      self.options().clone(),
      self.thread_fetcher(conversation_id)?,
    ))
  }

  pub fn thread_key(&self, conversation_id: &str) -> CacheKey {
    keys::thread(conversation_id)
  }

  /// Send a message. A pending copy is shown in the thread until the server
  /// returns the stored one.
  pub async fn send(&self, conversation_id: &str, message: NewMessage) -> Result<Message> {
    message.validate()?;
    let path = format!(
      "/api/messages/conversations/{}/messages",
      segment(conversation_id)?
    );
    let pending = Message {
      id: temp_id(),
      conversation_id: conversation_id.to_string(),
      body: message.body.clone(),
      direction: MessageDirection::Outbound,
      status: MessageStatus::Pending,
      sent_at: Some(Utc::now()),
    };
    let temp = pending.id.clone();
    let thread = keys::thread(conversation_id);
    let api = self.client.api().clone();

    self
      .client
      .mutations()
      .mutation::<Message>("send message")
      .optimistic(move |txn| {
        append(txn, &pending)?;
        touch_conversation(txn, &pending, false)?;
        Ok(())
      })
      .on_success(move |txn, sent| {
        txn.update::<Vec<Message>, _>(&thread, |messages| {
          messages.retain(|m| m.id != sent.id);
          match messages.iter_mut().find(|m| m.id == temp) {
            Some(slot) => *slot = sent.clone(),
            None => messages.push(sent.clone()),
          }
        })?;
        touch_conversation(txn, sent, false)?;
        Ok(())
      })
      .invalidates(keys::conversations())
      .run(|| {
        let api = api.clone();
        let path = path.clone();
        let body = message.clone();
        async move {
          api
            .post_json::<MaybeWrapped<Message>, _>(&path, &body)
            .await?
            .into_record()
        }
      })
      .await
  }

  /// Mark a conversation read. Safe to repeat, so it is retried.
  pub async fn mark_read(&self, conversation_id: &str) -> Result<()> {
    let path = format!(
      "/api/messages/conversations/{}/read",
      segment(conversation_id)?
    );
    let id = conversation_id.to_string();
    let api = self.client.api().clone();

    self
      .client
      .mutations()
      .mutation::<()>("mark conversation read")
      .optimistic(move |txn| {
        txn.update::<Vec<Conversation>, _>(&keys::conversations(), |list| {
          for c in list.iter_mut().filter(|c| c.id == id) {
            c.unread_count = 0;
          }
        })?;
        Ok(())
      })
      .idempotent()
      .run(|| {
        let api = api.clone();
        let path = path.clone();
        async move { api.request(crate::api::ApiRequest::post(path)).await.map(|_| ()) }
      })
      .await
  }
}

/// `new_message` carries a full message. Every event is applied; they are
/// never coalesced.
pub(crate) fn register_push(bridge: &RealtimeBridge) {
  bridge.register("new_message", vec![keys::all()], false, |txn, event| {
    let message: Message = serde_json::from_value(event.payload.clone())?;
    message.validate()?;
    let inbound = message.direction == MessageDirection::Inbound;
    let mut touched = usize::from(append(txn, &message)?);
    touched += usize::from(touch_conversation(txn, &message, inbound)?);
    Ok(touched)
  });
}
