//! Journal entry endpoints built on the manager: creating an entry, replying,
//! reading an entry's metadata and listing entries.

use super::manager::{JournalEntryChatRef, RefreshOptions};
use super::registry::{EntryManagerCache, EntryManagerLease, JournalEntryManagerRef};
use crate::api::{ApiClient, ApiError, User};
use crate::crypto::{CryptoError, WrappedClientKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub const CREATE_ENDPOINT: &str = "/api/1/journals/entries/";
pub const REPLY_ENDPOINT: &str = "/api/1/journals/entries/chat/";
pub const SHOW_METADATA_ENDPOINT: &str = "/api/1/journals/entries/show_metadata";
pub const SEARCH_ENDPOINT: &str = "/api/1/journals/entries/search";

#[derive(Debug, Clone, thiserror::Error)]
pub enum EntryRequestError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("failed to decrypt: {0}")]
    Crypto(#[from] CryptoError),
    #[error("unexpected payload: {0}")]
    Decode(String),
}

/// Creates a journal entry and starts streaming its greeting into the
/// entry's manager.
pub async fn start_entry(
    cache: &Arc<EntryManagerCache>,
    user: &User,
    key: WrappedClientKey,
) -> Result<(EntryManagerLease, JoinHandle<()>), ApiError> {
    let backend = cache.backend();
    let body = json!({
        "platform": backend.platform(),
        "journal_client_key_uid": key.uid,
    });
    let created: JournalEntryChatRef = backend.post_entry_ref(CREATE_ENDPOINT, &body, user).await?;
    log::info!("[entry] created {}", created.journal_entry_uid);
    let lease = cache.request(JournalEntryManagerRef {
        journal_entry_uid: created.journal_entry_uid,
        journal_entry_jwt: created.journal_entry_jwt,
    });
    let attached = lease.attach(created.journal_chat_jwt, key, false);
    Ok((lease, attached))
}

/// Saves the user's reply and streams the system's response. The reply is
/// encrypted with whichever client key the refresh resolves. Not retried on
/// rate limiting since the endpoint is not idempotent.
pub fn reply(lease: &EntryManagerLease, user: User, message: String) -> JoinHandle<()> {
    let backend = lease.backend();
    let opts = RefreshOptions {
        endpoint: Some(REPLY_ENDPOINT.to_string()),
        bonus_params: Some(Box::new(move |key: &WrappedClientKey| {
            let mut extra = Map::new();
            let token = key.key.encrypt(message.as_bytes(), backend.server_now_ms());
            extra.insert("encrypted_user_message".into(), Value::String(token));
            Ok(extra)
        })),
        unsafe_to_retry: true,
    };
    lease.refresh(user, opts)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntryMetadata {
    pub uid: String,
    /// Seconds since the unix epoch.
    pub created_at: f64,
    pub canonical_at: f64,
}

#[derive(Deserialize)]
struct EncryptedPayload {
    encrypted_payload: String,
}

fn decrypt_json<T: serde::de::DeserializeOwned>(
    key: &WrappedClientKey,
    token: &str,
    server_now_ms: i64,
) -> Result<T, EntryRequestError> {
    let plain = key.key.decrypt(token, server_now_ms)?;
    serde_json::from_slice(&plain).map_err(|e| EntryRequestError::Decode(e.to_string()))
}

pub async fn show_metadata(
    api: &ApiClient,
    user: &User,
    journal_entry_uid: &str,
    journal_entry_jwt: &str,
    key: &WrappedClientKey,
) -> Result<JournalEntryMetadata, EntryRequestError> {
    let body = json!({
        "platform": api.platform(),
        "journal_entry_uid": journal_entry_uid,
        "journal_entry_jwt": journal_entry_jwt,
        "journal_client_key_uid": key.uid,
    });
    let resp: EncryptedPayload = api
        .post_json(SHOW_METADATA_ENDPOINT, &body, Some(&user.id_token))
        .await?;
    decrypt_json(key, &resp.encrypted_payload, api.clock().now_ms())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortItem {
    pub key: String,
    pub dir: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Newest first, ties broken by uid.
pub fn initial_sort() -> Vec<SortItem> {
    vec![
        SortItem {
            key: "canonical_at".into(),
            dir: "desc".into(),
            before: None,
            after: None,
        },
        SortItem {
            key: "uid".into(),
            dir: "asc".into(),
            before: None,
            after: None,
        },
    ]
}

/// Keyset sort continuing past `last`.
pub fn sort_after(last: &JournalEntryListItem) -> Vec<SortItem> {
    vec![
        SortItem {
            key: "canonical_at".into(),
            dir: "desc".into(),
            before: None,
            after: Some(json!(last.canonical_at)),
        },
        SortItem {
            key: "uid".into(),
            dir: "asc".into(),
            before: None,
            after: Some(Value::String(last.uid.clone())),
        },
    ]
}

#[derive(Deserialize)]
struct RawListItem {
    uid: String,
    encrypted_payload: String,
}

#[derive(Deserialize)]
struct RawListPage {
    items: Vec<RawListItem>,
    #[serde(default)]
    next_page_sort: Option<Vec<SortItem>>,
}

/// A listed entry with its decrypted payload.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntryListItem {
    pub uid: String,
    pub canonical_at: f64,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntryPage {
    pub items: Vec<JournalEntryListItem>,
    /// Sort to request the next page with, when there is one.
    pub next_page_sort: Option<Vec<SortItem>>,
}

fn has_more(sort: &Option<Vec<SortItem>>) -> bool {
    sort.as_ref()
        .map_or(false, |s| s.iter().any(|i| i.after.as_ref().map_or(false, |a| !a.is_null())))
}

fn decode_page(raw: RawListPage, key: &WrappedClientKey, server_now_ms: i64) -> Result<JournalEntryPage, EntryRequestError> {
    let mut items = Vec::with_capacity(raw.items.len());
    for item in raw.items {
        let payload: Value = decrypt_json(key, &item.encrypted_payload, server_now_ms)?;
        let canonical_at = payload
            .get("canonical_at")
            .and_then(Value::as_f64)
            .ok_or_else(|| EntryRequestError::Decode(format!("{} has no canonical_at", item.uid)))?;
        items.push(JournalEntryListItem {
            uid: item.uid,
            canonical_at,
            payload,
        });
    }
    let next_page_sort = if has_more(&raw.next_page_sort) {
        raw.next_page_sort
    } else {
        None
    };
    Ok(JournalEntryPage {
        items,
        next_page_sort,
    })
}

/// One page of the user's entries. Pass `None` for the first page, then the
/// previous page's `next_page_sort`.
pub async fn search(
    api: &ApiClient,
    user: &User,
    key: &WrappedClientKey,
    sort: Option<Vec<SortItem>>,
    limit: u32,
) -> Result<JournalEntryPage, EntryRequestError> {
    let url = reqwest::Url::parse_with_params(
        &api.url(SEARCH_ENDPOINT),
        &[("client_key_uid", key.uid.as_str()), ("platform", api.platform())],
    )
    .map_err(|e| EntryRequestError::Decode(format!("Failed to build search url: {}", e)))?;
    let body = json!({
        "filters": {
            "flags": {
                "mutation": {"operator": "and", "value": 1},
                "comparison": {"operator": "eq", "value": 0},
            }
        },
        "sort": sort.unwrap_or_else(initial_sort),
        "limit": limit,
    });
    let raw: RawListPage = api.post_json(url.as_str(), &body, Some(&user.id_token)).await?;
    decode_page(raw, key, api.clock().now_ms())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Fernet;

    const NOW: i64 = 1_700_000_000_000;

    fn key() -> WrappedClientKey {
        WrappedClientKey {
            uid: "ck".into(),
            key: Fernet::new(&Fernet::generate_key()).unwrap(),
        }
    }

    #[test]
    fn page_items_are_decrypted() {
        let key = key();
        let token = key.key.encrypt(br#"{"uid":"e1","canonical_at":1700000000.5,"created_at":1}"#, NOW);
        let raw: RawListPage = serde_json::from_value(json!({
            "items": [{"uid": "e1", "encrypted_payload": token}],
            "next_page_sort": [
                {"key": "canonical_at", "dir": "desc", "before": null, "after": 1700000000.5},
                {"key": "uid", "dir": "asc", "before": null, "after": "e1"}
            ]
        }))
        .unwrap();
        let page = decode_page(raw, &key, NOW).unwrap();
        assert_eq!(page.items[0].canonical_at, 1_700_000_000.5);
        assert_eq!(page.next_page_sort, Some(sort_after(&page.items[0])));
    }

    #[test]
    fn page_without_cursor_is_last() {
        let raw: RawListPage = serde_json::from_value(json!({
            "items": [],
            "next_page_sort": [{"key": "uid", "dir": "asc", "before": null, "after": null}]
        }))
        .unwrap();
        assert_eq!(decode_page(raw, &key(), NOW).unwrap().next_page_sort, None);
    }

    #[test]
    fn metadata_decrypts_with_server_time() {
        let key = key();
        let token = key.key.encrypt(br#"{"uid":"e1","created_at":10.0,"canonical_at":11.0}"#, NOW);
        let meta: JournalEntryMetadata = decrypt_json(&key, &token, NOW + 5_000).unwrap();
        assert_eq!(meta.canonical_at, 11.0);
        let stale = decrypt_json::<JournalEntryMetadata>(&key, &token, NOW + 600_000);
        assert!(matches!(stale, Err(EntryRequestError::Crypto(CryptoError::Expired))));
    }

    #[test]
    fn first_page_sorts_newest_first() {
        let sort = initial_sort();
        assert_eq!((sort[0].key.as_str(), sort[0].dir.as_str()), ("canonical_at", "desc"));
        assert_eq!((sort[1].key.as_str(), sort[1].dir.as_str()), ("uid", "asc"));
    }
}
