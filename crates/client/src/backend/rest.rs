//! REST binding for the hosted backend (PostgREST tables + storage API).

use async_trait::async_trait;
use bidroom_shared::{
    Attachment, BackendError, MessageRow, NewMessage, NewReaction, Profile, ReactionRow,
};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{DataBackend, OutgoingAttachment};
use crate::config::BackendConfig;

/// HTTP client for the backend's table and storage endpoints.
#[derive(Debug, Clone)]
pub struct RestBackend {
    client: Client,
    config: BackendConfig,
}

impl RestBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.config.rest_url(), table)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let bearer = self
            .config
            .access_token
            .as_deref()
            .unwrap_or(&self.config.anon_key);
        self.client
            .request(method, url)
            .header("apikey", &self.config.anon_key)
            .header("Authorization", format!("Bearer {bearer}"))
    }

    /// Send a request and return the body of a successful response.
    async fn send(&self, rb: RequestBuilder) -> Result<(reqwest::header::HeaderMap, String), BackendError> {
        let resp = rb.send().await.map_err(|e| BackendError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();
        let headers = resp.headers().clone();

        let text = resp
            .text()
            .await
            .map_err(|e| BackendError::Network(format!("failed to read body: {e}")))?;

        if !is_success {
            return Err(BackendError::Http { status, body: text });
        }
        Ok((headers, text))
    }

    async fn get_rows<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, BackendError> {
        let rb = self.request(Method::GET, &self.table_url(table)).query(query);
        let (_, text) = self.send(rb).await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write with `Prefer: return=representation` and decode the affected rows.
    async fn write_rows<TReq: Serialize + ?Sized, TRes: DeserializeOwned>(
        &self,
        method: Method,
        table: &str,
        query: &[(&str, String)],
        body: &TReq,
    ) -> Result<Vec<TRes>, BackendError> {
        let body_bytes = serde_json::to_vec(body)?;
        let rb = self
            .request(method, &self.table_url(table))
            .query(query)
            .header("Content-Type", "application/json")
            .header("Prefer", "return=representation")
            .body(body_bytes);
        let (_, text) = self.send(rb).await?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&text)?)
    }
}

fn timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// `in.(...)` filter value with each id quoted.
fn in_list(ids: &[String]) -> String {
    let quoted: Vec<String> = ids
        .iter()
        .map(|id| format!("\"{}\"", id.replace('"', "")))
        .collect();
    format!("in.({})", quoted.join(","))
}

/// Total from a `Content-Range: 0-0/42` (or `*/0`) header.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

#[async_trait]
impl DataBackend for RestBackend {
    async fn fetch_messages_page(
        &self,
        conversation_id: &str,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<MessageRow>, BackendError> {
        let mut query = vec![
            ("select", "*".to_string()),
            ("conversation_id", format!("eq.{conversation_id}")),
            ("order", "created_at.desc".to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(cursor) = before {
            query.push(("created_at", format!("lt.{}", timestamp(cursor))));
        }
        self.get_rows("messages", &query).await
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<MessageRow, BackendError> {
        let rows: Vec<MessageRow> = self
            .write_rows(Method::POST, "messages", &[], message)
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| BackendError::NotFound("inserted message row".to_string()))
    }

    async fn mark_conversation_read(
        &self,
        conversation_id: &str,
        reader_id: &str,
    ) -> Result<Vec<MessageRow>, BackendError> {
        let query = [
            ("conversation_id", format!("eq.{conversation_id}")),
            ("sender_id", format!("neq.{reader_id}")),
            ("read_at", "is.null".to_string()),
        ];
        let body = serde_json::json!({ "read_at": timestamp(Utc::now()) });
        self.write_rows(Method::PATCH, "messages", &query, &body).await
    }

    async fn count_unread(&self, user_id: &str) -> Result<u64, BackendError> {
        let rb = self
            .request(Method::GET, &self.table_url("messages"))
            .query(&[
                ("select", "id".to_string()),
                ("read_at", "is.null".to_string()),
                ("sender_id", format!("neq.{user_id}")),
            ])
            .header("Prefer", "count=exact")
            .header("Range-Unit", "items")
            .header("Range", "0-0");
        let (headers, _) = self.send(rb).await?;
        headers
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| BackendError::Deserialize("missing Content-Range total".to_string()))
    }

    async fn fetch_reactions(&self, message_ids: &[String]) -> Result<Vec<ReactionRow>, BackendError> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = [
            ("select", "*".to_string()),
            ("message_id", in_list(message_ids)),
            ("order", "created_at.asc".to_string()),
        ];
        self.get_rows("message_reactions", &query).await
    }

    async fn add_reaction(&self, reaction: &NewReaction) -> Result<ReactionRow, BackendError> {
        let rows: Vec<ReactionRow> = self
            .write_rows(Method::POST, "message_reactions", &[], reaction)
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| BackendError::NotFound("inserted reaction row".to_string()))
    }

    async fn remove_reaction(&self, reaction_id: &str) -> Result<(), BackendError> {
        let rb = self
            .request(Method::DELETE, &self.table_url("message_reactions"))
            .query(&[("id", format!("eq.{reaction_id}"))]);
        self.send(rb).await.map(|_| ())
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<Profile, BackendError> {
        let query = [
            ("select", "id,full_name,avatar_url".to_string()),
            ("id", format!("eq.{user_id}")),
            ("limit", "1".to_string()),
        ];
        let rows: Vec<Profile> = self.get_rows("profiles", &query).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| BackendError::NotFound(format!("profile {user_id}")))
    }

    async fn upload_attachment(
        &self,
        conversation_id: &str,
        attachment: &OutgoingAttachment,
    ) -> Result<Attachment, BackendError> {
        let object_path = format!(
            "{}/{}-{}",
            urlencoding::encode(conversation_id),
            uuid::Uuid::new_v4(),
            urlencoding::encode(&attachment.name)
        );
        let storage = self.config.storage_url();
        let bucket = &self.config.attachment_bucket;
        let upload_url = format!("{storage}/object/{bucket}/{object_path}");

        let rb = self
            .request(Method::POST, &upload_url)
            .header("Content-Type", &attachment.mime)
            .header("x-upsert", "false")
            .body(attachment.bytes.clone());
        self.send(rb).await?;

        Ok(Attachment {
            url: format!("{storage}/object/public/{bucket}/{object_path}"),
            mime: attachment.mime.clone(),
            name: attachment.name.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_totals() {
        assert_eq!(parse_content_range_total("0-0/42"), Some(42));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("0-0/*"), None);
    }

    #[test]
    fn in_list_quotes_ids() {
        assert_eq!(in_list(&["a".into(), "b,c".into()]), "in.(\"a\",\"b,c\")");
    }

    #[test]
    fn cursor_timestamp_is_utc_micros() {
        let ts = DateTime::parse_from_rfc3339("2024-05-01T12:00:00.5+02:00")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(timestamp(ts), "2024-05-01T10:00:00.500000Z");
    }
}
