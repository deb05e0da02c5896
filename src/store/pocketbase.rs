use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{RequestBuilder, Response, StatusCode, multipart};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use super::realtime::{RealtimeEndpoint, run_subscription};
use super::types::{ApiErrorBody, MessageRecord, RecordList};
use super::{
    MessagePage, MessageQuery, MessageStore, Result, SortOrder, StoreError, StoreSubscription,
};
use crate::talk::messages::{Message, MessageKind};
use crate::talk::uploads::AttachmentFile;
use crate::talk::utils::format_record_datetime;
use crate::types::RetryInfo;

const MESSAGES_PATH: &str = "/api/collections/messages/records";
const EXPAND: &str = "sender";
const SUBSCRIPTION_BUFFER: usize = 100;

/// Client for the PocketBase records API backing the `messages` collection
#[derive(Clone, Debug)]
pub struct PocketBaseStore {
    client: reqwest::Client,
    /// Base URL of the server, without a trailing slash
    base_url: String,
    /// Session token sent as the `Authorization` header
    auth_token: Option<String>,
    /// Id of the signed-in user, stamped as `sender` on created records
    user_id: Option<String>,
    realtime_retry: RetryInfo,
}

impl PocketBaseStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: None,
            user_id: None,
            realtime_retry: RetryInfo::with_limits(20, 1000, 30_000),
        }
    }

    /// Attaches an existing session; authentication itself happens elsewhere.
    pub fn with_auth(mut self, auth_token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.auth_token = Some(auth_token.into());
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_realtime_retry(mut self, retry: RetryInfo) -> Self {
        self.realtime_retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.header(AUTHORIZATION, token),
            None => request,
        }
    }

    fn sender_id(&self) -> &str {
        self.user_id.as_deref().unwrap_or_default()
    }

    async fn fetch_page(
        &self,
        filter: String,
        sort: &str,
        page: u32,
        per_page: u32,
    ) -> Result<MessagePage> {
        let request = self.client.get(self.url(MESSAGES_PATH)).query(&[
            ("page", page.to_string()),
            ("perPage", per_page.to_string()),
            ("filter", filter),
            ("sort", sort.to_string()),
            ("expand", EXPAND.to_string()),
        ]);
        let response = self.authorized(request).send().await?;
        let list: RecordList<MessageRecord> = decode(response, "messages").await?;

        let items = list
            .items
            .into_iter()
            .map(Message::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(MessagePage {
            items,
            page: list.page,
            per_page: list.per_page,
            total_items: list.total_items,
            total_pages: list.total_pages,
        })
    }

    async fn create_record(&self, request: RequestBuilder) -> Result<Message> {
        let response = self.authorized(request).send().await?;
        let record: MessageRecord = decode(response, "conversation").await?;
        Message::try_from(record)
    }
}

#[async_trait]
impl MessageStore for PocketBaseStore {
    async fn create_message(&self, conversation_id: &str, content: &str) -> Result<Message> {
        let request = self
            .client
            .post(self.url(MESSAGES_PATH))
            .query(&[("expand", EXPAND)])
            .json(&serde_json::json!({
                "chat": conversation_id,
                "sender": self.sender_id(),
                "type": MessageKind::Text.as_str(),
                "content": content,
            }));
        self.create_record(request).await
    }

    async fn create_message_with_attachment(
        &self,
        conversation_id: &str,
        kind: MessageKind,
        file: &AttachmentFile,
        caption: Option<&str>,
    ) -> Result<Message> {
        let bytes = tokio::fs::read(&file.path).await?;
        let part = multipart::Part::bytes(bytes)
            .file_name(file.filename.clone())
            .mime_str(&file.mime_type)?;

        let form = multipart::Form::new()
            .text("chat", conversation_id.to_string())
            .text("sender", self.sender_id().to_string())
            .text("type", kind.as_str())
            .text(
                "content",
                caption.map_or_else(|| file.filename.clone(), str::to_string),
            )
            .part("file", part);

        let request = self
            .client
            .post(self.url(MESSAGES_PATH))
            .query(&[("expand", EXPAND)])
            .multipart(form);
        self.create_record(request).await
    }

    async fn list_messages(&self, query: &MessageQuery) -> Result<MessagePage> {
        let sort = match query.sort {
            SortOrder::NewestFirst => "-created,-id",
            SortOrder::OldestFirst => "created,id",
        };
        self.fetch_page(history_filter(query), sort, query.page, query.per_page)
            .await
    }

    async fn get_message(&self, message_id: &str) -> Result<Message> {
        let request = self
            .client
            .get(self.url(&format!("{}/{}", MESSAGES_PATH, message_id)))
            .query(&[("expand", EXPAND)]);
        let response = self.authorized(request).send().await?;
        let record: MessageRecord = decode(response, &format!("message {}", message_id)).await?;
        Message::try_from(record)
    }

    async fn subscribe(&self, conversation_id: &str) -> Result<StoreSubscription> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let endpoint = RealtimeEndpoint {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            auth_token: self.auth_token.clone(),
        };
        let task = tokio::spawn(run_subscription(
            endpoint,
            conversation_id.to_string(),
            sender,
            self.realtime_retry.clone(),
        ));
        Ok(StoreSubscription::new(receiver, Some(task)))
    }

    async fn search(
        &self,
        conversation_id: &str,
        query: &str,
        per_page: u32,
    ) -> Result<MessagePage> {
        let filter = format!(
            "chat = {} && content ~ {}",
            quote(conversation_id),
            quote(query)
        );
        self.fetch_page(filter, "-created,-id", 1, per_page).await
    }

    async fn health_check(&self) -> Result<()> {
        let response = self.client.get(self.url("/api/health")).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(StoreError::Status {
                status: response.status().as_u16(),
                message: "health check failed".to_string(),
            })
        }
    }
}

/// Quotes a value for use inside a filter expression.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn history_filter(query: &MessageQuery) -> String {
    let mut clauses = vec![format!("chat = {}", quote(&query.conversation_id))];
    if let Some(before) = &query.before {
        clauses.push(format!(
            "created < {}",
            quote(&format_record_datetime(before))
        ));
    }
    if let Some(after) = &query.at_or_after {
        clauses.push(format!(
            "created >= {}",
            quote(&format_record_datetime(after))
        ));
    }
    clauses.join(" && ")
}

async fn decode<T: DeserializeOwned>(response: Response, resource: &str) -> Result<T> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(StoreError::not_found(resource));
    }
    if !status.is_success() {
        let body: ApiErrorBody = response.json().await.unwrap_or_default();
        return Err(StoreError::Status {
            status: status.as_u16(),
            message: body.message,
        });
    }

    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mockito::{Matcher, Server, ServerGuard};
    use serde_json::json;
    use std::io::Write;

    async fn setup_mock_server() -> (ServerGuard, PocketBaseStore) {
        let server = Server::new_async().await;
        let store = PocketBaseStore::new(&server.url()).with_auth("token123", "user1");
        (server, store)
    }

    fn record(id: &str, chat: &str, created: &str) -> serde_json::Value {
        json!({
            "id": id,
            "chat": chat,
            "sender": "user1",
            "type": "text",
            "content": format!("content {id}"),
            "file": "",
            "reactions": null,
            "created": created,
            "updated": created,
            "expand": {"sender": {"id": "user1", "name": "Ann"}}
        })
    }

    #[test]
    fn filter_values_are_quoted_and_escaped() {
        assert_eq!(quote("it's"), "'it\\'s'");

        let t = Utc.with_ymd_and_hms(2025, 8, 16, 11, 34, 29).unwrap();
        let query = MessageQuery::new("chat1", 50).before(t);
        assert_eq!(
            history_filter(&query),
            "chat = 'chat1' && created < '2025-08-16 11:34:29.000Z'"
        );
    }

    #[tokio::test]
    async fn test_list_messages_sends_paging_filter_and_sort() {
        let (mut server, store) = setup_mock_server().await;

        let m = server
            .mock("GET", MESSAGES_PATH)
            .match_header("authorization", "token123")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("page".into(), "2".into()),
                Matcher::UrlEncoded("perPage".into(), "50".into()),
                Matcher::UrlEncoded("filter".into(), "chat = 'chat1'".into()),
                Matcher::UrlEncoded("sort".into(), "-created,-id".into()),
                Matcher::UrlEncoded("expand".into(), "sender".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "page": 2,
                    "perPage": 50,
                    "totalItems": 120,
                    "totalPages": 3,
                    "items": [
                        record("b", "chat1", "2025-08-16 11:00:02.000Z"),
                        record("a", "chat1", "2025-08-16 11:00:01.000Z")
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let page = store
            .list_messages(&MessageQuery::new("chat1", 50).page(2))
            .await
            .unwrap();

        m.assert_async().await;
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.items[0].id, "b");
        assert!(page.items[0].sender_profile.is_some());
    }

    #[tokio::test]
    async fn test_get_message_not_found() {
        let (mut server, store) = setup_mock_server().await;

        let _m = server
            .mock("GET", format!("{}/gone", MESSAGES_PATH).as_str())
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body(json!({"status": 404, "message": "The requested resource wasn't found."}).to_string())
            .create_async()
            .await;

        let err = store.get_message("gone").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_create_message_posts_text_record() {
        let (mut server, store) = setup_mock_server().await;

        let m = server
            .mock("POST", MESSAGES_PATH)
            .match_query(Matcher::UrlEncoded("expand".into(), "sender".into()))
            .match_header("authorization", "token123")
            .match_body(Matcher::PartialJson(json!({
                "chat": "chat1",
                "sender": "user1",
                "type": "text",
                "content": "hello"
            })))
            .with_status(200)
            .with_body(record("new1", "chat1", "2025-08-16 11:00:00.000Z").to_string())
            .create_async()
            .await;

        let message = store.create_message("chat1", "hello").await.unwrap();

        m.assert_async().await;
        assert_eq!(message.id, "new1");
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        let (mut server, store) = setup_mock_server().await;

        let _m = server
            .mock("POST", MESSAGES_PATH)
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body(json!({"message": "unavailable"}).to_string())
            .create_async()
            .await;

        let err = store.create_message("chat1", "hello").await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("unavailable"));
    }

    #[tokio::test]
    async fn test_create_message_with_attachment_uses_multipart() {
        let (mut server, store) = setup_mock_server().await;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not really a png").unwrap();
        let attachment = AttachmentFile {
            filename: "photo.png".to_string(),
            mime_type: "image/png".to_string(),
            path: file.path().to_path_buf(),
            size: 16,
        };

        let mut response = record("img1", "chat1", "2025-08-16 11:00:00.000Z");
        response["type"] = json!("image");
        response["file"] = json!("photo_x1.png");

        let m = server
            .mock("POST", MESSAGES_PATH)
            .match_query(Matcher::Any)
            .match_header("content-type", Matcher::Regex("multipart/form-data".into()))
            .match_body(Matcher::Regex("photo.png".into()))
            .with_status(200)
            .with_body(response.to_string())
            .create_async()
            .await;

        let message = store
            .create_message_with_attachment("chat1", MessageKind::Image, &attachment, None)
            .await
            .unwrap();

        m.assert_async().await;
        assert_eq!(message.kind, MessageKind::Image);
        assert_eq!(message.attachment.as_deref(), Some("photo_x1.png"));
    }

    #[tokio::test]
    async fn test_search_filters_by_content() {
        let (mut server, store) = setup_mock_server().await;

        let m = server
            .mock("GET", MESSAGES_PATH)
            .match_query(Matcher::UrlEncoded(
                "filter".into(),
                "chat = 'chat1' && content ~ 'lunch'".into(),
            ))
            .with_status(200)
            .with_body(
                json!({"page": 1, "perPage": 20, "totalItems": 0, "totalPages": 0, "items": []})
                    .to_string(),
            )
            .create_async()
            .await;

        let page = store.search("chat1", "lunch", 20).await.unwrap();

        m.assert_async().await;
        assert!(page.items.is_empty());
    }

    #[tokio::test]
    async fn test_health_check() {
        let (mut server, store) = setup_mock_server().await;

        let _m = server
            .mock("GET", "/api/health")
            .with_status(200)
            .with_body(json!({"code": 200, "message": "API is healthy."}).to_string())
            .create_async()
            .await;

        assert!(store.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_health_check_against_dead_server_fails() {
        let store = PocketBaseStore::new("http://127.0.0.1:9");
        let err = store.health_check().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_subscribe_delivers_only_matching_conversation() {
        let (mut server, store) = setup_mock_server().await;

        let other = json!({"action": "create", "record": record("x", "chat2", "2025-08-16 11:00:00.000Z")});
        let mine = json!({"action": "create", "record": record("y", "chat1", "2025-08-16 11:00:01.000Z")});
        let body = format!(
            "id:client1\nevent:PB_CONNECT\ndata:{{\"clientId\":\"client1\"}}\n\n\
             event:messages/*\ndata:{}\n\n\
             event:messages/*\ndata:{}\n\n",
            other, mine
        );

        let _stream = server
            .mock("GET", "/api/realtime")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;
        let subscribe = server
            .mock("POST", "/api/realtime")
            .match_header("authorization", "token123")
            .match_body(Matcher::PartialJson(json!({
                "clientId": "client1",
                "subscriptions": ["messages/*"]
            })))
            .with_status(204)
            .create_async()
            .await;

        let mut subscription = store.subscribe("chat1").await.unwrap();
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), subscription.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(event.action, "create");
        assert_eq!(event.conversation_id(), Some("chat1"));
        subscribe.assert_async().await;
    }
}
