use std::future::Future;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::common::{
    Attachment, ConversationDetails, ConversationId, ConversationSummary, OutgoingMessage,
    ServerMessage, UserId,
};
use crate::error::ApiError;

use super::endpoints::Endpoints;
use super::session::{Session, SessionTokens};

/// The REST side of the backend as the sync layer consumes it.
pub trait ChatApi: Send + Sync + 'static {
    fn conversation(
        &self,
        id: ConversationId,
    ) -> impl Future<Output = Result<ConversationDetails, ApiError>> + Send;

    fn messages(
        &self,
        id: ConversationId,
    ) -> impl Future<Output = Result<Vec<ServerMessage>, ApiError>> + Send;

    fn conversations(&self)
    -> impl Future<Output = Result<Vec<ConversationSummary>, ApiError>> + Send;

    /// Fallback send path used when the socket is down.
    fn send_message(
        &self,
        message: &OutgoingMessage,
    ) -> impl Future<Output = Result<ServerMessage, ApiError>> + Send;

    fn mark_read(&self, id: ConversationId) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn clear_conversation(
        &self,
        id: ConversationId,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn delete_conversation(
        &self,
        id: ConversationId,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Upload a file and return the URL the server stored it under.
    fn upload(
        &self,
        conversation_id: ConversationId,
        attachment: Attachment,
    ) -> impl Future<Output = Result<String, ApiError>> + Send;

    fn find_conversation_with(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Option<ConversationId>, ApiError>> + Send;

    fn create_conversation(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<ConversationDetails, ApiError>> + Send;
}

/// List endpoints answer either a bare array or a paginated envelope.
#[derive(Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Plain(Vec<T>),
    Paged { results: Vec<T> },
}

impl<T> Listing<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::Plain(items) | Self::Paged { results: items } => items,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    refresh: Option<String>,
    #[serde(default)]
    user: Option<UserRef>,
    #[serde(default)]
    id: Option<UserId>,
}

#[derive(Debug, Deserialize)]
struct UserRef {
    id: UserId,
}

impl TokenResponse {
    fn access_token(&self) -> Option<String> {
        self.access.clone().or_else(|| self.token.clone())
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct UploadResponse {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    attachment_url: Option<String>,
    #[serde(default)]
    file_url: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
}

impl UploadResponse {
    pub(crate) fn into_url(self) -> Option<String> {
        self.url
            .or(self.attachment_url)
            .or(self.file_url)
            .or(self.image_url)
            .filter(|url| !url.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct ExistsResponse {
    #[serde(default)]
    conversation_id: Option<ConversationId>,
}

/// `reqwest`-backed client for the backend's REST API.
///
/// Every request carries the session's bearer token. A 401 triggers one
/// token refresh and a single retry; if the refresh fails the call ends
/// with [`ApiError::SessionExpired`].
#[derive(Clone)]
pub struct HttpApi {
    client: Client,
    endpoints: Endpoints,
    session: Session,
}

impl HttpApi {
    pub fn new(endpoints: Endpoints, session: Session) -> Self {
        Self {
            client: Client::new(),
            endpoints,
            session,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<SessionTokens, ApiError> {
        let response = self
            .client
            .post(self.endpoints.login())
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        let body: TokenResponse = read_json(response).await?;
        let access = body.access_token().ok_or(ApiError::MissingToken)?;
        let tokens = SessionTokens {
            access,
            refresh: body.refresh,
            user_id: body.user.map(|u| u.id).or(body.id),
        };
        self.session.replace(tokens.clone()).await;
        log::info!("Logged in as user {:?}", tokens.user_id);
        Ok(tokens)
    }

    /// Best-effort server logout; the local session is always dropped.
    pub async fn logout(&self) {
        let result = self
            .execute(|client| client.post(self.endpoints.logout()))
            .await;
        if let Err(err) = result {
            log::warn!("Logout request failed: {err}");
        }
        self.session.clear().await;
    }

    /// Exchange the refresh token for a new access token.
    pub async fn refresh(&self) -> Result<String, ApiError> {
        let body = match self.session.refresh_token().await {
            Some(refresh) => json!({ "refresh": refresh }),
            None => json!({}),
        };
        let response = self
            .client
            .post(self.endpoints.refresh_token())
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            log::warn!("Token refresh rejected with status {}", response.status());
            return Err(ApiError::SessionExpired);
        }
        let body: TokenResponse = response.json().await?;
        let access = body.access_token().ok_or(ApiError::MissingToken)?;
        self.session.update_access(access.clone()).await;
        log::info!("Access token refreshed");
        Ok(access)
    }

    /// Send a request built by `build`, refreshing the token once on 401.
    async fn execute<F>(&self, build: F) -> Result<Response, ApiError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let token = self.session.access_token().await;
        let response = with_bearer(build(&self.client), token.as_deref())
            .send()
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED || token.is_none() {
            return Ok(response);
        }

        log::info!("Request unauthorized; refreshing token");
        let fresh = match self.refresh().await {
            Ok(fresh) => fresh,
            Err(err) => {
                log::warn!("Token refresh failed: {err}");
                return Err(ApiError::SessionExpired);
            }
        };

        let retried = with_bearer(build(&self.client), Some(&fresh)).send().await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            return Err(ApiError::SessionExpired);
        }
        Ok(retried)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, ApiError> {
        let response = self.execute(|client| client.get(&url)).await?;
        read_json(response).await
    }

    async fn post_json<T: DeserializeOwned>(&self, url: String, body: Value) -> Result<T, ApiError> {
        let response = self
            .execute(|client| client.post(&url).json(&body))
            .await?;
        read_json(response).await
    }

    async fn send_unit(&self, build: impl Fn(&Client) -> RequestBuilder) -> Result<(), ApiError> {
        let response = self.execute(build).await?;
        ensure_success(response).await.map(|_| ())
    }
}

impl ChatApi for HttpApi {
    async fn conversation(&self, id: ConversationId) -> Result<ConversationDetails, ApiError> {
        self.get_json(self.endpoints.conversation(id)).await
    }

    async fn messages(&self, id: ConversationId) -> Result<Vec<ServerMessage>, ApiError> {
        let listing: Listing<ServerMessage> = self
            .get_json(self.endpoints.conversation_messages(id))
            .await?;
        Ok(listing.into_vec())
    }

    async fn conversations(&self) -> Result<Vec<ConversationSummary>, ApiError> {
        let listing: Listing<ConversationSummary> =
            self.get_json(self.endpoints.conversations()).await?;
        Ok(listing.into_vec())
    }

    async fn send_message(&self, message: &OutgoingMessage) -> Result<ServerMessage, ApiError> {
        self.post_json(self.endpoints.messages(), message.to_payload())
            .await
    }

    async fn mark_read(&self, id: ConversationId) -> Result<(), ApiError> {
        let url = self.endpoints.mark_read(id);
        self.send_unit(|client| client.post(&url)).await
    }

    async fn clear_conversation(&self, id: ConversationId) -> Result<(), ApiError> {
        let url = self.endpoints.clear(id);
        self.send_unit(|client| client.post(&url)).await
    }

    async fn delete_conversation(&self, id: ConversationId) -> Result<(), ApiError> {
        let url = self.endpoints.conversation(id);
        self.send_unit(|client| client.delete(&url)).await
    }

    async fn upload(
        &self,
        conversation_id: ConversationId,
        attachment: Attachment,
    ) -> Result<String, ApiError> {
        let url = self.endpoints.upload();
        let response = self
            .execute(|client| {
                client
                    .post(&url)
                    .multipart(upload_form(conversation_id, &attachment))
            })
            .await?;
        let body: UploadResponse = read_json(response).await?;
        body.into_url().ok_or(ApiError::MissingUploadUrl)
    }

    async fn find_conversation_with(
        &self,
        user_id: UserId,
    ) -> Result<Option<ConversationId>, ApiError> {
        let body: ExistsResponse = self.get_json(self.endpoints.exists(user_id)).await?;
        Ok(body.conversation_id)
    }

    async fn create_conversation(&self, user_id: UserId) -> Result<ConversationDetails, ApiError> {
        self.post_json(
            self.endpoints.conversations(),
            json!({ "participant_id": user_id }),
        )
        .await
    }
}

fn with_bearer(builder: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => builder.bearer_auth(token),
        None => builder,
    }
}

fn upload_form(conversation_id: ConversationId, attachment: &Attachment) -> Form {
    let part = Part::bytes(attachment.bytes.clone()).file_name(attachment.file_name.clone());
    let part = match part.mime_str(&attachment.mime_type) {
        Ok(part) => part,
        Err(err) => {
            log::warn!("Invalid MIME type {}: {err}", attachment.mime_type);
            Part::bytes(attachment.bytes.clone()).file_name(attachment.file_name.clone())
        }
    };
    Form::new()
        .part("file", part)
        .text("conversation_id", conversation_id.to_string())
}

async fn ensure_success(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let fallback = format!("HTTP error! status: {}", status.as_u16());
    let message = match response.json::<Value>().await {
        Ok(body) => body
            .get("detail")
            .or_else(|| body.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(fallback),
        Err(_) => fallback,
    };
    Err(ApiError::Status {
        status: status.as_u16(),
        message,
    })
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let response = ensure_success(response).await?;
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_url_prefers_first_known_field() {
        let body: UploadResponse =
            serde_json::from_value(json!({"file_url": "f", "image_url": "i"})).unwrap();
        assert_eq!(body.into_url().as_deref(), Some("f"));

        let empty: UploadResponse = serde_json::from_value(json!({"url": ""})).unwrap();
        assert_eq!(empty.into_url(), None);
    }

    #[test]
    fn listing_accepts_plain_and_paged() {
        let plain: Listing<ExistsResponse> =
            serde_json::from_value(json!([{"conversation_id": 1}])).unwrap();
        assert_eq!(plain.into_vec().len(), 1);

        let paged: Listing<ExistsResponse> =
            serde_json::from_value(json!({"count": 2, "results": [{}, {}]})).unwrap();
        assert_eq!(paged.into_vec().len(), 2);
    }

    #[test]
    fn token_response_reads_access_or_token() {
        let body: TokenResponse =
            serde_json::from_value(json!({"token": "t", "user": {"id": 3}})).unwrap();
        assert_eq!(body.access_token().as_deref(), Some("t"));
        assert_eq!(body.user.map(|u| u.id), Some(3));
    }
}
