use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{cookie::Jar, Client};
use serde_json::Value;
use shared::{
    domain::{Message, MessageId, UserId},
    protocol::{message_from_value, AckResponse, AuthResponse, Credentials, UserSummary},
};
use tracing::{debug, warn};
use url::Url;

use crate::error::CollaboratorError;

/// Account, directory, history and deletion endpoints of the messaging server.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn profile(&self) -> Result<UserSummary, CollaboratorError>;
    async fn login(&self, credentials: &Credentials) -> Result<UserSummary, CollaboratorError>;
    async fn register(&self, credentials: &Credentials)
        -> Result<UserSummary, CollaboratorError>;
    async fn logout(&self) -> Result<(), CollaboratorError>;
    async fn people(&self) -> Result<Vec<UserSummary>, CollaboratorError>;
    async fn messages(&self, contact: &UserId) -> Result<Vec<Message>, CollaboratorError>;
    async fn delete_message(&self, message_id: &MessageId) -> Result<(), CollaboratorError>;
    async fn delete_user(&self, user_id: &UserId) -> Result<(), CollaboratorError>;
}

pub struct HttpChatBackend {
    http: Client,
    base_url: Url,
    cookies: Arc<Jar>,
}

impl HttpChatBackend {
    pub fn new(base_url: Url) -> Result<Self, CollaboratorError> {
        let cookies = Arc::new(Jar::default());
        let http = Client::builder()
            .cookie_provider(Arc::clone(&cookies))
            .build()?;
        Ok(Self {
            http,
            base_url,
            cookies,
        })
    }

    /// Jar holding the session cookie; shared with the realtime transport.
    pub fn cookie_jar(&self) -> Arc<Jar> {
        Arc::clone(&self.cookies)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    async fn authenticate(
        &self,
        path: &str,
        credentials: &Credentials,
    ) -> Result<UserSummary, CollaboratorError> {
        let body: AuthResponse = self
            .http
            .post(self.endpoint(path))
            .json(credentials)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(user_id = %body.user.id, path, "rest: authenticated");
        Ok(body.user)
    }

    async fn delete(&self, path: String) -> Result<(), CollaboratorError> {
        let ack: AckResponse = self
            .http
            .delete(self.endpoint(&path))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if !ack.success {
            let reason = ack.message.unwrap_or_else(|| "request refused".to_string());
            warn!(path = %path, "rest: server refused deletion: {reason}");
            return Err(CollaboratorError::Rejected(reason));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn profile(&self) -> Result<UserSummary, CollaboratorError> {
        Ok(self
            .http
            .get(self.endpoint("/profile"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn login(&self, credentials: &Credentials) -> Result<UserSummary, CollaboratorError> {
        self.authenticate("/login", credentials).await
    }

    async fn register(
        &self,
        credentials: &Credentials,
    ) -> Result<UserSummary, CollaboratorError> {
        self.authenticate("/register", credentials).await
    }

    async fn logout(&self) -> Result<(), CollaboratorError> {
        self.http
            .post(self.endpoint("/logout"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn people(&self) -> Result<Vec<UserSummary>, CollaboratorError> {
        Ok(self
            .http
            .get(self.endpoint("/people"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn messages(&self, contact: &UserId) -> Result<Vec<Message>, CollaboratorError> {
        let values: Vec<Value> = self
            .http
            .get(self.endpoint(&format!("/messages/{contact}")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let messages = values
            .into_iter()
            .map(message_from_value)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(contact_id = %contact, count = messages.len(), "rest: history fetched");
        Ok(messages)
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<(), CollaboratorError> {
        self.delete(format!("/messages/{message_id}")).await
    }

    async fn delete_user(&self, user_id: &UserId) -> Result<(), CollaboratorError> {
        self.delete(format!("/users/{user_id}")).await
    }
}

pub struct MissingChatBackend;

#[async_trait]
impl ChatBackend for MissingChatBackend {
    async fn profile(&self) -> Result<UserSummary, CollaboratorError> {
        Err(CollaboratorError::Unavailable("chat backend"))
    }

    async fn login(&self, _credentials: &Credentials) -> Result<UserSummary, CollaboratorError> {
        Err(CollaboratorError::Unavailable("chat backend"))
    }

    async fn register(
        &self,
        _credentials: &Credentials,
    ) -> Result<UserSummary, CollaboratorError> {
        Err(CollaboratorError::Unavailable("chat backend"))
    }

    async fn logout(&self) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::Unavailable("chat backend"))
    }

    async fn people(&self) -> Result<Vec<UserSummary>, CollaboratorError> {
        Err(CollaboratorError::Unavailable("chat backend"))
    }

    async fn messages(&self, _contact: &UserId) -> Result<Vec<Message>, CollaboratorError> {
        Err(CollaboratorError::Unavailable("chat backend"))
    }

    async fn delete_message(&self, _message_id: &MessageId) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::Unavailable("chat backend"))
    }

    async fn delete_user(&self, _user_id: &UserId) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::Unavailable("chat backend"))
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
