use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::{with_retry, ChatBackend};
use crate::chat_types::{ChatMessage, ChatRole};
use crate::config::RetryConfig;
use crate::db::SessionStore;
use crate::errors::AppError;
use crate::models::{AssistantOutcome, Session, SessionKey};
use crate::session::fingerprint::{fingerprint, AssistantFeatures};

/// A resolved conversation for the duration of one request.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session: Session,
    pub is_new: bool,
}

impl SessionHandle {
    pub fn is_first_exchange(&self) -> bool {
        self.session.is_first_exchange()
    }
}

/// Rebuilds backend conversation state from a full client history.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    backend: Arc<dyn ChatBackend>,
    retry: RetryConfig,
    ttl: chrono::Duration,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        backend: Arc<dyn ChatBackend>,
        retry: RetryConfig,
        ttl: chrono::Duration,
    ) -> Self {
        Self { store, backend, retry, ttl }
    }

    /// A history without any assistant turn starts a new conversation;
    /// otherwise the conversation is found by fingerprint or the request
    /// fails with [`AppError::SessionNotFound`].
    pub async fn resolve(&self, history: &[ChatMessage]) -> Result<SessionHandle, AppError> {
        let first_user_text = history
            .iter()
            .find(|m| m.role == ChatRole::User)
            .map(ChatMessage::flatten_text)
            .unwrap_or_default();

        let Some(first_assistant) = history.iter().find(|m| m.role == ChatRole::Assistant) else {
            return self.create(first_user_text).await;
        };

        let features = AssistantFeatures::new(
            &first_assistant.flatten_text(),
            first_assistant.tool_call_names(),
        );
        let fp = fingerprint(&first_user_text, &features);

        let session = self
            .store
            .get(&SessionKey::Fingerprint(fp.clone()))
            .await?
            .ok_or_else(|| {
                info!(fingerprint = %fp, "No session matches continuation history");
                AppError::SessionNotFound { fingerprint: fp }
            })?;

        self.store.touch(&session.session_id).await?;
        debug!(
            session_id = %session.session_id,
            chat_id = %session.backend_chat_id,
            "Resumed session"
        );
        Ok(SessionHandle { session, is_new: false })
    }

    async fn create(&self, first_user_text: String) -> Result<SessionHandle, AppError> {
        let chat_id = with_retry(&self.retry, "create_chat", |_| self.backend.create_chat()).await?;
        let session = Session::new(chat_id, first_user_text, self.ttl);
        self.store.put(&session).await?;
        info!(
            session_id = %session.session_id,
            chat_id = %session.backend_chat_id,
            "Created session"
        );
        Ok(SessionHandle { session, is_new: true })
    }

    /// Records a completed exchange: stores the backend's new parent reference
    /// and, after the first exchange only, the conversation fingerprint.
    pub async fn commit(
        &self,
        handle: &SessionHandle,
        new_parent_ref: &str,
        assistant: &AssistantOutcome,
    ) -> Result<Session, AppError> {
        let mut session = handle.session.clone();
        let is_first_exchange = session.is_first_exchange();

        session.current_parent_ref = Some(new_parent_ref.to_string());
        session.message_count += 2;
        session.touch(self.ttl);

        if is_first_exchange && session.conversation_fingerprint.is_none() {
            let features = AssistantFeatures::new(
                assistant.content.as_deref().unwrap_or_default(),
                assistant.tool_names(),
            );
            session.conversation_fingerprint =
                Some(fingerprint(&session.first_user_message_text, &features));
        }

        self.store.put(&session).await?;
        debug!(
            session_id = %session.session_id,
            parent_ref = new_parent_ref,
            first_exchange = is_first_exchange,
            "Committed exchange"
        );
        Ok(session)
    }
}
