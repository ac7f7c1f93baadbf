//! Process-wide session registry.
//!
//! Injected into the model adapter at construction time so tests can run
//! against an isolated registry per case.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::BridgeConfig;
use crate::errors::{Error, Result};
use crate::session::{SessionKey, WorkflowSession};
use crate::store::WorkflowIdStore;
use crate::token::TokenService;
use crate::{DEFAULT_HTTP_CONNECT_TIMEOUT, DEFAULT_HTTP_REQUEST_TIMEOUT};

pub struct SessionRegistry {
    config: Arc<BridgeConfig>,
    http: reqwest::Client,
    tokens: Arc<TokenService>,
    store: Arc<dyn WorkflowIdStore>,
    sessions: Mutex<HashMap<SessionKey, Arc<WorkflowSession>>>,
}

impl SessionRegistry {
    pub fn new(config: BridgeConfig, store: Arc<dyn WorkflowIdStore>) -> Result<Self> {
        config.validate()?;
        let http = match config.http_client.clone() {
            Some(client) => client,
            None => default_http_client()?,
        };
        let tokens = Arc::new(TokenService::new(
            http.clone(),
            &config.normalized_instance_url(),
            config.workflow_definition.clone(),
            config.token_refresh_margin,
        ));
        Ok(Self {
            config: Arc::new(config),
            http,
            tokens,
            store,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Arc<BridgeConfig> {
        &self.config
    }

    /// Returns the session for the key, creating it lazily. A persisted
    /// workflow ID marks the new session as resumed.
    pub fn resolve(&self, model_id: &str, host_session_id: &str) -> Arc<WorkflowSession> {
        let key = SessionKey::new(
            self.config.normalized_instance_url(),
            model_id,
            host_session_id,
        );
        let mut sessions = self.sessions.lock().expect("registry lock poisoned");
        sessions
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(session = %key.host_session_id, model = %key.model_id, "creating session");
                Arc::new(WorkflowSession::new(
                    key.clone(),
                    self.config.clone(),
                    self.http.clone(),
                    self.tokens.clone(),
                    self.store.clone(),
                ))
            })
            .clone()
    }

    /// Removes the session and tears down its connection. The persisted
    /// workflow ID survives for a later resume.
    pub async fn dispose(&self, model_id: &str, host_session_id: &str) {
        let key = SessionKey::new(
            self.config.normalized_instance_url(),
            model_id,
            host_session_id,
        );
        let removed = {
            let mut sessions = self.sessions.lock().expect("registry lock poisoned");
            sessions.remove(&key)
        };
        if let Some(session) = removed {
            debug!(session = %key.host_session_id, "disposing session");
            session.close_connection().await;
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.sessions.lock().expect("registry lock poisoned").len()
    }
}

fn default_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(DEFAULT_HTTP_CONNECT_TIMEOUT)
        .timeout(DEFAULT_HTTP_REQUEST_TIMEOUT)
        .build()
        .map_err(|err| Error::Config(format!("failed to build http client: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryWorkflowIdStore;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(
            BridgeConfig::new("https://gitlab.example.com"),
            Arc::new(MemoryWorkflowIdStore::new()),
        )
        .unwrap()
    }

    #[test]
    fn resolve_reuses_sessions_per_key() {
        let registry = registry();
        let a = registry.resolve("duo-agent", "s1");
        let b = registry.resolve("duo-agent", "s1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        registry.resolve("duo-agent", "s2");
        registry.resolve("other-model", "s1");
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn dispose_removes_the_entry() {
        let registry = registry();
        registry.resolve("duo-agent", "s1");
        registry.dispose("duo-agent", "s1").await;
        assert_eq!(registry.len(), 0);
        // Disposing again is a no-op.
        registry.dispose("duo-agent", "s1").await;
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = SessionRegistry::new(
            BridgeConfig::new("not a url"),
            Arc::new(MemoryWorkflowIdStore::new()),
        );
        assert!(result.is_err());
    }
}
