//! Process-wide anonymous session state.
//!
//! Upstream tracks a client by its device id and the conversation ids it has
//! handed out. Everything here is shared by all requests and the refresh loop;
//! callers read whatever is current at send time rather than pinning values
//! for the lifetime of a request.

use tokio::sync::RwLock;
use uuid::Uuid;

/// Session token plus the proof token solved against the challenge that came
/// with it. The two are always replaced together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub proof_token: Option<String>,
}

#[derive(Debug)]
struct Identity {
    device_id: String,
    keep_conversation: bool,
}

impl Identity {
    fn fresh() -> Self {
        Self {
            device_id: Uuid::new_v4().to_string(),
            keep_conversation: false,
        }
    }
}

#[derive(Debug)]
pub struct SessionState {
    identity: RwLock<Identity>,
    credentials: RwLock<Option<Credentials>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            identity: RwLock::new(Identity::fresh()),
            credentials: RwLock::new(None),
        }
    }

    /// Start over with a new device id. Conversations opened under the old id
    /// cannot be continued.
    pub async fn renew_identity(&self) -> String {
        let mut identity = self.identity.write().await;
        *identity = Identity::fresh();
        tracing::info!(device_id = %identity.device_id, "renewed device id");
        identity.device_id.clone()
    }

    pub async fn device_id(&self) -> String {
        self.identity.read().await.device_id.clone()
    }

    pub async fn keep_conversation(&self) -> bool {
        self.identity.read().await.keep_conversation
    }

    pub async fn set_keep_conversation(&self, keep: bool) {
        self.identity.write().await.keep_conversation = keep;
    }

    pub async fn credentials(&self) -> Option<Credentials> {
        self.credentials.read().await.clone()
    }

    pub async fn store_credentials(&self, credentials: Credentials) {
        *self.credentials.write().await = Some(credentials);
    }

    pub async fn has_token(&self) -> bool {
        self.credentials.read().await.is_some()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
