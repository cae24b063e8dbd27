//! WeMeet user id to DingTalk union id resolution.
//!
//! WeMeet accounts are provisioned from the DingTalk directory, so a WeMeet
//! user id is also a DingTalk user id. The union id DingTalk's v1.0 APIs need
//! is looked up once and cached in `user_identities`.

use crate::errors::BridgeError;
use crate::repositories::UserIdentityStore;
use crate::services::dingtalk_client::Notifier;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

#[async_trait::async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Union id for a WeMeet user id, `None` when the user is unknown.
    async fn resolve(&self, wemeet_userid: &str) -> Result<Option<String>, BridgeError>;
}

/// Resolver backed by a persistent cache in front of the DingTalk user API.
pub struct CachingIdentityResolver {
    store: Arc<dyn UserIdentityStore>,
    notifier: Arc<dyn Notifier>,
}

impl CachingIdentityResolver {
    pub fn new(store: Arc<dyn UserIdentityStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }
}

#[async_trait::async_trait]
impl IdentityResolver for CachingIdentityResolver {
    #[instrument(skip_all, name = "bridge.identity.resolve", fields(wemeet_userid = %wemeet_userid))]
    async fn resolve(&self, wemeet_userid: &str) -> Result<Option<String>, BridgeError> {
        if wemeet_userid.is_empty() {
            return Ok(None);
        }

        match self.store.get(wemeet_userid).await {
            Ok(Some(union_id)) => return Ok(Some(union_id)),
            Ok(None) => {}
            Err(e) => {
                warn!(target: "bridge.store", error = %e, "Identity cache read failed, asking DingTalk");
            }
        }

        let Some(union_id) = self.notifier.lookup_union_id(wemeet_userid).await? else {
            debug!(target: "bridge.events", "No DingTalk account for user");
            return Ok(None);
        };

        if let Err(e) = self.store.put(wemeet_userid, &union_id).await {
            warn!(target: "bridge.store", error = %e, "Failed to cache resolved identity");
        }

        Ok(Some(union_id))
    }
}
