//! Test server harness for E2E testing
//!
//! Provides `TestBridgeServer` for spawning real bridge server instances
//! wired to in-memory stores and mock WeMeet/DingTalk collaborators.

use crate::fixtures::{TEST_AES_KEY, TEST_WEBHOOK_TOKEN};
use crate::webhook_client::WebhookClient;
use bridge_service::config::Config;
use bridge_service::repositories::{
    InMemorySideEffectStore, InMemoryUserIdentityStore, SideEffectStore,
};
use bridge_service::routes::{self, AppState, Collaborators};
use bridge_service::services::dingtalk_client::mock::MockNotifier;
use bridge_service::services::wemeet_client::mock::MockMeetingDirectory;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Configures a [`TestBridgeServer`] before it is spawned.
pub struct TestBridgeBuilder {
    vars: HashMap<String, String>,
    directory: MockMeetingDirectory,
    notifier: MockNotifier,
    side_effects: Option<Arc<dyn SideEffectStore>>,
}

impl Default for TestBridgeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestBridgeBuilder {
    pub fn new() -> Self {
        let vars = HashMap::from([
            (
                "DATABASE_URL".to_string(),
                "postgresql://test/test".to_string(),
            ),
            ("BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
            (
                "WEMEET_WEBHOOK_TOKEN".to_string(),
                TEST_WEBHOOK_TOKEN.to_string(),
            ),
            ("WEMEET_APP_ID".to_string(), "test-app".to_string()),
            ("WEMEET_SDK_ID".to_string(), "test-sdk".to_string()),
            ("WEMEET_SECRET_ID".to_string(), "test-secret-id".to_string()),
            (
                "WEMEET_SECRET_KEY".to_string(),
                "test-secret-key".to_string(),
            ),
            ("DINGTALK_CLIENT_ID".to_string(), "test-client".to_string()),
            (
                "DINGTALK_CLIENT_SECRET".to_string(),
                "test-client-secret".to_string(),
            ),
            ("DINGTALK_CORP_ID".to_string(), "test-corp".to_string()),
            ("DINGTALK_AGENT_ID".to_string(), "1000".to_string()),
            ("DINGTALK_ROBOT_CODE".to_string(), "test-robot".to_string()),
            ("SHUTDOWN_DRAIN_SECONDS".to_string(), "0".to_string()),
        ]);

        Self {
            vars,
            directory: MockMeetingDirectory::new(),
            notifier: MockNotifier::new(),
            side_effects: None,
        }
    }

    /// Set or override a configuration variable.
    #[must_use]
    pub fn var(mut self, name: &str, value: impl Into<String>) -> Self {
        self.vars.insert(name.to_string(), value.into());
        self
    }

    /// Expect AES encrypted payloads, keyed with [`TEST_AES_KEY`].
    #[must_use]
    pub fn encrypted(self) -> Self {
        self.var("WEMEET_WEBHOOK_AES_KEY", TEST_AES_KEY)
    }

    #[must_use]
    pub fn directory(mut self, directory: MockMeetingDirectory) -> Self {
        self.directory = directory;
        self
    }

    #[must_use]
    pub fn notifier(mut self, notifier: MockNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Replace the in-memory idempotency store.
    #[must_use]
    pub fn side_effects(mut self, store: Arc<dyn SideEffectStore>) -> Self {
        self.side_effects = Some(store);
        self
    }

    /// Build the application and start serving it on a random port.
    pub async fn spawn(self) -> Result<TestBridgeServer, anyhow::Error> {
        let config = Config::from_vars(&self.vars)
            .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?;

        let directory = Arc::new(self.directory);
        let notifier = Arc::new(self.notifier);
        let side_effects = self
            .side_effects
            .unwrap_or_else(|| Arc::new(InMemorySideEffectStore::new()));

        let state = Arc::new(
            AppState::new(
                &config,
                Collaborators {
                    directory: directory.clone(),
                    notifier: notifier.clone(),
                    side_effects: side_effects.clone(),
                    identities: Arc::new(InMemoryUserIdentityStore::new()),
                },
            )
            .map_err(|e| anyhow::anyhow!("Failed to create app state: {}", e))?,
        );

        // Local recorder handle; the global recorder is left alone so
        // several servers can run in one test binary
        let metrics_handle = PrometheusBuilder::new().build_recorder().handle();

        // Build routes using the bridge's real route builder
        let app = routes::build_routes(state.clone(), metrics_handle);

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        // Spawn server in background
        let handle = tokio::spawn(async move {
            let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, make_service).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(TestBridgeServer {
            addr,
            config,
            state,
            directory,
            notifier,
            side_effects,
            _handle: handle,
        })
    }
}

/// Test harness for spawning the bridge in E2E tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_health() -> Result<()> {
///     let server = TestBridgeServer::spawn().await?;
///
///     let response = reqwest::get(format!("{}/health", server.url())).await?;
///
///     assert_eq!(response.status(), 200);
///     Ok(())
/// }
/// ```
pub struct TestBridgeServer {
    addr: SocketAddr,
    config: Config,
    state: Arc<AppState>,
    directory: Arc<MockMeetingDirectory>,
    notifier: Arc<MockNotifier>,
    side_effects: Arc<dyn SideEffectStore>,
    _handle: JoinHandle<()>,
}

impl TestBridgeServer {
    /// Spawn a server with default configuration and empty mocks.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        TestBridgeBuilder::new().spawn().await
    }

    pub fn builder() -> TestBridgeBuilder {
        TestBridgeBuilder::new()
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get reference to the server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn directory(&self) -> &MockMeetingDirectory {
        &self.directory
    }

    pub fn notifier(&self) -> &MockNotifier {
        &self.notifier
    }

    pub fn side_effects(&self) -> &dyn SideEffectStore {
        self.side_effects.as_ref()
    }

    /// Client that signs (and if configured, encrypts) requests for this server.
    pub fn webhook_client(&self) -> WebhookClient {
        WebhookClient::new(
            self.url(),
            TEST_WEBHOOK_TOKEN,
            self.config.webhook_aes_key.as_ref(),
        )
    }

    /// Wait until every accepted event has been processed.
    pub async fn wait_for_events(&self) -> Result<(), anyhow::Error> {
        tokio::time::timeout(Duration::from_secs(5), self.state.dispatcher.wait_idle())
            .await
            .map_err(|_| anyhow::anyhow!("Timed out waiting for dispatched events"))
    }
}

impl Drop for TestBridgeServer {
    fn drop(&mut self) {
        // Abort the HTTP server task so the port is released when the test ends
        self._handle.abort();
    }
}
