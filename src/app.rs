use crate::config::Config;
use crate::controller::DialerController;
use crate::event::EventSender;
use crate::gateway::{CallGateway, CallGatewayBuilder, CallSdk, ProvisioningClient};
use crate::handler;
use crate::sequencer::{DialerSequencer, DialerSequencerBuilder};
use crate::store::{DebouncedWriter, SnapshotStore};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

pub struct AppStateInner {
    pub config: Arc<Config>,
    pub controller: DialerController,
    pub sequencer: DialerSequencer,
    pub gateway: CallGateway,
    pub store: SnapshotStore,
    pub event_sender: EventSender,
    pub token: CancellationToken,
}

pub type AppState = Arc<AppStateInner>;

pub struct AppStateBuilder {
    pub config: Option<Config>,
    pub sdk: Option<Arc<dyn CallSdk>>,
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            sdk: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Plug in the native calling SDK binding. Without one, every call is
    /// rejected by the placeholder SDK.
    pub fn sdk(mut self, sdk: Arc<dyn CallSdk>) -> Self {
        self.sdk = Some(sdk);
        self
    }

    pub async fn build(self) -> Result<AppState> {
        let config = Arc::new(self.config.unwrap_or_default());
        let token = CancellationToken::new();
        let (event_sender, _) = tokio::sync::broadcast::channel(256);

        let store = SnapshotStore::new(config.storage_path.clone());
        let writer = DebouncedWriter::new(
            store.clone(),
            Duration::from_millis(config.dialer.save_debounce_ms),
            token.child_token(),
            Some(event_sender.clone()),
        );
        let provisioner = Arc::new(ProvisioningClient::new(config.provision.clone()));

        let mut gateway_builder = CallGatewayBuilder::new()
            .with_token_provider(provisioner.clone())
            .with_event_sender(event_sender.clone())
            .with_cancel_token(token.child_token());
        if let Some(sdk) = self.sdk {
            gateway_builder = gateway_builder.with_sdk(sdk);
        }
        let gateway = gateway_builder.build();

        let sequencer = DialerSequencerBuilder::new()
            .with_gateway(gateway.clone())
            .with_writer(writer)
            .with_event_sender(event_sender.clone())
            .with_config(config.dialer.clone())
            .with_cancel_token(token.child_token())
            .build();

        let controller = DialerController::new(
            sequencer.clone(),
            store.clone(),
            gateway.clone(),
            Some(provisioner),
        );
        controller.initialize().await;

        Ok(Arc::new(AppStateInner {
            config,
            controller,
            sequencer,
            gateway,
            store,
            event_sender,
            token,
        }))
    }
}

impl AppStateInner {
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let router = handler::router()
            .layer(CorsLayer::permissive())
            .with_state(self.clone());
        let listener = TcpListener::bind(&self.config.http_addr).await?;
        info!("listening on {}", listener.local_addr()?);
        let token = self.token.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await?;
        Ok(())
    }

    pub fn stop(&self) {
        info!("stopping");
        self.token.cancel();
    }
}
