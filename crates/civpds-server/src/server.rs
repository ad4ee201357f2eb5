use std::sync::Arc;

use tokio::net::TcpListener;

use crate::error::{ServerError, ServerResult};
use crate::node::Node;
use crate::router::{build_router, AppState};

/// HTTP front for a [`Node`].
pub struct PdsServer {
    node: Arc<Node>,
}

impl PdsServer {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Build the router (useful for testing).
    pub fn router(&self) -> axum::Router {
        build_router(AppState {
            carstore: self.node.carstore().clone(),
            health_timeout: self.node.config().health_timeout(),
        })
    }

    /// Serve until the node is shut down.
    pub async fn serve(self) -> ServerResult<()> {
        let app = self.router();
        let bind = self.node.config().server.bind;
        let listener = TcpListener::bind(bind).await?;
        tracing::info!(%bind, "civpds listening");
        let shutdown = self.node.shutdown_token();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))
    }
}
