//! Process lifecycle for gates and nodes.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

/// Something the [`Container`] starts and tears down.
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()>;

    async fn destroy(&self) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct Container {
    components: Vec<Arc<dyn Component>>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, component: Arc<dyn Component>) -> &mut Self {
        self.components.push(component);
        self
    }

    /// Run every component until Ctrl+C or SIGTERM.
    pub async fn serve(&self) -> anyhow::Result<()> {
        self.serve_until(shutdown_signal()).await
    }

    /// Init and start components in order, wait for `signal`, then destroy
    /// them in reverse order.
    ///
    /// If a component fails to start, the ones already started are destroyed
    /// and the error is returned.
    pub async fn serve_until<F: Future<Output = ()>>(&self, signal: F) -> anyhow::Result<()> {
        for component in &self.components {
            component.init().await?;
        }

        for (started, component) in self.components.iter().enumerate() {
            if let Err(e) = component.start().await {
                error!(component = component.name(), error = %e, "Component failed to start");
                self.destroy(&self.components[..started]).await;
                return Err(e);
            }
            info!(component = component.name(), "Component started");
        }

        signal.await;

        self.destroy(&self.components).await;
        info!("Shutdown complete");
        Ok(())
    }

    async fn destroy(&self, components: &[Arc<dyn Component>]) {
        for component in components.iter().rev() {
            if let Err(e) = component.destroy().await {
                error!(component = component.name(), error = %e, "Component failed to stop");
            }
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM. A handler that cannot be installed is
/// logged and never fires.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
