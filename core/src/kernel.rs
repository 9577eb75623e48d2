// Kernel: one runtime process of the cluster
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterDirectory, SetEvent};
use crate::config::KernelConfig;
use crate::context::Context;
use crate::directory::SpaceDirectory;
use crate::ids::{ContextId, SpaceId};
use crate::space::SpaceNetwork;
use crate::transport::Transport;
use crate::{KernelError, Result};

/// Wires a transport and a space directory to a cluster.
pub struct Kernel {
    config: KernelConfig,
    cluster: ClusterDirectory,
    transport: Transport,
    directory: Arc<SpaceDirectory>,
    root_context: OnceLock<ContextId>,
    discovery: Mutex<Option<JoinHandle<()>>>,
}

impl Kernel {
    /// Validates the configuration and binds the publish endpoint.
    pub async fn new(config: KernelConfig, cluster: ClusterDirectory) -> Result<Self> {
        config.validate()?;
        let transport = Transport::bind(&config).await?;
        let network: Arc<dyn SpaceNetwork> = Arc::new(transport.clone());
        let directory = Arc::new(SpaceDirectory::new(cluster.clone(), Some(network)));
        Ok(Self {
            config,
            cluster,
            transport,
            directory,
            root_context: OnceLock::new(),
            discovery: Mutex::new(None),
        })
    }

    pub async fn start(&self) -> Result<()> {
        info!(target: "kernel", uri = %self.transport.local_uri(), "Starting kernel...");

        self.transport.start(&self.directory)?;
        self.directory.start();

        for peer in &self.config.peers {
            if let Err(e) = self.transport.connect_peer(peer).await {
                warn!(target: "kernel", peer = %peer, error = %e, "Configured peer unreachable");
            }
        }
        self.start_peer_discovery().await;

        info!(target: "kernel", uri = %self.transport.local_uri(), "Kernel started");
        Ok(())
    }

    /// Publishes this kernel in the cluster and follows the other kernels.
    async fn start_peer_discovery(&self) {
        let local = self.transport.local_uri().to_string();
        let mut changes = self.cluster.kernels.subscribe();
        self.cluster.kernels.insert(local.clone());

        for uri in self.cluster.kernels.elements() {
            if uri != local {
                connect_logged(&self.transport, &uri).await;
            }
        }

        let transport = self.transport.clone();
        let kernels = self.cluster.kernels.clone();
        let task = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(SetEvent::Added(uri)) if uri != local => {
                        connect_logged(&transport, &uri).await;
                    }
                    Ok(SetEvent::Removed(uri)) if uri != local => {
                        if let Err(e) = transport.disconnect_peer(&uri).await {
                            debug!(target: "kernel", peer = %uri, error = %e, "Departed kernel was not connected");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!(target: "kernel", missed, "Kernel feed lagged, reconnecting to listed kernels");
                        for uri in kernels.elements() {
                            if uri != local {
                                connect_logged(&transport, &uri).await;
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        *self
            .discovery
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!(target: "kernel", "Shutting down kernel...");

        let discovery = self
            .discovery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = discovery {
            task.abort();
        }
        self.cluster
            .kernels
            .remove(&self.transport.local_uri().to_string());
        self.directory.stop();
        self.transport.shutdown().await;

        info!(target: "kernel", "Kernel shut down");
        Ok(())
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn cluster(&self) -> &ClusterDirectory {
        &self.cluster
    }

    pub fn directory(&self) -> &Arc<SpaceDirectory> {
        &self.directory
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn local_uri(&self) -> &str {
        self.transport.local_uri()
    }

    /// Root context of this kernel, created on first use.
    pub fn default_context(&self) -> Arc<Context> {
        let id = *self.root_context.get_or_init(ContextId::new_v4);
        match self.directory.context(id) {
            Some(context) => context,
            None => self.directory.create_context(id, SpaceId::random(id)),
        }
    }

    /// Creates a context with a fresh default space.
    pub fn create_context(&self) -> Arc<Context> {
        let id = ContextId::new_v4();
        self.directory.create_context(id, SpaceId::random(id))
    }

    pub fn context(&self, id: ContextId) -> Result<Arc<Context>> {
        self.directory
            .context(id)
            .ok_or(KernelError::UnknownContext(id))
    }
}

async fn connect_logged(transport: &Transport, uri: &str) {
    if let Err(e) = transport.connect_peer(uri).await {
        warn!(target: "kernel", peer = %uri, error = %e, "Could not reach kernel");
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("transport", &self.transport)
            .field("directory", &self.directory)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_context_is_stable() {
        let kernel = Kernel::new(KernelConfig::default(), ClusterDirectory::in_memory())
            .await
            .unwrap();
        kernel.start().await.unwrap();
        let a = kernel.default_context();
        let b = kernel.default_context();
        assert_eq!(a.id(), b.id());
        assert!(kernel.context(a.id()).is_ok());
        assert!(matches!(
            kernel.context(ContextId::new_v4()),
            Err(KernelError::UnknownContext(_))
        ));
        kernel.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = KernelConfig {
            publish_uri: "udp://127.0.0.1:1".into(),
            ..Default::default()
        };
        assert!(matches!(
            Kernel::new(config, ClusterDirectory::in_memory()).await,
            Err(KernelError::InvalidUri(_))
        ));
    }

    #[tokio::test]
    async fn kernels_find_each_other_through_the_cluster() {
        let cluster = ClusterDirectory::in_memory();
        let a = Kernel::new(KernelConfig::default(), cluster.clone()).await.unwrap();
        let b = Kernel::new(KernelConfig::default(), cluster.clone()).await.unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();

        let connected = tokio::time::timeout(std::time::Duration::from_secs(3), async {
            while a.transport().connected_peers().is_empty()
                || b.transport().connected_peers().is_empty()
            {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(connected.is_ok());
        assert_eq!(cluster.kernels.elements().len(), 2);

        b.shutdown().await.unwrap();
        assert_eq!(cluster.kernels.elements(), vec![a.local_uri().to_string()]);
        a.shutdown().await.unwrap();
    }
}
