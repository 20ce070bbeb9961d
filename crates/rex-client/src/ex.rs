//! Registry of named targets.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rex_core::error::{RexError, RexResult};
use rex_core::transport::{Connector, Dialer};

use crate::config::{ExConfig, TargetConfig};
use crate::dialer::{TcpDialer, TracedDialer};
use crate::target::{ConnectionManager, Target};

/// Connections to several systems, addressed by name.
///
/// Every connection is dialed through the configured [`Dialer`] (plain TCP by
/// default) and authenticated by the [`Connector`] given at construction.
pub struct Ex {
    connector: Arc<dyn Connector>,
    dialer: RwLock<Arc<dyn Dialer>>,
    targets: tokio::sync::Mutex<BTreeMap<String, Arc<dyn Target>>>,
}

impl Ex {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            dialer: RwLock::new(Arc::new(TracedDialer::new(Arc::new(TcpDialer)))),
            targets: tokio::sync::Mutex::new(BTreeMap::new()),
        }
    }

    /// Use `dialer` for connections made from now on.
    pub fn set_dialer(&self, dialer: Arc<dyn Dialer>) {
        *self.dialer.write() = Arc::new(TracedDialer::new(dialer));
    }

    /// Connect to the target described by `config` and register it under
    /// its name.
    pub async fn add_target(
        &self,
        cancel: &CancellationToken,
        config: &TargetConfig,
    ) -> RexResult<Arc<dyn Target>> {
        // Held across the connect so two adds of one name cannot race.
        let mut targets = self.targets.lock().await;

        if config.host_key.is_none() {
            return Err(RexError::Config(format!(
                "no host key policy for target {}",
                config.name
            )));
        }
        if targets.contains_key(&config.name) {
            return Err(RexError::TargetExists(config.name.clone()));
        }

        let dialer = self.dialer.read().clone();
        let manager =
            ConnectionManager::connect(cancel, dialer.as_ref(), self.connector.as_ref(), config)
                .await
                .map_err(|e| RexError::target(&config.name, e))?;

        let target: Arc<dyn Target> = Arc::new(manager);
        targets.insert(config.name.clone(), target.clone());
        debug!(name = %config.name, "target added");
        Ok(target)
    }

    /// Connect every target in `config`, stopping at the first failure.
    pub async fn connect_all(&self, cancel: &CancellationToken, config: &ExConfig) -> RexResult<()> {
        for target in &config.targets {
            self.add_target(cancel, target).await?;
        }
        Ok(())
    }

    pub async fn get_target(&self, name: &str) -> Option<Arc<dyn Target>> {
        self.targets.lock().await.get(name).cloned()
    }

    /// Like [`get_target`](Self::get_target), but a missing name is an error.
    pub async fn target(&self, name: &str) -> RexResult<Arc<dyn Target>> {
        self.get_target(name)
            .await
            .ok_or_else(|| RexError::TargetNotFound(name.to_string()))
    }

    pub async fn target_names(&self) -> Vec<String> {
        self.targets.lock().await.keys().cloned().collect()
    }

    /// Close every target and empty the registry.
    ///
    /// All targets are closed even if some fail; the first error is returned.
    pub async fn close(&self) -> RexResult<()> {
        let targets = std::mem::take(&mut *self.targets.lock().await);
        let mut first_err = None;
        for (name, target) in targets {
            if let Err(e) = target.close().await {
                warn!(name = %name, "error closing target: {}", e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
