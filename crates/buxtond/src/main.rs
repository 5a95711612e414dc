//! buxtond — the Buxton configuration database daemon.

use std::sync::Arc;

use buxton_core::config::{load_layer_dir, BuxtondConfig};
use buxton_services::{AccessRules, BackendModule, BackendRegistry, Resolver};
use buxton_services::memory::MemoryBackend;
use buxton_services::persistent::PersistentBackend;

use buxtond::client::ClientTable;
use buxtond::server;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = BuxtondConfig::load()?;
    tracing::info!(socket = %config.socket.path.display(), "buxtond starting");

    let layers = match load_layer_dir(&config.storage.layer_dir) {
        Ok(layers) => layers,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load layer config, starting with no layers");
            Vec::new()
        }
    };
    tracing::info!(count = layers.len(), "layers loaded");

    let db_root = config.storage.db_root.clone();
    let mut registry = BackendRegistry::new();
    registry.register(
        "memory",
        Box::new(|| Ok(Arc::new(MemoryBackend::new()) as Arc<dyn BackendModule>)),
    );
    registry.register(
        "persistent",
        Box::new(move || Ok(Arc::new(PersistentBackend::new(db_root.clone())) as Arc<dyn BackendModule>)),
    );

    let access = AccessRules::load(&config.access.rule_file).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load access rules, starting with an empty table");
        AccessRules::empty()
    });

    let resolver = Arc::new(Resolver::new(layers, registry, access));
    let clients = Arc::new(ClientTable::new());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let reload_resolver = resolver.clone();
    let reload_interval = config.access.rule_reload_interval_secs.max(1);
    runtime.block_on(async move {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(reload_interval));
            loop {
                ticker.tick().await;
                if let Err(e) = reload_resolver.access().reload() {
                    tracing::warn!(error = %e, "access rule reload failed");
                }
            }
        });

        server::run(&config.socket.path, resolver, clients).await
    })
}
