// Copyright (c) 2026 streamvault contributors
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use streamvault_core::backend::mock::MockBackendClient;
use streamvault_core::backend::BackendClient;
use streamvault_core::cache::{ChunkCache, HandleCache};
use streamvault_core::catalog::sqlite::{ensure_schema, SqlxCatalogStore};
use streamvault_core::catalog::static_store::StaticCatalogStore;
use streamvault_core::catalog::CatalogStore;
use streamvault_core::common::types::AccountId;
use streamvault_core::configs::Config;
use streamvault_core::http::{self, AppState};
use streamvault_core::pool::{keepalive, Account, SessionPool, Tier};
use streamvault_core::registry::{self, ReaderRegistry};

/// One entry of `PoolConfig::credentials_path`'s JSON array.
#[derive(Debug, Deserialize)]
struct AccountSpec {
    id: u32,
    tier: AccountTier,
    #[serde(default)]
    credentials: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum AccountTier {
    Standard,
    Premium,
}

fn load_accounts(path: &str) -> Vec<AccountSpec> {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    streamvault_core::common::logger::init(&config);

    info!("streamvault-core starting...");

    // The authenticated chat/RPC backend is an external collaborator whose
    // interface the core consumes (spec §1); no production implementation
    // is part of this crate. `MockBackendClient` stands in as the wired
    // default until a real client is supplied.
    let backend: Arc<dyn BackendClient> = Arc::new(MockBackendClient::new());

    let pool = Arc::new(SessionPool::new(backend));
    for spec in load_accounts(&config.pool.credentials_path) {
        let (tier, session_count) = match spec.tier {
            AccountTier::Premium => (Tier::Premium, config.pool.premium_sessions_per_account as usize),
            AccountTier::Standard => (Tier::Standard, config.pool.standard_sessions_per_account as usize),
        };
        pool.add_account(
            Account::new(AccountId(spec.id), tier, spec.credentials.into_bytes()),
            session_count,
        );
    }

    let catalog: Arc<dyn CatalogStore> = if config.catalog.r#static {
        Arc::new(StaticCatalogStore::load_from_file(&config.catalog.static_catalog_path)?)
    } else {
        let sqlite_pool = sqlx::SqlitePool::connect(&config.catalog.database_url).await?;
        ensure_schema(&sqlite_pool).await?;
        Arc::new(SqlxCatalogStore::from_pool(sqlite_pool))
    };

    let chunk_cache = Arc::new(ChunkCache::new(
        config.cache.chunk_cache_cap,
        Duration::from_secs(config.cache.chunk_ttl_secs),
    ));
    let handle_cache = Arc::new(HandleCache::new(Duration::from_secs(config.cache.handle_ttl_secs)));

    let registry = Arc::new(ReaderRegistry::new(
        catalog,
        pool.clone(),
        chunk_cache,
        handle_cache,
        config.reader.k_max_sessions,
        config.reader.scale_pressure_threshold,
        Duration::from_secs(config.reader.reader_ttl_secs),
        Duration::from_secs(config.reader.chunk_timeout_secs),
        Duration::from_secs(config.reader.handle_refresh_timeout_secs),
    ));

    let cancel = CancellationToken::new();

    let keepalive_task = keepalive::spawn(
        pool.clone(),
        Duration::from_secs(config.pool.keepalive_interval_secs),
        cancel.clone(),
    );
    let sweep_task = registry::spawn_sweep(
        registry.clone(),
        Duration::from_secs(config.reader.sweep_interval_secs),
        cancel.clone(),
    );

    let state = Arc::new(AppState { registry: registry.clone(), pool: pool.clone() });
    let app: Router = http::router(state).layer(tower_http::trace::TraceLayer::new_for_http());

    let ip: std::net::IpAddr = config.server.host.parse()?;
    let address = SocketAddr::from((ip, config.server.port));
    info!("streamvault-core listening on {}", address);

    let listener = tokio::net::TcpListener::bind(address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    cancel.cancel();
    keepalive_task.await.ok();
    sweep_task.await.ok();
    registry.release_all();
    if let Err(err) = pool.persist_credentials(&config.pool.session_state_path).await {
        tracing::warn!(error = %err, "failed to persist session state");
    }
    pool.shutdown();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
