//! Worker entry point: logging, configuration, database, health endpoint,
//! and the bus consumer.

use std::path::Path;
use std::sync::Arc;

use codeforge_worker::bus::NatsBus;
use codeforge_worker::config::WorkerSettings;
use codeforge_worker::consumer::Consumer;
use codeforge_worker::db::Database;
use codeforge_worker::llm::{init_scenarios, LiteLlmClient, ScenarioTable};
use codeforge_worker::pricing::{init_pricing, PricingTable};
use codeforge_worker::{health, logging};

#[tokio::main]
async fn main() {
    let settings = WorkerSettings::from_env();
    logging::init(&settings.log_service, &settings.log_level);

    // Process-wide tables, loaded once before anything runs.
    init_pricing(PricingTable::load(Path::new("configs/model_pricing.yaml")));
    init_scenarios(ScenarioTable::load(Path::new("configs/llm_scenarios.yaml")));

    let db = match Database::open(&settings.database_url) {
        Ok(db) => db,
        Err(error) => {
            tracing::error!(error = %error, "failed to open database");
            std::process::exit(1);
        }
    };

    let llm = match LiteLlmClient::new(&settings.litellm_url, &settings.litellm_api_key) {
        Ok(client) => Arc::new(client),
        Err(error) => {
            tracing::error!(error = %error, "failed to create LLM client");
            std::process::exit(1);
        }
    };

    // An unreachable bus at startup is the one fatal condition.
    let bus = match NatsBus::connect(&settings.nats_url).await {
        Ok(bus) => Arc::new(bus),
        Err(error) => {
            tracing::error!(error = %error, "failed to connect to NATS");
            std::process::exit(1);
        }
    };

    let health_port = settings.health_port;
    tokio::spawn(async move {
        if let Err(error) = health::serve(health_port).await {
            tracing::error!(error = %error, "health endpoint failed");
        }
    });

    let consumer = Consumer::new(bus, llm, db, settings);

    let shutdown_consumer = consumer.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        shutdown_consumer.stop().await;
    });

    if let Err(error) = consumer.run().await {
        tracing::error!(error = %error, "consumer exited with error");
        std::process::exit(1);
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(error) => {
                tracing::error!(error = %error, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
