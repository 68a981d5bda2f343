use anyhow::Context;
use clap::{Parser, Subcommand};
use lavs_shared::{EndpointMethod, LavsResult, RpcResponse};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::agents::FsAgentDirectory;
use crate::config::AppConfig;
use crate::manifest::ManifestLoader;
use crate::schema::SchemaValidator;
use crate::Dispatcher;

#[derive(Parser)]
#[command(
    name = "lavs_gateway",
    version = env!("CARGO_PKG_VERSION"),
    about = "LAVS - manifest-driven endpoint gateway for agents"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP gateway (default when no subcommand is given)
    Serve,
    /// Call one endpoint once and print the response envelope
    Call {
        agent: String,
        endpoint: String,
        /// JSON input passed to the handler
        #[arg(long, short = 'i', default_value = "{}")]
        input: String,
        /// Exposed to scripts as LAVS_PROJECT_PATH
        #[arg(long)]
        project: Option<String>,
    },
    /// Parse a manifest file and compile every schema it declares
    Check { manifest: PathBuf },
    /// Print the function-tool definitions of an agent
    Tools { agent: String },
}

fn print_envelope(result: &LavsResult<Value>) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(&RpcResponse::from_result(result))?
    );
    Ok(())
}

fn local_dispatcher(config: &AppConfig) -> Dispatcher {
    Dispatcher::new(
        Arc::new(FsAgentDirectory::new(config.agents_dir.clone())),
        config.dispatcher_config(),
    )
}

/// Dispatch CLI subcommands
pub async fn dispatch(cmd: Commands) -> anyhow::Result<()> {
    match cmd {
        Commands::Serve => crate::run_gateway(AppConfig::load()?).await,
        Commands::Call {
            agent,
            endpoint,
            input,
            project,
        } => {
            let input: Value =
                serde_json::from_str(&input).context("--input must be valid JSON")?;
            let caller_env = project.map(|p| HashMap::from([("LAVS_PROJECT_PATH".to_string(), p)]));

            let dispatcher = local_dispatcher(&AppConfig::load()?);
            let result = dispatcher
                .call_endpoint(&agent, &endpoint, input, caller_env)
                .await;
            dispatcher.shutdown();
            print_envelope(&result)?;
            if result.is_err() {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Check { manifest } => {
            let schemas = Arc::new(SchemaValidator::new());
            let loader = ManifestLoader::new(schemas.clone());
            let parsed = loader.load(&manifest).await.map_err(|e| {
                anyhow::anyhow!("{} is invalid: {}", manifest.display(), e.message)
            })?;
            let compiled = schemas
                .compile_manifest("check", &parsed)
                .map_err(|e| anyhow::anyhow!("Schema error: {}", e.message))?;

            info!("✅ {} is valid", manifest.display());
            println!(
                "Manifest:      {} ({})",
                parsed.name,
                parsed.version.as_deref().unwrap_or("unversioned")
            );
            println!("Endpoints:     {}", parsed.endpoints.len());
            for endpoint in &parsed.endpoints {
                let marker = match endpoint.method {
                    EndpointMethod::Query => "Q",
                    EndpointMethod::Mutation => "M",
                    EndpointMethod::Subscription => "S",
                };
                println!(
                    "  [{}] {:<24} {}",
                    marker,
                    endpoint.id,
                    endpoint.handler.kind()
                );
            }
            println!("Schemas:       {} compiled", compiled);
            Ok(())
        }
        Commands::Tools { agent } => {
            let dispatcher = local_dispatcher(&AppConfig::load()?);
            let result = dispatcher
                .tool_definitions(&agent)
                .await
                .and_then(|tools| {
                    serde_json::to_value(tools)
                        .map_err(|e| lavs_shared::LavsError::internal(e.to_string()))
                });
            print_envelope(&result)
        }
    }
}
