use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use rg_janitor::{
    cloud::{ArmClient, token_provider_from_config},
    config::JanitorConfig,
    observability,
    sweep::{self, SubscriptionProcessor},
};

/// Config file looked up in the working directory when `--config` is absent.
const DEFAULT_CONFIG_FILE: &str = "rg-janitor.toml";

/// CLI arguments for the resource group janitor
#[derive(Parser, Debug)]
#[command(version, about = "Expiry-based cleanup of Azure resource groups", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (defaults to ./rg-janitor.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run a single sweep over every configured subscription and exit (default)
    ///
    /// Failed subscriptions and resource groups are logged, not reported
    /// through the exit code. Only startup problems exit non-zero.
    Run,
    /// Sweep repeatedly on `cleanup.interval_secs` until interrupted
    Worker,
    /// Write a starter configuration file
    Init {
        /// Path to create the config file (defaults to ./rg-janitor.toml)
        #[arg(short, long)]
        output: Option<String>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Validate the configuration and print what a sweep would cover
    Check,
}

/// Starter configuration written by `init`.
fn default_config_toml() -> &'static str {
    r#"# Resource group janitor configuration

[cleanup]
# Master switch. When false, a run touches nothing.
is_enabled = true
# Expired groups are only deleted when this is true. Leave it off for a
# first pass to see which groups would go.
cleanup_enabled = false
# Resource groups whose name matches this regex are skipped entirely.
# exceptions = "^(prod|shared)-"
subscriptions = "${JANITOR_SUBSCRIPTIONS}"
default_expiry_days = 2
default_extension_days = 4
usage_lookback_days = 1

[azure.auth]
type = "managed_identity"

# [azure.auth]
# type = "service_principal"
# tenant_id = "${AZURE_TENANT_ID}"
# client_id = "${AZURE_CLIENT_ID}"
# client_secret = "${AZURE_CLIENT_SECRET}"

[observability.logging]
level = "info"
format = "compact"
"#
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Some(Command::Init { output, force }) => {
            run_init(output, force);
        }
        Some(Command::Check) => {
            run_check(args.config.as_deref());
        }
        Some(Command::Worker) => {
            run_worker(args.config.as_deref()).await;
        }
        Some(Command::Run) | None => {
            run_once(args.config.as_deref()).await;
        }
    }
}

/// Initialize a new configuration file
fn run_init(output: Option<String>, force: bool) {
    let output_path = output
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    if output_path.exists() && !force {
        eprintln!(
            "Config file already exists: {}\nUse --force to overwrite.",
            output_path.display()
        );
        std::process::exit(1);
    }

    if let Some(parent) = output_path.parent()
        && !parent.as_os_str().is_empty()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        eprintln!("Failed to create directory {}: {}", parent.display(), e);
        std::process::exit(1);
    }

    if let Err(e) = std::fs::write(&output_path, default_config_toml()) {
        eprintln!("Failed to write config file: {}", e);
        std::process::exit(1);
    }

    println!("Created config file: {}", output_path.display());
    println!();
    println!("Set JANITOR_SUBSCRIPTIONS (or edit the file), then check it with:");
    println!("  rg-janitor check --config {}", output_path.display());
}

/// Load the config file or exit with a readable error.
fn load_config(explicit_path: Option<&str>) -> JanitorConfig {
    let config_path = PathBuf::from(explicit_path.unwrap_or(DEFAULT_CONFIG_FILE));

    if !config_path.exists() {
        eprintln!(
            "Config file not found: {}\nCreate one with `rg-janitor init`.",
            config_path.display()
        );
        std::process::exit(1);
    }

    match JanitorConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Failed to load config from {}: {}",
                config_path.display(),
                e
            );
            std::process::exit(1);
        }
    }
}

fn run_check(explicit_path: Option<&str>) {
    let config = load_config(explicit_path);
    let cleanup = &config.cleanup;

    println!("Configuration OK");
    println!("  enabled:            {}", cleanup.is_enabled);
    println!(
        "  mode:               {}",
        if cleanup.cleanup_enabled {
            "delete expired groups"
        } else {
            "dry run (tagging only)"
        }
    );
    match cleanup.exceptions.as_deref() {
        None => println!("  exceptions:         (none)"),
        Some("") => println!("  exceptions:         \"\" (matches every group)"),
        Some(pattern) => println!("  exceptions:         {}", pattern),
    }
    println!(
        "  expiry / extension: {}d / {}d (lookback {}d)",
        cleanup.default_expiry_days, cleanup.default_extension_days, cleanup.usage_lookback_days
    );
    println!("  endpoint:           {}", config.azure.base_url());
    println!("  subscriptions:");
    for subscription in &cleanup.subscriptions {
        println!("    - {}", subscription);
    }
}

/// Wire the configured Azure client into a subscription processor.
fn build_processor(config: &JanitorConfig) -> SubscriptionProcessor {
    let tokens =
        match token_provider_from_config(&config.azure.auth, &config.azure.token_scope()) {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::error!(error = %e, "Failed to create Azure credential");
                std::process::exit(1);
            }
        };

    let arm = match ArmClient::from_config(&config.azure, tokens) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            tracing::error!(error = %e, "Failed to create Resource Manager client");
            std::process::exit(1);
        }
    };

    match SubscriptionProcessor::from_config(&config.cleanup, arm.clone(), arm) {
        Ok(processor) => processor,
        Err(e) => {
            tracing::error!(error = %e, "Invalid exemption pattern");
            std::process::exit(1);
        }
    }
}

fn init(explicit_path: Option<&str>) -> (JanitorConfig, observability::TracingGuard) {
    let config = load_config(explicit_path);

    let guard = match observability::init_tracing(&config.observability) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize tracing: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        subscriptions = config.cleanup.subscriptions.len(),
        cleanup_enabled = config.cleanup.cleanup_enabled,
        "Starting rg-janitor"
    );

    (config, guard)
}

async fn run_once(explicit_path: Option<&str>) {
    let (config, _guard) = init(explicit_path);
    let processor = build_processor(&config);

    let result = sweep::run_sweep(&processor, &config.cleanup).await;

    if result.has_failures() {
        tracing::warn!(
            failed_subscriptions = result.failed_subscriptions.len(),
            failed_groups = result.total_failed_groups(),
            "Sweep finished with failures"
        );
    }
}

async fn run_worker(explicit_path: Option<&str>) {
    let (config, _guard) = init(explicit_path);
    let processor = build_processor(&config);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    };

    sweep::start_sweep_worker(processor, config.cleanup, shutdown).await;
}
