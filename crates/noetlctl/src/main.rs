//! NoETL control CLI.
//!
//! Registers playbooks and starts, inspects, and cancels executions
//! against a running control plane.

mod client;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use client::{exit_code, ApiClient, CliError};

#[derive(Parser)]
#[command(name = "noetlctl")]
#[command(version, about = "NoETL control CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Control plane URL
    #[arg(long, env = "NOETL_SERVER_URL", default_value = "http://localhost:8082")]
    server_url: String,

    /// Emit raw JSON responses
    #[arg(short, long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a playbook YAML file in the catalog
    Register {
        /// Path to the playbook file
        file: PathBuf,
    },
    /// Start an execution of a registered playbook
    Exec {
        /// Catalog path of the playbook
        path: String,

        /// Pinned version (latest when omitted)
        #[arg(short = 'V', long)]
        version: Option<i32>,

        /// Payload JSON merged over the workload defaults
        #[arg(long, value_name = "JSON")]
        payload: Option<String>,

        /// Deep-merge the payload instead of a shallow override
        #[arg(long)]
        merge: bool,
    },
    /// Show the status of an execution
    Status {
        /// Execution ID
        execution_id: String,
    },
    /// Cancel a running execution
    Cancel {
        /// Execution ID
        execution_id: String,
    },
    /// List executions
    List {
        /// Filter by playbook path
        #[arg(long)]
        path: Option<String>,
    },
    /// List registered workers
    Workers,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let code = match run(&cli).await {
        Ok(()) => exit_code::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.downcast_ref::<CliError>()
                .map(|c| c.exit_code)
                .unwrap_or(exit_code::FAILURE)
        }
    };

    std::process::exit(code);
}

async fn run(cli: &Cli) -> Result<()> {
    let api = ApiClient::new(&cli.server_url);

    match &cli.command {
        Commands::Register { file } => {
            let content = std::fs::read_to_string(file).map_err(|e| {
                CliError::new(
                    format!("cannot read {}: {}", file.display(), e),
                    exit_code::VALIDATION,
                )
            })?;
            // Catch malformed YAML locally for a clearer validation error.
            serde_yaml::from_str::<serde_yaml::Value>(&content).map_err(|e| {
                CliError::new(format!("invalid YAML: {}", e), exit_code::VALIDATION)
            })?;

            let response: serde_json::Value = api
                .post(
                    "/api/catalog/register",
                    &serde_json::json!({"content": content}),
                )
                .await?;
            print_response(cli, &response, |r| {
                format!(
                    "Registered {} version {}",
                    r["path"].as_str().unwrap_or("?"),
                    r["version"]
                )
            });
        }
        Commands::Exec {
            path,
            version,
            payload,
            merge,
        } => {
            let payload: serde_json::Value = match payload {
                Some(raw) => serde_json::from_str(raw).map_err(|e| {
                    CliError::new(format!("invalid payload JSON: {}", e), exit_code::VALIDATION)
                })?,
                None => serde_json::json!({}),
            };

            let response: serde_json::Value = api
                .post(
                    "/api/executions",
                    &serde_json::json!({
                        "path": path,
                        "version": version,
                        "payload": payload,
                        "merge": merge,
                    }),
                )
                .await?;
            print_response(cli, &response, |r| {
                format!(
                    "Execution {} started for {}",
                    r["execution_id"].as_str().unwrap_or("?"),
                    r["path"].as_str().unwrap_or("?")
                )
            });
        }
        Commands::Status { execution_id } => {
            let response: serde_json::Value = api
                .get(&format!("/api/executions/{}/status", execution_id))
                .await?;
            print_response(cli, &response, |r| {
                let mut lines = vec![format!(
                    "Execution {}: {}",
                    r["execution_id"].as_str().unwrap_or("?"),
                    r["status"].as_str().unwrap_or("?")
                )];
                if let Some(step) = r["current_step"].as_str() {
                    lines.push(format!("  current step: {}", step));
                }
                if let Some(steps) = r["completed_steps"].as_array() {
                    let names: Vec<&str> = steps.iter().filter_map(|s| s.as_str()).collect();
                    lines.push(format!("  completed: [{}]", names.join(", ")));
                }
                if let Some(error) = r["error"].as_str() {
                    lines.push(format!("  error: {}", error));
                }
                lines.join("\n")
            });
        }
        Commands::Cancel { execution_id } => {
            let response: serde_json::Value = api
                .post(
                    &format!("/api/executions/{}/cancel", execution_id),
                    &serde_json::json!({}),
                )
                .await?;
            print_response(cli, &response, |r| {
                format!(
                    "Execution {} cancelled",
                    r["execution_id"].as_str().unwrap_or("?")
                )
            });
        }
        Commands::List { path } => {
            let query = path
                .as_ref()
                .map(|p| format!("?path={}", p))
                .unwrap_or_default();
            let response: serde_json::Value =
                api.get(&format!("/api/executions{}", query)).await?;
            print_response(cli, &response, |r| {
                let rows: Vec<String> = r
                    .as_array()
                    .map(|arr| {
                        arr.iter()
                            .map(|e| {
                                format!(
                                    "{}  {:<10} {}",
                                    e["execution_id"].as_str().unwrap_or("?"),
                                    e["status"].as_str().unwrap_or("?"),
                                    e["path"].as_str().unwrap_or("-")
                                )
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                if rows.is_empty() {
                    "No executions".to_string()
                } else {
                    rows.join("\n")
                }
            });
        }
        Commands::Workers => {
            let response: serde_json::Value = api.get("/api/workers").await?;
            print_response(cli, &response, |r| {
                let rows: Vec<String> = r
                    .as_array()
                    .map(|arr| {
                        arr.iter()
                            .map(|w| {
                                format!(
                                    "{:<24} {:<8} {}",
                                    w["name"].as_str().unwrap_or("?"),
                                    w["status"].as_str().unwrap_or("?"),
                                    w["capability_tags"].to_string()
                                )
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                if rows.is_empty() {
                    "No workers registered".to_string()
                } else {
                    rows.join("\n")
                }
            });
        }
    }

    Ok(())
}

fn print_response<F>(cli: &Cli, response: &serde_json::Value, human: F)
where
    F: Fn(&serde_json::Value) -> String,
{
    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(response).unwrap_or_default()
        );
    } else {
        println!("{}", human(response));
    }
}
