//! CLI binary for the gce-metadata crate.

use std::future::Future;
use std::io::{self, Write};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use gce_metadata::{default_http_client, MetadataClient, MetadataError, UserAgent};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gce-metadata")]
#[command(
    author,
    version,
    about = "Query the Google Compute Engine metadata server"
)]
struct Cli {
    /// Metadata host to query (GCE_METADATA_HOST takes precedence)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Send this User-Agent on every request
    #[arg(long, global = true)]
    user_agent: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print whether this machine runs on Compute Engine
    Detect,

    /// Fetch a raw metadata entry, e.g. `instance/zone`
    Get {
        suffix: String,

        /// Strip surrounding whitespace from the value
        #[arg(long)]
        trim: bool,
    },

    /// Fetch a custom instance or project attribute
    Attribute {
        key: String,

        /// Read the project attribute instead of the instance attribute
        #[arg(long)]
        project: bool,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Print a summary of the instance
    Info {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Print a metadata entry every time it changes
    Watch { suffix: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("unknown format: {}", s)),
        }
    }
}

#[derive(Debug, Serialize)]
struct InstanceInfo {
    project_id: String,
    zone: String,
    instance_name: String,
    instance_id: String,
    hostname: String,
}

impl InstanceInfo {
    async fn fetch(client: &MetadataClient) -> Result<Self, MetadataError> {
        Ok(Self {
            project_id: client.project_id().await?,
            zone: client.zone().await?,
            instance_name: client.instance_name().await?,
            instance_id: client.instance_id().await?,
            hostname: client.hostname().await?,
        })
    }
}

fn build_client(
    host: Option<String>,
    user_agent: Option<String>,
) -> Result<MetadataClient, MetadataError> {
    let http = default_http_client()?;
    let client = match user_agent {
        Some(user_agent) => MetadataClient::new(UserAgent::new(&user_agent, http)?),
        None => MetadataClient::new(http),
    };
    Ok(match host {
        Some(host) => client.with_host(host),
        None => client,
    })
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match run_to_completion(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Drive `fut` on a fresh runtime and return without joining leftover
/// blocking tasks, such as a DNS lookup abandoned by detection.
fn run_to_completion<F, T>(fut: F) -> Result<T, MetadataError>
where
    F: Future<Output = Result<T, MetadataError>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let output = runtime.block_on(fut);
    runtime.shutdown_background();
    output
}

async fn run(cli: Cli) -> Result<(), MetadataError> {
    let client = build_client(cli.host, cli.user_agent)?;

    match cli.command {
        Commands::Detect => {
            println!("{}", gce_metadata::on_gce().await);
            Ok(())
        }

        Commands::Get { suffix, trim } => {
            let value = if trim {
                client.get_trimmed(&suffix).await?
            } else {
                client.get(&suffix).await?
            };
            println!("{}", value);
            Ok(())
        }

        Commands::Attribute {
            key,
            project,
            format,
        } => {
            let value = if project {
                client.project_attribute_value(&key).await?
            } else {
                client.instance_attribute_value(&key).await?
            };
            match format {
                OutputFormat::Text => println!("{}", value),
                OutputFormat::Json => {
                    let value: serde_json::Value = serde_json::from_str(&value)?;
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
            }
            Ok(())
        }

        Commands::Info { format } => {
            let info = InstanceInfo::fetch(&client).await?;
            match format {
                OutputFormat::Text => {
                    println!("project:  {}", info.project_id);
                    println!("zone:     {}", info.zone);
                    println!("instance: {} ({})", info.instance_name, info.instance_id);
                    println!("hostname: {}", info.hostname);
                }
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
            }
            Ok(())
        }

        Commands::Watch { suffix } => {
            let mut stdout = io::stdout();
            client
                .subscribe(&suffix, |value, exists| -> Result<(), MetadataError> {
                    if exists {
                        writeln!(stdout, "{}", value)?;
                    } else {
                        tracing::info!(%suffix, "metadata entry removed");
                    }
                    stdout.flush()?;
                    Ok(())
                })
                .await
        }
    }
}
