use anyhow::{Context, Result};
use clap::Parser;
use sandhold::cli::{Cli, Commands};
use sandhold::config::SandholdConfig;
use sandhold::daemon::{Daemon, DaemonClient, DaemonCommand, DaemonResponse};
use sandhold::events::{ChannelBroadcaster, SandboxEvent};
use sandhold::orchestrator::{Collaborators, SandboxOrchestrator, StatusSummary};
use sandhold::store::SqliteStore;
use sandhold::SandholdError;
use std::io::{Read, Write};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sandhold=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => SandholdConfig::load(path)?,
        None => SandholdConfig::load_default()?,
    };
    if let Some(socket) = cli.socket {
        config.socket_path = Some(socket);
    }
    let client = DaemonClient::new(config.socket_path());

    match cli.command {
        Commands::Daemon { driver } => {
            if let Some(driver) = driver {
                config.driver = driver;
            }
            run_daemon(config).await?;
        }

        Commands::Status { json } => {
            let summary = client.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_status(&summary);
            }
        }

        Commands::Logs { plugin, lines } => {
            for line in client.logs(&plugin, lines).await? {
                println!("{}", line);
            }
        }

        Commands::Call { plugin, body } => {
            let body = if body == "-" {
                let mut input = String::new();
                std::io::stdin().read_to_string(&mut input)?;
                input
            } else {
                body
            };
            call_plugin(&client, plugin, body).await?;
        }

        Commands::Watch => watch(&client).await?,

        Commands::Restart { plugin } => {
            client
                .request(DaemonCommand::RestartPlugin {
                    plugin_id: plugin.clone(),
                })
                .await?;
            println!("Restarted {}", plugin);
        }

        Commands::Stop { plugin } => {
            client
                .request(DaemonCommand::StopPlugin {
                    plugin_id: plugin.clone(),
                })
                .await?;
            println!("Stopped {}", plugin);
        }

        Commands::Shutdown => {
            client.request(DaemonCommand::Shutdown).await?;
            println!("Daemon shutting down");
        }
    }

    Ok(())
}

async fn run_daemon(config: SandholdConfig) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;

    let store = Arc::new(SqliteStore::open(config.database_path())?);
    let events = ChannelBroadcaster::default();
    let collaborators = Collaborators::production(&config, store, Arc::new(events.clone()))?;
    let socket_path = config.socket_path();
    let orchestrator = SandboxOrchestrator::new(config, collaborators);

    let daemon = Daemon::new(orchestrator.clone(), events, socket_path);
    let shutdown = daemon.shutdown_token();

    let startup = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            match orchestrator.start().await {
                Ok(report) => {
                    if let Some(message) = report.failure_message() {
                        tracing::warn!("{}", message);
                    }
                }
                Err(SandholdError::Cancelled(_)) => tracing::info!("Startup cancelled by shutdown"),
                Err(e) => tracing::error!(error = %e, "Startup failed"),
            }
        })
    };

    let ctrl_c = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted");
                shutdown.cancel();
            }
        })
    };

    let served = daemon.run().await;
    ctrl_c.abort();

    // Ends open subscriptions too
    shutdown.cancel();
    orchestrator.stop_all().await?;
    let _ = startup.await;
    served?;
    Ok(())
}

fn print_status(summary: &StatusSummary) {
    println!("Runtime:  {}", summary.status);
    if let Some(socket) = &summary.runtime.socket_path {
        println!("Socket:   {}", socket.display());
    }
    match &summary.image.error {
        Some(error) => println!("Image:    failed ({})", error),
        None => println!(
            "Image:    {}% {}",
            summary.image.percentage,
            summary.image.message.as_deref().unwrap_or("")
        ),
    }

    if summary.containers.is_empty() {
        println!("No plugins running.");
        return;
    }
    println!();
    println!("{:<24} {:<14} {:<8} {:>6}", "PLUGIN", "STATE", "RUNNING", "PORT");
    for (plugin_id, view) in &summary.containers {
        let port = view
            .host_port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<14} {:<8} {:>6}",
            plugin_id,
            format!("{:?}", view.state),
            view.running,
            port
        );
        if let Some(error) = &view.last_error {
            println!("    error: {}", error);
        }
    }
    println!();
    println!("{} tool(s) available", summary.tools.len());
}

async fn call_plugin(client: &DaemonClient, plugin_id: String, body: String) -> Result<()> {
    let mut conn = client.connect().await?;
    conn.send(&DaemonCommand::Proxy { plugin_id, body }).await?;

    let mut stdout = std::io::stdout();
    while let Some(response) = conn.next().await? {
        match response {
            DaemonResponse::ProxyHead { status, .. } if status >= 400 => {
                eprintln!("Plugin answered HTTP {}", status);
            }
            DaemonResponse::ProxyHead { .. } => {}
            DaemonResponse::ProxyChunk { data } => {
                stdout.write_all(&data)?;
                stdout.flush()?;
            }
            DaemonResponse::ProxyEnd => break,
            DaemonResponse::Error { message } => anyhow::bail!(message),
            other => anyhow::bail!("unexpected response: {:?}", other),
        }
    }
    println!();
    Ok(())
}

async fn watch(client: &DaemonClient) -> Result<()> {
    let mut conn = client.connect().await?;
    conn.send(&DaemonCommand::Subscribe).await?;

    while let Some(response) = conn.next().await? {
        match response {
            DaemonResponse::Event { event } => match event {
                SandboxEvent::Status { summary } => {
                    println!(
                        "[status] {} image={}% plugins={} tools={}",
                        summary.status,
                        summary.image.percentage,
                        summary.containers.len(),
                        summary.tools.len()
                    );
                }
                SandboxEvent::PluginProgress {
                    plugin_id,
                    phase,
                    message,
                } => {
                    println!("[{}] {:?} {}", plugin_id, phase, message.unwrap_or_default());
                }
                SandboxEvent::Error { message } => eprintln!("[error] {}", message),
            },
            DaemonResponse::Ok { .. } => {}
            DaemonResponse::Error { message } => anyhow::bail!(message),
            other => anyhow::bail!("unexpected response: {:?}", other),
        }
    }
    Ok(())
}
