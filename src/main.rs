use clap::Parser;
use moltbot::config::{Args, Command};
use moltbot::{Application, Config};

/// Wait for SIGTERM or Ctrl+C so `serve` shuts down gracefully.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down gracefully"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down gracefully"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = Config::load(&args)?;

    if let Command::Serve { port: Some(port) } = &args.command {
        config.api_port = *port;
    }

    moltbot::telemetry::init(&config.log_level, args.verbose);
    tracing::debug!(?args, "parsed CLI arguments");

    let app = Application::new(config).await?;

    match args.command {
        Command::Serve { .. } => {
            app.serve(shutdown_signal()).await?;
        }
        Command::Run { prompt, model } => {
            let task = app.run_one(prompt, model).await?;
            match task.state {
                moltbot::task::TaskStatus::Completed => {
                    println!("{}", task.result.unwrap_or_default());
                }
                _ => {
                    eprintln!("task did not complete: {}", task.error.unwrap_or_else(|| "unknown error".to_string()));
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
