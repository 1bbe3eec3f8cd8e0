// src/main.rs
use anyhow::Result;
use command_channel::config::{Cli, Config};
use command_channel::{crypto, net, Completion, RelayTransport};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

fn filter() -> Result<EnvFilter> {
    Ok(EnvFilter::from_default_env()
        .add_directive("command_channel=info".parse()?)
        .add_directive("vehicle_protocol=info".parse()?)
        .add_directive("tokio=warn".parse()?))
}

/// Compact output to stderr, or to a daily rolling file under `--log-dir`.
fn init_logging(cfg: &Config) -> Result<Option<WorkerGuard>> {
    match &cfg.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ovms-command.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter()?)
                .with_writer(writer)
                .with_ansi(false)
                .compact()
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter()?)
                .with_writer(std::io::stderr)
                .compact()
                .init();
            Ok(None)
        }
    }
}

fn print_completion(cfg: &Config, completion: &Completion) -> Result<()> {
    if cfg.json {
        println!("{}", serde_json::to_string_pretty(completion)?);
        return Ok(());
    }
    match completion {
        Completion::Success { response } if response.message.is_empty() => {
            println!("{}: {:?}", cfg.command.kind(), response.result)
        }
        Completion::Success { response } => {
            println!("{}: {:?} ({})", cfg.command.kind(), response.result, response.message)
        }
        Completion::TimedOut => {
            println!("{}: no answer within {:?}; outcome unknown", cfg.command.kind(), cfg.command_timeout)
        }
        Completion::Failed { reason } => println!("{}: failed: {reason}", cfg.command.kind()),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // -------- config + logging ----------
    let cfg = Cli::parse_and_build_config()?;
    let guard = init_logging(&cfg)?;
    let material = crypto::session_material(&cfg)?;
    info!(relay = %cfg.relay_addr, family = %cfg.family, command = ?cfg.command, "ovms-command starting");

    // -------- connection ----------
    let stream = net::tcp::connect(&cfg).await?;
    let relay = RelayTransport::spawn(stream, &material, cfg.transport())?;

    // -------- issue + wait ----------
    let pending = match relay.issue(&cfg.command, cfg.command_timeout).await {
        Ok(p) => p,
        Err(rejected) => {
            relay.shutdown().await;
            return Err(rejected.into());
        }
    };
    let token = pending.token();
    let completion = tokio::select! {
        c = pending.completion() => c,
        _ = tokio::signal::ctrl_c() => {
            warn!(token, "interrupted; no longer waiting (the command may still run)");
            relay.shutdown().await;
            return Ok(());
        }
    };

    print_completion(&cfg, &completion)?;
    let reason = relay.shutdown().await;
    info!(%reason, "done");

    drop(guard);
    if !completion.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
