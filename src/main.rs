#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::env;
use std::sync::Arc;

use dotenv::dotenv;
use netconsole::config::{resolve_max_connections, resolve_ssh_port, resolve_telnet_port, resolve_timeout};
use netconsole::ssh::{AuthChain, KeyAuth};
use netconsole::{Command, CommandRegistry, SshConsole, SshConsoleOptions, TelnetConsole, UserLevel};
use tracing::{info, warn};

/// Adapter served by the demo: first argument, then `CONSOLE_ADAPTER`, then telnet.
const ADAPTER_ENV_VAR: &str = "CONSOLE_ADAPTER";
const SSH_HOST_KEY_ENV_VAR: &str = "CONSOLE_SSH_HOST_KEY";
const SSH_AUTHORIZED_KEYS_ENV_VAR: &str = "CONSOLE_SSH_AUTHORIZED_KEYS";
const SSH_USER_ENV_VAR: &str = "CONSOLE_SSH_USER";
const SSH_PASSWORD_ENV_VAR: &str = "CONSOLE_SSH_PASSWORD";

fn register_sample_commands(registry: &CommandRegistry) {
    registry.add(Command::new(
        "echo",
        "repeat the arguments",
        |console, _cmd, args| async move {
            console.print(args.join(" ")).await;
            Ok(())
        },
    ));

    registry.add(
        Command::new("info", "show this session", |console, _cmd, _args| async move {
            match serde_json::to_string_pretty(&console.info()) {
                Ok(json) => console.print(json).await,
                Err(e) => console.print(format!("info unavailable: {e}")).await,
            }
            Ok(())
        })
        .with_level(UserLevel::Guest),
    );

    registry.add(
        Command::new("quit", "close this session", |console, _cmd, _args| async move {
            console.print("Bye").await;
            console.stop().await;
            Ok(())
        })
        .with_level(UserLevel::Guest),
    );
}

async fn run_telnet() -> Result<(), Box<dyn std::error::Error>> {
    let port = resolve_telnet_port(None);
    let telnet = TelnetConsole::new(port, resolve_max_connections(None)).await?;
    telnet.set_timeout(resolve_timeout(None));
    register_sample_commands(telnet.commands());

    info!("Telnet console ready on port {}", port);
    tokio::signal::ctrl_c().await?;
    telnet.shutdown().await;
    telnet.join().await?;
    Ok(())
}

async fn run_ssh() -> Result<(), Box<dyn std::error::Error>> {
    let host_key_path = env::var(SSH_HOST_KEY_ENV_VAR)
        .map_err(|_| format!("{SSH_HOST_KEY_ENV_VAR} must name a host key file"))?;
    let host_key = tokio::fs::read_to_string(&host_key_path).await?;

    let mut auth = AuthChain::new();
    if let Ok(path) = env::var(SSH_AUTHORIZED_KEYS_ENV_VAR) {
        let text = tokio::fs::read_to_string(&path).await?;
        auth = auth.with_keys(KeyAuth::from_authorized_keys(&text)?);
    }
    if let (Ok(user), Ok(password)) = (env::var(SSH_USER_ENV_VAR), env::var(SSH_PASSWORD_ENV_VAR)) {
        auth = auth.with_password([(user, password)]);
    }
    if auth.is_empty() {
        warn!("No SSH credentials configured, every login will be rejected");
    }

    let ssh = Arc::new(SshConsole::new_with_auth(
        &host_key,
        Arc::new(auth),
        SshConsoleOptions::new().with_timeout(resolve_timeout(None)),
    )?);
    register_sample_commands(ssh.commands());

    let port = resolve_ssh_port(None);
    let addr = ssh.bind(&format!("0.0.0.0:{port}"), resolve_max_connections(None)).await?;
    info!("SSH console ready on {}", addr);

    tokio::select! {
        result = ssh.join() => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            ssh.stop().await;
        }
    }
    Ok(())
}

#[cfg(feature = "stdio")]
async fn run_stdio() -> Result<(), Box<dyn std::error::Error>> {
    let registry = CommandRegistry::new();
    register_sample_commands(&registry);
    let stdio = netconsole::StdioConsole::with_options(
        netconsole::ConsoleOptions::new().with_shared_commands(registry),
    );

    if !stdio.start() {
        return Err("stdio console needs an interactive terminal".into());
    }
    // Ctrl-C typed on the terminal ends the session itself; the signal
    // covers interrupts sent from elsewhere.
    let signal = tokio::select! {
        _ = stdio.closed() => Ok(()),
        signal = tokio::signal::ctrl_c() => signal,
    };
    stdio.stop().await;
    signal?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let adapter = env::args()
        .nth(1)
        .or_else(|| env::var(ADAPTER_ENV_VAR).ok())
        .unwrap_or_else(|| "telnet".to_string());

    match adapter.as_str() {
        "telnet" => run_telnet().await,
        "ssh" => run_ssh().await,
        #[cfg(feature = "stdio")]
        "stdio" => run_stdio().await,
        other => Err(format!("unknown adapter: {other}").into()),
    }
}
