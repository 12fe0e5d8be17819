//! Secmon Client - demo driver for the security service client.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::runtime::Handle;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use secmon_client::client::Client;
use secmon_client::codec::{Codec, MuteProcessRule};
use secmon_client::config::{ClientConfig, ConfigLoader};
use secmon_client::ipc::{AuthOutcome, ClientError, LoopbackService, ResolutionReply};
use secmon_client::model::{
    EventMessage, EventSet, EventType, InterestVerdict, ProcessDescriptor, Resolution,
};

#[derive(Parser)]
#[command(
    name = "secmon-client",
    about = "Client for an out-of-process security monitoring service",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file to use instead of the default search paths.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the client against an in-process loopback service.
    Demo {
        /// Number of notifications to emit.
        #[arg(short, long, default_value_t = 3)]
        events: u32,
        /// Interrupt the service once to show reconnection.
        #[arg(long)]
        interrupt: bool,
    },
    /// Print the effective configuration.
    ShowConfig,
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn load_config(path: Option<PathBuf>) -> ClientConfig {
    let loader = path.map_or_else(ConfigLoader::new, ConfigLoader::with_path);
    match loader.load() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to load config, using defaults");
            ClientConfig::default()
        }
    }
}

fn authorize(message: EventMessage, reply: ResolutionReply) {
    let resolution = if message.process.path.starts_with("/tmp/") {
        Resolution::deny(true)
    } else {
        Resolution::allow(false)
    };
    println!(
        "auth   {} {} -> {:?}",
        message.event_type, message.process.path, resolution.result
    );
    reply.resolve(resolution);
}

fn run_demo(
    runtime: Handle,
    config: &ClientConfig,
    events: u32,
    interrupt: bool,
) -> Result<(), ClientError> {
    let service = LoopbackService::new(Codec::new(config.codec.clone()));
    let client = Arc::new(Client::with_config(service.factory(), runtime, config));
    let watched = EventSet::from([
        EventType::AUTH_EXEC,
        EventType::NOTIFY_EXEC,
        EventType::NOTIFY_EXIT,
    ]);

    client.set_path_interest_handler(|process: &ProcessDescriptor| {
        (process.name() == "mdworker")
            .then(|| InterestVerdict::ignore(EventSet::from([EventType::NOTIFY_EXEC])))
    });
    client.set_auth_handler(authorize);
    client.set_notify_handler(|message: EventMessage| {
        println!(
            "notify {} pid={} {}",
            message.event_type, message.process.pid, message.process.path
        );
    });

    // The service forgets subscriptions when the connection is recreated.
    let weak = Arc::downgrade(&client);
    let replay = watched.clone();
    client.set_connection_state_handler(move |outcome| match outcome {
        Ok(()) => {
            println!("state  connected");
            if let Some(client) = weak.upgrade() {
                if let Err(e) = client.subscribe(&replay) {
                    tracing::warn!(error = %e, "Failed to restore subscriptions");
                }
            }
        }
        Err(e) => println!("state  {e}"),
    });

    client.try_activate()?;
    client.subscribe(&watched)?;
    client.mute_process(
        &MuteProcessRule::Name("backupd".to_string()),
        &EventSet::from([EventType::NOTIFY_EXEC]),
    )?;

    for i in 0..events {
        let process = ProcessDescriptor::new(1000 + i, format!("/usr/bin/tool{i}"));
        service.emit_notify(&EventMessage::notify(EventType::NOTIFY_EXEC, process));
    }
    service.emit_notify(&EventMessage::notify(
        EventType::NOTIFY_EXEC,
        ProcessDescriptor::new(77, "/usr/libexec/backupd"),
    ));

    let timeout = client.timeout();
    for path in ["/usr/bin/true", "/tmp/payload"] {
        let message = EventMessage::auth(EventType::AUTH_EXEC, ProcessDescriptor::new(4242, path));
        if let AuthOutcome::TimedOut = service.emit_auth(&message, timeout) {
            tracing::warn!(path, "Authorization timed out");
        }
    }

    if interrupt {
        service.interrupt();
        std::thread::sleep(client.reconnect_delay() + Duration::from_millis(200));
        service.emit_notify(&EventMessage::notify(
            EventType::NOTIFY_EXIT,
            ProcessDescriptor::new(1000, "/usr/bin/tool0"),
        ));
    }

    let (tx, rx) = std::sync::mpsc::channel();
    client.send_custom_message(b"ping".to_vec(), move |reply| {
        let _ = tx.send(reply);
    });
    match rx.recv_timeout(timeout) {
        Ok(Ok(reply)) => println!("custom {}", String::from_utf8_lossy(&reply)),
        Ok(Err(e)) => println!("custom failed: {e}"),
        Err(_) => println!("custom timed out"),
    }

    // Let queued handlers print before tearing down.
    std::thread::sleep(Duration::from_millis(100));
    client.invalidate();
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(cli.config);

    match cli.command {
        Commands::Demo { events, interrupt } => {
            tracing::info!(
                timeout_ms = config.timeout_ms,
                reconnect_delay_ms = config.reconnect_delay_ms,
                "Starting loopback demo"
            );
            let runtime = Handle::current();
            // Blocking calls must stay off the runtime's worker threads.
            let demo = tokio::task::spawn_blocking(move || {
                run_demo(runtime, &config, events, interrupt)
            })
            .await;
            match demo {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    eprintln!("demo failed: {e}");
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("demo task failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Commands::ShowConfig => match toml::to_string_pretty(&config) {
            Ok(rendered) => print!("{rendered}"),
            Err(e) => {
                eprintln!("failed to render config: {e}");
                std::process::exit(1);
            }
        },
    }
}
