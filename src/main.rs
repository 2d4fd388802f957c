use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use remote_gyro_sensor::app::{Monitor, SensorStreamer};
use remote_gyro_sensor::domain::models::Role;
use remote_gyro_sensor::domain::settings::SettingsService;
use remote_gyro_sensor::infrastructure::link::transport::{self, TransportKind};
use remote_gyro_sensor::infrastructure::logging::init_logger;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "remote_gyro_sensor")]
#[command(version)]
#[command(about = "Stream a fused rotation matrix to a peer over a point-to-point link")]
struct Cli {
    /// Settings file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured transport
    #[arg(long, global = true, value_enum)]
    transport: Option<TransportArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum TransportArg {
    Tcp,
    Local,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Tcp => TransportKind::Tcp,
            TransportArg::Local => TransportKind::LocalSocket,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Stream rotation frames from the simulated sensor
    Stream {
        #[command(flatten)]
        endpoint: Endpoint,
    },
    /// Decode and log rotation frames sent by a streamer
    Monitor {
        #[command(flatten)]
        endpoint: Endpoint,
    },
}

#[derive(clap::Args)]
struct Endpoint {
    /// Wait for a peer on this address (TCP) or socket name (local)
    #[arg(long, conflicts_with = "connect")]
    listen: Option<String>,

    /// Dial the peer at this address
    #[arg(long)]
    connect: Option<String>,
}

impl Endpoint {
    /// Apply the endpoint to the link settings and pick the role.
    fn resolve(self, service: &mut SettingsService) -> Role {
        let link = &mut service.get_mut().link;
        if let Some(listen) = self.listen {
            match link.transport {
                TransportKind::Tcp => link.listen_address = listen,
                TransportKind::LocalSocket => link.local_socket_name = listen,
            }
            return Role::Responder;
        }
        // The configured peer is only a default when no endpoint was given
        match self.connect.or_else(|| link.peer_address.clone()) {
            Some(address) => Role::Initiator { address },
            None => Role::Responder,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match cli.config {
        Some(path) => SettingsService::from_path(path)?,
        None => SettingsService::new()?,
    };
    if let Some(kind) = cli.transport {
        settings.get_mut().link.transport = kind.into();
    }

    let _logging_guard = init_logger(&settings.get().log_settings)?;
    tracing::info!("Settings: {}", settings.path().display());

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("Failed to install the Ctrl-C handler")?;
    }

    match cli.command {
        Commands::Stream { endpoint } => {
            let role = endpoint.resolve(&mut settings);
            let transport = transport::from_settings(&settings.get().link);
            let mut streamer = SensorStreamer::new(settings, transport, role)?;
            streamer.run(&shutdown)
        }
        Commands::Monitor { endpoint } => {
            let role = endpoint.resolve(&mut settings);
            let transport = transport::from_settings(&settings.get().link);
            let mut monitor = Monitor::new(transport, settings.get().link.link_config(), role)?;
            monitor.run(&shutdown)
        }
    }
}
