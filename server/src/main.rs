use clap::Parser;
use log::{debug, error, info, warn};
use server::{ClientId, Command, NetworkConfig, NetworkEvent, NetworkHandle, NetworkService};
use shared::{NetMessage, StartMessage};
use std::net::SocketAddr;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Main-method of the application.
/// Parses command-line arguments, starts the network thread, then runs the
/// control loop on this one until every client is gone.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "0.0.0.0")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "4321")]
        port: u16,
        /// Maximum number of simultaneously connected clients
        #[clap(short, long, default_value = "8")]
        max_clients: usize,
        /// Listen backlog
        #[clap(short, long, default_value = "5")]
        backlog: u32,
        /// Control loop rate (polls per second)
        #[clap(short, long, default_value = "30")]
        tick_rate: u32,
    }

    env_logger::init();
    let args = Args::parse();

    let bind_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let config = NetworkConfig {
        bind_addr,
        backlog: args.backlog,
        max_clients: args.max_clients,
        ..Default::default()
    };

    let network = match NetworkService::start(config) {
        Ok(network) => network,
        Err(e) => {
            error!("Failed to start networking: {}", e);
            return Err(e.into());
        }
    };

    let network = run_control_loop(network, args.tick_rate.max(1)).await?;

    tokio::task::spawn_blocking(move || network.join()).await??;
    info!("Server stopped");
    Ok(())
}

/// Polls network events every tick and reacts to them. Ctrl+C starts the
/// disconnect sequence; the loop ends once the network thread has stopped.
async fn run_control_loop(
    mut network: NetworkHandle,
    tick_rate: u32,
) -> Result<NetworkHandle, Box<dyn std::error::Error>> {
    let mut interval_timer = interval(Duration::from_secs_f32(1.0 / tick_rate as f32));
    interval_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut lobby = Lobby::default();
    let mut shutting_down = false;

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                while let Some(event) = network.poll_event() {
                    for command in lobby.handle_event(event) {
                        if let Err(e) = network.submit_command(&command) {
                            warn!("Failed to submit {:?}: {}", command, e);
                        }
                    }
                }
                if network.is_stopped() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c(), if !shutting_down => {
                info!("Received Ctrl+C, disconnecting {} players", lobby.players.len());
                network.disconnect_all()?;
                shutting_down = true;
            }
        }
    }

    Ok(network)
}

/// Seats players as they connect and relays their orders to everyone
#[derive(Default)]
struct Lobby {
    players: Vec<ClientId>,
}

impl Lobby {
    fn handle_event(&mut self, event: NetworkEvent) -> Vec<Command> {
        match event {
            NetworkEvent::ClientConnected { client, addr } => {
                self.players.push(client);
                info!("Player {} joined from {}", client, addr);

                match StartMessage::new(self.players.len(), self.players.len() - 1) {
                    Ok(start) => vec![Command::Send {
                        client,
                        message: NetMessage::Start(start),
                    }],
                    Err(e) => {
                        warn!("Cannot seat player {}: {}", client, e);
                        vec![Command::DisconnectClient { client }]
                    }
                }
            }
            NetworkEvent::ClientDisconnected { client, reason } => {
                self.players.retain(|&player| player != client);
                info!("Player {} left ({:?})", client, reason);
                Vec::new()
            }
            NetworkEvent::MessageReceived { client, message } => match message {
                NetMessage::Reply => {
                    debug!("Player {} acknowledged", client);
                    Vec::new()
                }
                NetMessage::Order(_) | NetMessage::OrderList(_) => {
                    vec![Command::Broadcast { message }]
                }
                NetMessage::Start(_) => {
                    warn!("Player {} sent a start message, disconnecting", client);
                    vec![Command::DisconnectClient { client }]
                }
            },
        }
    }
}
