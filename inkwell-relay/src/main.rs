use clap::{Parser, Subcommand};
use inkwell_collab::{
    RelayClient, RelayServer, RenderUpdate, ReplicationMode, ServerConfig, Session, SessionConfig,
    SessionEvent, SessionRunner, TextBuffer, Unavailable, DEFAULT_ROOM,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "inkwell-relay")]
#[command(about = "Relay server and headless participant for shared text editing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve {
        /// Address to bind to
        #[arg(short, long, default_value = "127.0.0.1:4000")]
        bind: String,

        /// Maximum participants per room
        #[arg(long, default_value_t = 100)]
        max_participants: usize,

        /// Do not send relayed edits back to their sender
        #[arg(long)]
        no_echo: bool,
    },

    /// Join a room and replicate stdin through the relay
    Peer {
        /// Relay WebSocket URL
        #[arg(short, long, default_value = "ws://127.0.0.1:4000")]
        url: String,

        /// Display name
        #[arg(short, long)]
        name: String,

        /// Room to join
        #[arg(short, long, default_value = DEFAULT_ROOM)]
        room: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Serve {
            bind,
            max_participants,
            no_echo,
        } => serve(bind, max_participants, no_echo).await,
        Commands::Peer { url, name, room } => peer(url, name, room).await,
    };

    if let Err(e) = result {
        log::error!("{e}");
        std::process::exit(1);
    }
}

async fn serve(bind: String, max_participants: usize, no_echo: bool) -> Result<(), BoxError> {
    let config = ServerConfig {
        bind_addr: bind,
        max_participants_per_room: max_participants,
        echo_text_updates: !no_echo,
        ..ServerConfig::default()
    };
    let server = RelayServer::new(config);

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down relay");
            Ok(())
        }
    }
}

/// Headless participant: every stdin line is typed at the end of the text.
async fn peer(url: String, name: String, room: String) -> Result<(), BoxError> {
    let mut client = RelayClient::new(url);
    client.connect().await?;
    let joined = client.join(&room, &name).await?;

    let relay_rx = client.take_event_rx().ok_or("event receiver already taken")?;
    let (out_tx, out_rx) = mpsc::channel(256);
    client
        .sender()
        .ok_or("relay not connected")?
        .spawn_forwarder(out_rx);

    let config = SessionConfig {
        mode: ReplicationMode::Relayed,
        username: name,
        ..SessionConfig::default()
    };
    let mut session = Session::new(joined.id, config, Unavailable, TextBuffer::default());
    session.handle(SessionEvent::Relay(joined.to_message()));

    let (render_tx, mut render_rx) = mpsc::unbounded_channel();
    let (runner, handle) = SessionRunner::new(session, relay_rx, out_tx, render_tx);
    let task = tokio::spawn(runner.run());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut reading = true;

    // After end of input, keep printing until the runner has flushed and stopped.
    loop {
        tokio::select! {
            line = lines.next_line(), if reading => match line? {
                Some(line) => {
                    for ch in line.chars().chain(std::iter::once('\n')) {
                        if !handle.append(ch) {
                            break;
                        }
                    }
                }
                None => {
                    handle.shutdown();
                    reading = false;
                }
            },
            update = render_rx.recv() => match update {
                Some(RenderUpdate::Document(text)) => println!("----\n{text}\n----"),
                Some(RenderUpdate::Presence(list)) => {
                    let names: Vec<String> = list
                        .iter()
                        .map(|view| format!("{} ({})", view.name, view.color))
                        .collect();
                    println!("present: {}", names.join(", "));
                }
                Some(RenderUpdate::Carets(_)) => {}
                None => break,
            },
        }
    }

    let session = task.await?;
    log::info!(
        "Left {room} with {} characters",
        session.document().len_chars()
    );
    Ok(())
}
