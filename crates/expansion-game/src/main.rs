//! Expansion War, console edition.
//!
//! Hosts or joins a two-player network game over TCP, or plays both sides
//! locally. Network failures that cannot be recovered hand the same board
//! back to local play.
//!
//! Run with: `cargo run -p expansion-game -- --role host --port 5000`

mod board;
mod command;
mod engine;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use expansion_config::{CliArgs, Config, NetworkConfig, PeerRole, default_config_dir};
use expansion_net::{
    GameEngine, ProbeStatus, ProberConfig, Role, ServerProber, Session, SessionConfig,
    StopHandle, SubmitError, TransportEvent,
};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{error, info, warn};

use crate::command::{Command, HELP, ParseError};
use crate::engine::ConsoleEngine;

type Input = Lines<BufReader<Stdin>>;

/// How network play ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Quit,
    Local,
}

enum Flow {
    Continue,
    Leave,
    Quit,
}

enum Next {
    Event(TransportEvent),
    Line(std::io::Result<Option<String>>),
    Interrupt,
}

fn to_role(role: PeerRole) -> Role {
    match role {
        PeerRole::Host => Role::Host,
        PeerRole::Joiner => Role::Joiner,
    }
}

/// Session settings from the validated network config.
fn session_config(net: &NetworkConfig, addr: SocketAddr) -> SessionConfig {
    let mut config = SessionConfig::new(to_role(net.role), addr);
    config.transport.connect_timeout = net.connect_timeout();
    config.transport.connect_attempts = net.connect_attempts;
    config.transport.connect_retry_delay = net.connect_retry_delay();
    config.transport.write_timeout = net.write_timeout();
    config.handshake.game_id = net.game_id.clone();
    config.handshake.version = net.protocol_version.clone();
    config.handshake.timeout = net.handshake_timeout();
    config.reconnect.max_attempts = net.reconnect_attempts;
    config.reconnect.initial_delay = net.reconnect_initial_delay();
    config.reconnect.max_delay = net.reconnect_max_delay();
    config.reconnect_accept_window = net.reconnect_accept_window();
    config.probe_timeout = net.probe_timeout();
    config.max_protocol_errors = net.max_protocol_errors;
    config
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config_dir = match args.config.clone() {
        Some(dir) => dir,
        None => default_config_dir().unwrap_or_else(|e| {
            eprintln!("{e}, using the working directory");
            PathBuf::from(".")
        }),
    };

    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    if let Some(path) =
        expansion_log::init_logging(Some(&log_dir), config.debug.log_to_file, Some(&config))
    {
        info!("JSON log at {}", path.display());
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    let role = to_role(config.network.role);
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    if args.local {
        let mut engine = ConsoleEngine::new(role, false);
        play_local(&mut engine, &mut input).await;
        return ExitCode::SUCCESS;
    }

    let mut engine = ConsoleEngine::new(role, true);
    if play_network(&config.network, &mut engine, &mut input).await == Outcome::Local {
        engine.go_local();
        play_local(&mut engine, &mut input).await;
    }
    ExitCode::SUCCESS
}

async fn play_network(
    net: &NetworkConfig,
    engine: &mut ConsoleEngine,
    input: &mut Input,
) -> Outcome {
    let addr = match net.socket_addr() {
        Ok(addr) => SocketAddr::V4(addr),
        Err(e) => {
            println!("{e}");
            return Outcome::Local;
        }
    };
    let mut session = Session::new(session_config(net, addr));
    info!("Starting network play as {} ({})", session.role(), session.local_id());

    // Ctrl-C cancels whatever the session is waiting on: accept, connect or
    // a reconnection in progress.
    let stop = session.stop_handle();
    let interrupt = tokio::spawn({
        let stop = stop.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stop.stop();
            }
        }
    });

    let outcome = run_network(net, addr, &mut session, engine, input, &stop).await;
    interrupt.abort();
    outcome
}

async fn run_network(
    net: &NetworkConfig,
    addr: SocketAddr,
    session: &mut Session,
    engine: &mut ConsoleEngine,
    input: &mut Input,
    stop: &StopHandle,
) -> Outcome {
    let prober = match session.role() {
        Role::Joiner => Some(ServerProber::spawn(
            addr,
            ProberConfig {
                interval: net.probe_interval(),
                timeout: net.probe_timeout(),
            },
        )),
        Role::Host => None,
    };

    if let Some(prober) = &prober {
        let mut reports = prober.subscribe();
        let first = tokio::time::timeout(
            net.probe_timeout() + net.probe_interval(),
            reports.wait_for(|r| r.status != ProbeStatus::Unknown),
        )
        .await;
        if let Ok(Ok(report)) = first {
            println!("{}", report.status_text());
        }
    } else {
        match session.listen(engine) {
            Ok(bound) => println!("Hosting on {bound}, waiting for a player (Ctrl-C to cancel)..."),
            Err(e) => {
                println!("Could not host: {e}");
                return Outcome::Local;
            }
        }
    }

    let established = session.establish(engine).await;
    if let Some(prober) = prober {
        prober.stop().await;
    }

    if let Err(e) = established {
        if stop.is_stopped() {
            return Outcome::Quit;
        }
        println!("Could not start network play: {e}");
        session.close().await;
        return Outcome::Local;
    }

    if session.role() == Role::Host {
        if let Err(e) = session.broadcast_state(engine.board.to_snapshot()).await {
            println!("Could not send the board: {e}");
            session.leave("host could not start the game").await;
            return Outcome::Local;
        }
        if let Some(owner) = session.state().local_turn_owner() {
            engine.on_turn_changed(owner, session.is_local_turn());
        }
    }
    println!("{}\nType `help` for commands.", engine.board);

    loop {
        let next = tokio::select! {
            event = session.recv() => Next::Event(event),
            line = input.next_line() => Next::Line(line),
            _ = tokio::signal::ctrl_c() => Next::Interrupt,
        };

        let flow = match next {
            Next::Event(event) => {
                session.handle_event(event, engine).await;
                session.process_events(engine).await;
                Flow::Continue
            }
            Next::Line(Ok(Some(line))) => network_command(&line, session, engine).await,
            Next::Line(Ok(None)) | Next::Interrupt => Flow::Quit,
            Next::Line(Err(e)) => {
                warn!("Reading input failed: {e}");
                Flow::Quit
            }
        };

        match flow {
            // Interrupted while reconnecting.
            Flow::Continue if stop.is_stopped() => {
                session.shutdown().await;
                return Outcome::Quit;
            }
            Flow::Continue if session.fell_back_to_local() => return Outcome::Local,
            Flow::Continue => {}
            Flow::Leave => {
                session.leave("player left network mode").await;
                return Outcome::Local;
            }
            Flow::Quit => {
                session.leave("player quit").await;
                return Outcome::Quit;
            }
        }
    }
}

async fn network_command(line: &str, session: &mut Session, engine: &mut ConsoleEngine) -> Flow {
    let command = match line.parse::<Command>() {
        Ok(command) => command,
        Err(ParseError::Empty) => return Flow::Continue,
        Err(e) => {
            println!("{e}");
            return Flow::Continue;
        }
    };

    match command {
        Command::Move(mv) => {
            if !engine.can_act() {
                println!("Not your turn.");
                return Flow::Continue;
            }
            let action = match engine.prepare_move(mv) {
                Ok(action) => action,
                Err(e) => {
                    println!("Illegal move: {e}");
                    return Flow::Continue;
                }
            };
            match session.submit_action(action.clone()).await {
                Ok(id) => match engine.commit_local_move(&action) {
                    Ok(()) => {
                        info!("Move {id} sent");
                        println!("Move sent, waiting for {}.", engine.board.current_turn);
                    }
                    Err(e) => warn!("Move {id} was sent but does not apply locally: {e}"),
                },
                Err(SubmitError::NotYourTurn { owner }) => {
                    let owner = owner.map_or_else(|| "nobody".to_string(), |r| r.to_string());
                    println!("Not your turn ({owner} to move).");
                }
                Err(e) => println!("Move not sent: {e}"),
            }
        }
        Command::Chat(text) => {
            if let Err(e) = session.send_chat(&text).await {
                println!("Chat not sent: {e}");
            }
        }
        Command::Board => println!("{}", engine.board),
        Command::Resync => match session.resync_state(engine.board.to_snapshot()).await {
            Ok(()) => println!("Board sent."),
            Err(e) => println!("Resync failed: {e}"),
        },
        Command::Help => println!("{HELP}"),
        Command::Leave => return Flow::Leave,
        Command::Quit => return Flow::Quit,
    }
    Flow::Continue
}

async fn play_local(engine: &mut ConsoleEngine, input: &mut Input) {
    println!(
        "Local game, {} to move.\n{}",
        engine.board.current_turn, engine.board
    );
    loop {
        let line = tokio::select! {
            line = input.next_line() => line,
            _ = tokio::signal::ctrl_c() => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Reading input failed: {e}");
                break;
            }
        };

        match line.parse::<Command>() {
            Ok(Command::Move(mv)) => {
                match engine
                    .prepare_move(mv)
                    .and_then(|action| engine.commit_local_move(&action))
                {
                    Ok(()) => println!("{}", engine.board),
                    Err(e) => println!("Illegal move: {e}"),
                }
            }
            Ok(Command::Board) => println!("{}", engine.board),
            Ok(Command::Help) => println!("{HELP}"),
            Ok(Command::Quit) => break,
            Ok(Command::Chat(_) | Command::Resync | Command::Leave) => {
                println!("Not in network mode.");
            }
            Err(ParseError::Empty) => {}
            Err(e) => println!("{e}"),
        }
    }
    info!("Local game ended");
}
