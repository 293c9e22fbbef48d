//! Demo binary that runs a replicated drone session over TCP.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Run `cargo run -p tidal-demo -- host` in one terminal and
//! `cargo run -p tidal-demo -- join --name Nova` in another.

mod drone;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tidal_config::{CliArgs, Command, Config};
use tidal_net::{FrameConfig, TcpTransport, TransportError};
use tidal_sync::{
    ActionKind, Client, ClientDirectory, ClientId, DeltaBridge, EntityId, NetSession,
    ReconciliationEngine, RecordEvent, Replicated, SessionConfig, SessionError, SyncError,
};
use tracing::{error, info};

use crate::drone::Drone;

#[derive(Debug, thiserror::Error)]
enum DemoError {
    #[error("invalid host endpoint '{0}'")]
    Endpoint(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// The drone this process simulates, once it has an identity to own it.
struct LocalDrone {
    body: Drone,
    bridge: DeltaBridge,
}

fn main() {
    let args = CliArgs::parse();

    // Resolve config directory
    let config_dir = args
        .config
        .clone()
        .or_else(|| Config::default_dir().ok())
        .unwrap_or_else(|| PathBuf::from(".tidal"));

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    let mut log = match tidal_log::init_logging(&config, Some(&log_dir)) {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let result = run(&args, &config);
    if let Err(e) = &result {
        error!("{e}");
    }
    if let Some(handle) = log.as_mut() {
        let _ = handle.flush();
    }
    if result.is_err() {
        std::process::exit(1);
    }
}

fn run(args: &CliArgs, config: &Config) -> Result<(), DemoError> {
    let endpoint = config.host_endpoint();
    let addr: SocketAddr = endpoint
        .parse()
        .map_err(|_| DemoError::Endpoint(endpoint.clone()))?;

    let transport = TcpTransport::new(FrameConfig {
        max_payload_size: config.network.max_frame_bytes,
    })?;
    let directory = Arc::new(ClientDirectory::new(Client::new(
        ClientId::HOST,
        config.network.client_name.clone(),
    )));
    let mut engine = ReconciliationEngine::from_config(Arc::clone(&directory), &config.sync)?;
    let mut session = NetSession::new(transport, directory, SessionConfig::from(config));
    let events = engine.subscribe();

    match args.command {
        Command::Host => {
            session.host(addr)?;
        }
        Command::Join => {
            session.join(addr)?;
        }
    }

    let tick_rate = config.sync.tick_rate.max(1);
    let frame = Duration::from_secs_f64(1.0 / f64::from(tick_rate));
    let mut local: Option<LocalDrone> = None;
    let mut ticks: u64 = 0;

    info!("Running at {tick_rate} ticks/s");
    loop {
        let started = Instant::now();
        session.poll(&mut engine);

        let joined = args.command == Command::Host || session.is_active();
        if joined && local.is_none() {
            local = Some(spawn_drone(&mut session, &mut engine)?);
        }
        if args.command == Command::Join && !joined && session.host_peer().is_none() {
            info!("Host is gone; shutting down");
            break;
        }

        if let Some(drone) = local.as_mut() {
            drone.body.step(frame.as_secs_f64());
            let me = session.directory().local();
            drone.bridge.end_tick(&mut drone.body, &mut engine, &me);
            if let Some(record) = engine.get(drone.bridge.entity()).cloned() {
                session.submit(&mut engine, record, ActionKind::Update)?;
            }
        }

        engine.update();
        for event in events.try_iter() {
            match event {
                RecordEvent::Added { requestor, record } => info!(
                    "+ {} {} (owner {}, via {})",
                    record.type_name(),
                    record.id(),
                    record.owner(),
                    requestor.name
                ),
                RecordEvent::Destroyed { record, .. } => {
                    info!("- {} {}", record.type_name(), record.id())
                }
            }
        }

        ticks += 1;
        if ticks % u64::from(tick_rate) == 0 {
            info!(
                "tick {ticks}: {} records, {} pending, {} peers",
                engine.len(),
                engine.pending_len(),
                session.active_peers().len()
            );
        }
        if args.ticks.is_some_and(|limit| ticks >= limit) {
            break;
        }

        if let Some(rest) = frame.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    if let Some(drone) = local {
        if let Some(record) = engine.get(drone.bridge.entity()).cloned() {
            session.submit(&mut engine, record, ActionKind::Destroy)?;
        }
        engine.update();
    }
    session.stop(&mut engine);
    info!("Stopped after {ticks} ticks");
    Ok(())
}

fn spawn_drone(
    session: &mut NetSession<TcpTransport>,
    engine: &mut ReconciliationEngine,
) -> Result<LocalDrone, DemoError> {
    let me = session.directory().local();
    let id = EntityId((u64::from(me.id.0) << 32) | 1);
    let body = Drone::random();
    session.submit(engine, body.to_record(id, me.id), ActionKind::Create)?;
    engine.update();
    info!("Spawned drone {id} for {}", me.name);
    Ok(LocalDrone {
        body,
        bridge: DeltaBridge::new(id),
    })
}
