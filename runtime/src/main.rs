use clap::Parser;
use log::{info, warn};
use rand::Rng;
use runtime::{
    spawn, ConfigError, GameDefinition, LobbyConfig, LobbyState, MemoryNetwork, MemoryTransport,
    Phase, PhaseChange, Room, RoomHandle, RuntimeConfig, Transport,
};
use shared::Value;
use tokio::time::{sleep, Duration, Instant};

/// Main-method of the simulator.
/// Runs a host and a number of clients over an in-process network, plays a
/// few rounds of dice and reports whether every mirror converged.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Participants including the host
        #[clap(short, long, default_value = "4")]
        players: usize,
        /// Players required before the game may start
        #[clap(short, long, default_value = "2")]
        min_players: usize,
        /// Start automatically this long after enough players are present
        #[clap(short, long)]
        auto_start_ms: Option<u64>,
        /// Host sync cadence in milliseconds
        #[clap(short, long, default_value = "13")]
        sync_ms: u64,
        /// How long to keep playing after the last roll
        #[clap(short, long, default_value = "500")]
        duration_ms: u64,
        /// Rolls per player
        #[clap(short, long, default_value = "3")]
        rolls: usize,
        /// Fail on usage errors instead of logging them
        #[clap(long)]
        strict: bool,
    }

    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    if args.players == 0 {
        return Err("at least one participant is required".into());
    }

    let config = RuntimeConfig::default()
        .with_sync_interval(Duration::from_millis(args.sync_ms))
        .strict(args.strict);
    let mut lobby = LobbyConfig::new(args.min_players)
        .with_max_players(args.players)
        .require_all_ready(true);
    if let Some(ms) = args.auto_start_ms {
        lobby = lobby.with_auto_start(Duration::from_millis(ms));
    }

    let network = MemoryNetwork::new();
    let mut rooms = Vec::with_capacity(args.players);
    for index in 0..args.players {
        let id = if index == 0 {
            "host".to_string()
        } else {
            format!("player-{}", index)
        };
        let transport = network.connect(id.as_str())?;
        let room = Room::new(dice_game(lobby.clone())?, transport, config.clone())?;
        rooms.push((id, spawn(room, None)?));
    }

    tokio::select! {
        result = play(&rooms, args.rolls, Duration::from_millis(args.duration_ms)) => result?,
        _ = tokio::signal::ctrl_c() => {
            println!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    for (_, handle) in rooms {
        handle.destroy().await;
    }

    Ok(())
}

/// Dice: every roll adds one die to the roller's score while the game runs
fn dice_game(lobby: LobbyConfig) -> Result<GameDefinition, ConfigError> {
    GameDefinition::builder()
        .setup(|players, _| {
            let mut scores = Value::map();
            for player in players {
                scores.insert(player.as_str(), 0);
            }
            let mut state = Value::map();
            state.insert("scores", scores);
            state.insert("rolls", Vec::<Value>::new());
            state
        })
        .action("roll", |state, ctx, _| {
            if LobbyState::read(state).map(|lobby| lobby.phase) != Some(Phase::Playing) {
                return;
            }
            let face: i64 = ctx.random.gen_range(1..=6);

            if let Some(scores) = state.get_mut("scores") {
                let total = scores
                    .get(ctx.player_id.as_str())
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                scores.insert(ctx.player_id.as_str(), total + face);
            }
            if let Some(rolls) = state.get_mut("rolls").and_then(Value::as_array_mut) {
                let mut entry = Value::map();
                entry.insert("player", ctx.player_id.as_str());
                entry.insert("face", face);
                rolls.push(entry);
            }
        })
        .on_player_join(|state, player| {
            if let Some(scores) = state.get_mut("scores") {
                scores.insert(player, 0);
            }
        })
        .on_player_leave(|state, player| {
            if let Some(scores) = state.get_mut("scores") {
                scores.remove(player);
            }
        })
        .on_phase_change(|state, change: &PhaseChange| {
            if change.to != Phase::Ended {
                return;
            }
            let winner = state
                .get("scores")
                .and_then(Value::as_map)
                .and_then(|scores| {
                    scores
                        .iter()
                        .filter_map(|(player, score)| score.as_i64().map(|s| (s, player.clone())))
                        .max()
                })
                .map(|(_, player)| player);
            if let Some(winner) = winner {
                state.insert("winner", winner);
            }
        })
        .lobby(lobby)
        .build()
}

async fn play(
    rooms: &[(String, RoomHandle<MemoryTransport>)],
    rolls: usize,
    settle: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some((_, host)) = rooms.first() else {
        return Ok(());
    };

    host.wait_for_players(rooms.len(), Some(Duration::from_secs(5)))
        .await?;
    info!("All {} players present", rooms.len());

    for (_, handle) in rooms {
        handle.with(|room| room.set_ready(true)).await?;
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while host.with(|room| room.phase()).await != Some(Phase::Playing) {
        if Instant::now() >= deadline {
            return Err("game did not start".into());
        }
        sleep(Duration::from_millis(10)).await;
    }

    for _ in 0..rolls {
        for (_, handle) in rooms {
            handle.submit_action("roll", Value::Null, None).await?;
        }
    }

    sleep(settle).await;
    host.with(|room| room.request_end()).await?;
    sleep(settle).await;

    report(rooms).await;
    Ok(())
}

async fn report(rooms: &[(String, RoomHandle<MemoryTransport>)]) {
    let Some((host_id, host)) = rooms.first() else {
        return;
    };
    let authoritative = host.state().await;

    let mut converged = 0;
    for (id, handle) in &rooms[1..] {
        if handle.state().await == authoritative {
            converged += 1;
        } else {
            warn!("{} diverged from {}", id, host_id);
        }
    }

    let phase = host.with(|room| room.phase()).await;
    println!("Phase: {:?}", phase);
    if let Some(scores) = authoritative.get("scores") {
        println!("Scores: {}", scores);
    }
    if let Some(winner) = authoritative.get("winner").and_then(Value::as_str) {
        println!("Winner: {}", winner);
    }
    println!("{}/{} clients converged", converged, rooms.len() - 1);

    if let Some(metrics) = host.with(|room| room.transport().metrics()).await {
        println!(
            "Host sent {} messages ({} bytes) to {} peers",
            metrics.messages_sent, metrics.bytes_sent, metrics.peer_count
        );
    }
}
