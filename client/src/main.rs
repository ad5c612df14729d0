use clap::Parser;
use client::clock::{Clock, GameTime};
use client::game::{Characters, GameObjects};
use client::network::{Client, ClientConfig};
use client::replay::Replay;
use client::scheduler::EventManager;
use log::{error, info};
use shared::protocol::{DEFAULT_PUBLISH_PORT, DEFAULT_REQUEST_PORT};
use shared::Event;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Peer id, unique among everyone connected to the server
    #[arg(short = 'i', long, default_value = "A")]
    id: String,

    /// Server host to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1")]
    server: String,

    #[arg(long, default_value_t = DEFAULT_REQUEST_PORT)]
    request_port: u16,

    #[arg(long, default_value_t = DEFAULT_PUBLISH_PORT)]
    publish_port: u16,

    /// How often a batch is sent, in milliseconds
    #[arg(long, default_value = "50")]
    send_interval_ms: u64,

    /// How often ready events are executed, in milliseconds
    #[arg(long, default_value = "10")]
    drain_interval_ms: u64,

    /// Reply timeout in milliseconds (0 waits forever)
    #[arg(long, default_value = "2000")]
    reply_timeout_ms: u64,

    /// Record this many seconds, then play the recording back (0 disables)
    #[arg(short = 'r', long, default_value = "0")]
    record_secs: u64,

    /// Playback speed as a multiple of real time
    #[arg(long, default_value = "1.0")]
    replay_speed: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = ClientConfig {
        self_id: args.id.clone(),
        server_host: args.server.clone(),
        request_port: args.request_port,
        publish_port: args.publish_port,
        reply_timeout: (args.reply_timeout_ms > 0)
            .then(|| Duration::from_millis(args.reply_timeout_ms)),
    };

    info!("Starting peer {}...", args.id);

    let live: Arc<dyn Clock> = Arc::new(GameTime::new(1.0));
    let playback: Arc<dyn Clock> = Arc::new(GameTime::paused(1.0));

    let mut characters = Characters::new();
    characters.create_object(&args.id, 0.0, 0.0);
    let (manager, mut notices) = EventManager::new(&args.id, Arc::clone(&live), characters);
    let manager = Arc::new(manager);

    let client = Arc::new(Client::new(&config, Arc::clone(&manager)).await?);
    client.connect().await?;

    let batches = client.spawn_subscriber();
    {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.subscribe_handler(batches).await });
    }
    {
        let manager = Arc::clone(&manager);
        let period = Duration::from_millis(args.drain_interval_ms);
        tokio::spawn(async move { manager.keep_executing_events(period).await });
    }

    let mut replay = Replay::new(Arc::clone(&live), playback, Arc::clone(&client));
    replay.reset_play_speed(args.replay_speed).await?;

    let mut recording = args.record_secs > 0;
    if recording {
        replay.start_recording().await?;
    }
    let record_deadline = tokio::time::sleep(Duration::from_secs(args.record_secs));
    tokio::pin!(record_deadline);

    let mut send_tick = interval(Duration::from_millis(args.send_interval_ms));
    send_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut step: u64 = 0;

    loop {
        tokio::select! {
            _ = send_tick.tick() => {
                step += 1;
                let now = live.current_time();
                let (x, y) = (now.cos() * 10.0, now.sin() * 10.0);
                let movement = Event::movement(now, &args.id, &args.id, x, y, step % 2 == 0);
                if !client.move_local(movement).await {
                    continue;
                }

                if let Err(e) = client.send_handler().await {
                    error!("Failed to send batch: {}", e);
                }
            }

            _ = &mut record_deadline, if recording => {
                recording = false;
                replay.end_recording().await?;
                replay.start_playing().await?;
            }

            Some(notice) = notices.recv() => {
                replay.handle_notice(notice).await?;
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, disconnecting");
                break;
            }
        }
    }

    client.disconnect(false).await?;
    Ok(())
}
