use clap::{App, Arg};
use colored::*;
use headunit::{HeadUnit, HeadUnitConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time;
use tracing::{debug, error, info, warn, Level};

const DEFAULT_PORT: &str = "8090";
const DEFAULT_TICK_MS: &str = "100";
const NOTIFICATION_BROADCAST_BUFFER_SIZE: usize = 256;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("headunit-simulator")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Simulated head unit peripherals served over TCP")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("seed")
                .short("s")
                .long("seed")
                .value_name("SEED")
                .help("Fixed random seed for reproducible runs")
                .takes_value(true)
                .validator(|v| v.parse::<u64>().map(|_| ()).map_err(|_| "Seed must be a number".into())),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("TCP port for UI clients")
                .takes_value(true)
                .default_value(DEFAULT_PORT),
        )
        .arg(
            Arg::with_name("tick-ms")
                .long("tick-ms")
                .value_name("MS")
                .help("Event loop period")
                .takes_value(true)
                .default_value(DEFAULT_TICK_MS)
                .validator(|v| match v.parse::<u64>() {
                    Ok(ms) if ms > 0 => Ok(()),
                    _ => Err("Tick period must be a positive number".into()),
                }),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log every notification"),
        )
        .get_matches();

    let verbose = matches.is_present("verbose");
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut config = match matches.value_of("config") {
        Some(path) => HeadUnitConfig::load(Path::new(path))?,
        None => HeadUnitConfig::default(),
    };
    if let Some(seed) = matches.value_of("seed") {
        config.seed = Some(seed.parse()?);
    }
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let tick_ms: u64 = matches.value_of("tick-ms").unwrap_or(DEFAULT_TICK_MS).parse()?;

    println!("{}", "Head Unit Hardware Simulator".bright_blue().bold());
    println!("{}", "============================".bright_blue());
    println!("{} {}", "State directory:".bright_white(), config.config_dir.display());
    if let Some(seed) = config.seed {
        println!("{} {}", "Seed:".bright_white(), seed);
    }

    let unit = Arc::new(Mutex::new(HeadUnit::new(config)));
    unit.lock().await.start();

    let (notification_tx, _) = broadcast::channel(NOTIFICATION_BROADCAST_BUFFER_SIZE);

    let tcp_unit = Arc::clone(&unit);
    let tcp_notification_tx = notification_tx.clone();
    let tcp_server = tokio::spawn(async move {
        if let Err(e) = start_tcp_server(port, tcp_unit, tcp_notification_tx).await {
            error!("TCP server error: {}", e);
        }
    });

    let mut interval = time::interval(Duration::from_millis(tick_ms));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                break;
            }
        }

        let notifications = {
            let mut guard = unit.lock().await;
            if let Err(e) = guard.update() {
                error!("Head unit error: {}", e);
            }
            if !guard.is_running() {
                break;
            }
            guard.drain_notifications()
        };

        for notification in notifications {
            match serde_json::to_string(&notification) {
                Ok(line) => {
                    if verbose {
                        debug!("{}", line);
                    }
                    // No subscribers is not an error
                    let _ = notification_tx.send(line);
                }
                Err(e) => warn!("Cannot serialize notification: {}", e),
            }
        }
    }

    unit.lock().await.stop();
    tcp_server.abort();
    println!("{}", "Head unit simulator stopped".bright_green());

    Ok(())
}

async fn start_tcp_server(
    port: u16,
    unit: Arc<Mutex<HeadUnit>>,
    notification_tx: broadcast::Sender<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!("TCP server listening on port {}", port);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("UI client connected: {}", addr);
                let client_unit = Arc::clone(&unit);
                let client_rx = notification_tx.subscribe();

                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client_unit, client_rx).await {
                        warn!("Client {} error: {}", addr, e);
                    }
                    info!("UI client {} disconnected", addr);
                });
            }
            Err(e) => error!("Failed to accept connection: {}", e),
        }
    }
}

/// One JSON command per line in, one response per line out, with
/// notifications interleaved as they are produced.
async fn handle_client(
    stream: TcpStream,
    unit: Arc<Mutex<HeadUnit>>,
    mut notification_rx: broadcast::Receiver<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let writer = Arc::new(Mutex::new(writer));

    let notification_writer = Arc::clone(&writer);
    let notification_task = tokio::spawn(async move {
        loop {
            match notification_rx.recv().await {
                Ok(line) => {
                    let mut guard = notification_writer.lock().await;
                    if guard.write_all(line.as_bytes()).await.is_err() || guard.write_all(b"\n").await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Slow client missed {} notifications", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = {
            let mut guard = unit.lock().await;
            guard.handle_json(trimmed)?
        };
        debug!("Command {} -> {}", trimmed, response);

        let mut guard = writer.lock().await;
        guard.write_all(response.as_bytes()).await?;
        guard.write_all(b"\n").await?;
    }

    notification_task.abort();
    Ok(())
}
