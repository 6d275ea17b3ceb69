use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use headunit::config::DEFAULT_MEDIA_FORMATS;
use headunit::fault_injection::InjectedFault;
use headunit::protocol::{Command, CommandType};
use headunit::subsystems::usb::media::scan_directory;
use headunit::subsystems::{DeviceType, SensorChannel, SubsystemId};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8090";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

struct Target<'a> {
    host: &'a str,
    port: u16,
    format: &'a str,
}

#[tokio::main]
async fn main() -> CliResult {
    let on_off = ["on", "off", "enable", "disable"];
    let channels = ["temperature", "humidity", "pressure", "light"];
    let subsystems = ["sensor", "bluetooth", "usb"];

    let matches = App::new("headunit")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Command-line client for the head unit hardware simulator")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .long("host")
                .value_name("HOST")
                .help("Simulator host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Simulator port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .subcommand(SubCommand::with_name("ping").about("Check that the simulator is responsive"))
        .subcommand(SubCommand::with_name("status").about("Summary of every subsystem"))
        .subcommand(
            SubCommand::with_name("sensor")
                .about("Environmental sensor")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(SubCommand::with_name("read").about("Current reading"))
                .subcommand(SubCommand::with_name("connect").about("Open the I2C device"))
                .subcommand(SubCommand::with_name("disconnect").about("Close the I2C device"))
                .subcommand(
                    SubCommand::with_name("register")
                        .about("Read one register")
                        .arg(Arg::with_name("register").required(true).help("Register number, e.g. 0x02")),
                )
                .subcommand(
                    SubCommand::with_name("calibrate")
                        .about("Set a channel offset")
                        .arg(Arg::with_name("channel").required(true).possible_values(&channels))
                        .arg(Arg::with_name("offset").required(true).allow_hyphen_values(true)),
                )
                .subcommand(
                    SubCommand::with_name("range")
                        .about("Set a channel range")
                        .arg(Arg::with_name("channel").required(true).possible_values(&channels))
                        .arg(Arg::with_name("min").required(true).allow_hyphen_values(true))
                        .arg(Arg::with_name("max").required(true).allow_hyphen_values(true)),
                )
                .subcommand(
                    SubCommand::with_name("interval")
                        .about("Set the update interval")
                        .arg(Arg::with_name("ms").required(true)),
                )
                .subcommand(
                    SubCommand::with_name("logging")
                        .about("Toggle the reading log")
                        .arg(Arg::with_name("state").required(true).possible_values(&on_off)),
                ),
        )
        .subcommand(
            SubCommand::with_name("bt")
                .about("Bluetooth radio")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(SubCommand::with_name("init").about("Bring the radio up"))
                .subcommand(
                    SubCommand::with_name("discover")
                        .about("Start or stop discovery")
                        .arg(Arg::with_name("state").required(true).possible_values(&["start", "stop"])),
                )
                .subcommand(SubCommand::with_name("list").about("Available and paired devices"))
                .subcommand(
                    SubCommand::with_name("appear")
                        .about("Make a device show up")
                        .arg(Arg::with_name("name").required(true))
                        .arg(Arg::with_name("type").required(true).help("phone, headset, speaker, car-audio, smartwatch, tablet or laptop")),
                )
                .subcommand(SubCommand::with_name("vanish").about("Make a device go away").arg(Arg::with_name("device").required(true)))
                .subcommand(SubCommand::with_name("pair").about("Pair with a device").arg(Arg::with_name("device").required(true)))
                .subcommand(SubCommand::with_name("unpair").about("Forget a device").arg(Arg::with_name("device").required(true)))
                .subcommand(SubCommand::with_name("connect").about("Connect a paired device").arg(Arg::with_name("device").required(true)))
                .subcommand(SubCommand::with_name("disconnect").about("Drop a connection").arg(Arg::with_name("device").required(true)))
                .subcommand(
                    SubCommand::with_name("profile")
                        .about("Enable or disable a profile")
                        .arg(Arg::with_name("device").required(true))
                        .arg(Arg::with_name("profile").required(true))
                        .arg(Arg::with_name("state").required(true).possible_values(&on_off)),
                )
                .subcommand(
                    SubCommand::with_name("signal")
                        .about("Override signal strength")
                        .arg(Arg::with_name("device").required(true))
                        .arg(Arg::with_name("strength").required(true).allow_hyphen_values(true)),
                ),
        )
        .subcommand(
            SubCommand::with_name("usb")
                .about("Removable media")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(SubCommand::with_name("list").about("Known devices"))
                .subcommand(SubCommand::with_name("insert").about("Plug in a device").arg(Arg::with_name("name").required(true)))
                .subcommand(SubCommand::with_name("remove").about("Pull a device").arg(Arg::with_name("device")))
                .subcommand(
                    SubCommand::with_name("mount")
                        .about("Mount a device at a directory")
                        .arg(Arg::with_name("device").required(true))
                        .arg(Arg::with_name("path").required(true)),
                )
                .subcommand(SubCommand::with_name("unmount").about("Unmount a device").arg(Arg::with_name("device").required(true)))
                .subcommand(SubCommand::with_name("scan").about("Rescan a device").arg(Arg::with_name("device").required(true)))
                .subcommand(SubCommand::with_name("media").about("Media on a device").arg(Arg::with_name("device").required(true)))
                .subcommand(
                    SubCommand::with_name("formats")
                        .about("Replace the supported extensions")
                        .arg(Arg::with_name("format").required(true).multiple(true)),
                ),
        )
        .subcommand(
            SubCommand::with_name("fault")
                .about("Error injection")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(
                    SubCommand::with_name("inject")
                        .about("Arm or disarm a fault")
                        .arg(Arg::with_name("fault").required(true).help("e.g. sensor_failure, radio_off, mount_error"))
                        .arg(Arg::with_name("state").required(true).possible_values(&on_off))
                        .arg(
                            Arg::with_name("device")
                                .long("device")
                                .takes_value(true)
                                .help("Limit pairing/connection errors to one device"),
                        ),
                )
                .subcommand(
                    SubCommand::with_name("clear")
                        .about("Disarm faults")
                        .arg(Arg::with_name("subsystem").possible_values(&subsystems)),
                )
                .subcommand(SubCommand::with_name("status").about("Armed faults and counters")),
        )
        .subcommand(SubCommand::with_name("monitor").about("Stream notifications until interrupted"))
        .subcommand(
            SubCommand::with_name("inspect")
                .about("Scan a local directory for media without a running simulator")
                .arg(Arg::with_name("dir").required(true)),
        )
        .get_matches();

    let target = Target {
        host: matches.value_of("host").unwrap_or(DEFAULT_HOST),
        port: matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?,
        format: matches.value_of("format").unwrap_or("table"),
    };

    match matches.subcommand() {
        ("ping", _) => run(&target, "Ping", CommandType::Ping).await,
        ("status", _) => handle_status(&target).await,
        ("sensor", Some(sub)) => handle_sensor(&target, sub).await,
        ("bt", Some(sub)) => handle_bluetooth(&target, sub).await,
        ("usb", Some(sub)) => handle_usb(&target, sub).await,
        ("fault", Some(sub)) => handle_fault(&target, sub).await,
        ("monitor", _) => monitor(&target).await,
        ("inspect", Some(sub)) => inspect(Path::new(arg(sub, "dir")?), target.format),
        _ => Ok(()),
    }
}

async fn handle_status(target: &Target<'_>) -> CliResult {
    let response = send_command(target, CommandType::SystemStatus).await?;
    if target.format != "table" {
        return print_result("Status", &response, target.format);
    }

    let data = &response["data"];
    let flag = |v: &Value| if v.as_bool().unwrap_or(false) { "up".bright_green() } else { "down".red() };
    println!("{}", "Head Unit Status".bright_blue().bold());
    println!("{}", "════════════════".bright_blue());
    println!("{:<12} {}", "Sensor:".bright_white(), flag(&data["sensor"]["connected"]));
    let reading = &data["sensor"]["reading"];
    println!(
        "             {:.1} °C  {:.1} %  {:.1} hPa  {:.0} lux",
        reading["temperature"].as_f64().unwrap_or_default(),
        reading["humidity"].as_f64().unwrap_or_default(),
        reading["pressure"].as_f64().unwrap_or_default(),
        reading["light_level"].as_f64().unwrap_or_default(),
    );
    println!(
        "{:<12} {}  discovering: {}  available: {}  paired: {}",
        "Bluetooth:".bright_white(),
        flag(&data["bluetooth"]["initialized"]),
        data["bluetooth"]["discovering"],
        data["bluetooth"]["available_devices"],
        data["bluetooth"]["paired_devices"],
    );
    println!(
        "{:<12} {}  connected: {}  known: {}",
        "USB:".bright_white(),
        flag(&data["usb"]["monitoring"]),
        data["usb"]["connected_devices"],
        data["usb"]["known_devices"],
    );
    for subsystem in ["sensor", "bluetooth", "usb"] {
        if let Some(armed) = data[subsystem]["armed_faults"].as_array().filter(|a| !a.is_empty()) {
            let names: Vec<&str> = armed.iter().filter_map(Value::as_str).collect();
            println!("{} {} faults armed: {}", "⚠".yellow(), subsystem, names.join(", ").yellow());
        }
    }
    Ok(())
}

async fn handle_sensor(target: &Target<'_>, matches: &ArgMatches<'_>) -> CliResult {
    let (action, command_type) = match matches.subcommand() {
        ("read", _) => ("Sensor read", CommandType::SensorRead),
        ("connect", _) => ("Sensor connect", CommandType::SensorConnect { address: None }),
        ("disconnect", _) => ("Sensor disconnect", CommandType::SensorDisconnect),
        ("register", Some(sub)) => (
            "Register read",
            CommandType::SensorReadRegister {
                register: parse_register(arg(sub, "register")?)?,
            },
        ),
        ("calibrate", Some(sub)) => (
            "Calibration",
            CommandType::SensorCalibrate {
                channel: parse_channel(sub)?,
                offset: arg(sub, "offset")?.parse()?,
            },
        ),
        ("range", Some(sub)) => (
            "Range",
            CommandType::SensorSetRange {
                channel: parse_channel(sub)?,
                min: arg(sub, "min")?.parse()?,
                max: arg(sub, "max")?.parse()?,
            },
        ),
        ("interval", Some(sub)) => (
            "Update interval",
            CommandType::SensorSetUpdateInterval {
                interval_ms: arg(sub, "ms")?.parse()?,
            },
        ),
        ("logging", Some(sub)) => (
            "Data logging",
            CommandType::SensorSetDataLogging {
                enabled: normalize_state(arg(sub, "state")?),
            },
        ),
        _ => return Ok(()),
    };
    run(target, action, command_type).await
}

async fn handle_bluetooth(target: &Target<'_>, matches: &ArgMatches<'_>) -> CliResult {
    let device = |sub: &ArgMatches<'_>| arg(sub, "device").map(str::to_string);
    let (action, command_type) = match matches.subcommand() {
        ("init", _) => ("Bluetooth initialize", CommandType::BluetoothInitialize),
        ("discover", Some(sub)) => match arg(sub, "state")? {
            "start" => ("Discovery start", CommandType::StartDiscovery),
            _ => ("Discovery stop", CommandType::StopDiscovery),
        },
        ("list", _) => return list_bluetooth(target).await,
        ("appear", Some(sub)) => {
            let device_type: DeviceType = arg(sub, "type")?.parse()?;
            (
                "Device appearance",
                CommandType::SimulateDeviceAppearance {
                    name: arg(sub, "name")?.to_string(),
                    device_type: device_type.to_string(),
                },
            )
        }
        ("vanish", Some(sub)) => ("Device disappearance", CommandType::SimulateDeviceDisappearance { device_id: device(sub)? }),
        ("pair", Some(sub)) => ("Pair", CommandType::Pair { device_id: device(sub)? }),
        ("unpair", Some(sub)) => ("Unpair", CommandType::Unpair { device_id: device(sub)? }),
        ("connect", Some(sub)) => ("Connect", CommandType::Connect { device_id: device(sub)? }),
        ("disconnect", Some(sub)) => ("Disconnect", CommandType::Disconnect { device_id: device(sub)? }),
        ("profile", Some(sub)) => {
            let device_id = device(sub)?;
            let profile = arg(sub, "profile")?.to_string();
            if normalize_state(arg(sub, "state")?) {
                ("Profile enable", CommandType::EnableProfile { device_id, profile })
            } else {
                ("Profile disable", CommandType::DisableProfile { device_id, profile })
            }
        }
        ("signal", Some(sub)) => (
            "Signal strength",
            CommandType::UpdateSignalStrength {
                device_id: device(sub)?,
                strength: arg(sub, "strength")?.parse()?,
            },
        ),
        _ => return Ok(()),
    };
    run(target, action, command_type).await
}

async fn list_bluetooth(target: &Target<'_>) -> CliResult {
    let response = send_command(target, CommandType::ListBluetoothDevices).await?;
    if target.format != "table" {
        return print_result("Device list", &response, target.format);
    }

    for (title, key) in [("Available", "available"), ("Paired", "paired")] {
        println!("{}", title.bright_blue().bold());
        let devices = response["data"][key].as_array().cloned().unwrap_or_default();
        if devices.is_empty() {
            println!("  {}", "none".dimmed());
        }
        for device in devices {
            println!(
                "  {:<18} {:<24} {:<18} signal {:>3}  state {}",
                device["deviceId"].as_str().unwrap_or("?").bright_cyan(),
                device["deviceName"].as_str().unwrap_or("?"),
                device["deviceAddress"].as_str().unwrap_or("?").dimmed(),
                device["signalStrength"],
                device["connectionState"],
            );
        }
    }
    Ok(())
}

async fn handle_usb(target: &Target<'_>, matches: &ArgMatches<'_>) -> CliResult {
    let device = |sub: &ArgMatches<'_>| arg(sub, "device").map(str::to_string);
    let (action, command_type) = match matches.subcommand() {
        ("list", _) => ("Device list", CommandType::ListUsbDevices),
        ("insert", Some(sub)) => (
            "Insertion",
            CommandType::SimulateUsbInsertion {
                name: arg(sub, "name")?.to_string(),
            },
        ),
        ("remove", Some(sub)) => (
            "Removal",
            CommandType::SimulateUsbRemoval {
                device_id: sub.value_of("device").map(str::to_string),
            },
        ),
        ("mount", Some(sub)) => (
            "Mount",
            CommandType::Mount {
                device_id: device(sub)?,
                mount_point: PathBuf::from(arg(sub, "path")?),
            },
        ),
        ("unmount", Some(sub)) => ("Unmount", CommandType::Unmount { device_id: device(sub)? }),
        ("scan", Some(sub)) => ("Scan", CommandType::ScanMedia { device_id: device(sub)? }),
        ("media", Some(sub)) => ("Media list", CommandType::ListMedia { device_id: device(sub)? }),
        ("formats", Some(sub)) => (
            "Supported formats",
            CommandType::SetSupportedFormats {
                formats: sub.values_of("format").map(|v| v.map(str::to_string).collect()).unwrap_or_default(),
            },
        ),
        _ => return Ok(()),
    };

    if matches!(command_type, CommandType::ScanMedia { .. } | CommandType::ListMedia { .. }) && target.format == "table" {
        let response = send_command(target, command_type).await?;
        match response["data"].as_array() {
            Some(files) if response["status"] == "Success" => print_media_table(files),
            _ => print_result(action, &response, target.format)?,
        }
        return Ok(());
    }
    run(target, action, command_type).await
}

async fn handle_fault(target: &Target<'_>, matches: &ArgMatches<'_>) -> CliResult {
    let (action, command_type) = match matches.subcommand() {
        ("inject", Some(sub)) => {
            let fault: InjectedFault = serde_json::from_value(Value::from(arg(sub, "fault")?))
                .map_err(|_| format!("Unknown fault '{}'", arg(sub, "fault").unwrap_or_default()))?;
            (
                "Fault injection",
                CommandType::InjectFault {
                    fault,
                    enabled: normalize_state(arg(sub, "state")?),
                    device_id: sub.value_of("device").map(str::to_string),
                },
            )
        }
        ("clear", Some(sub)) => {
            let target_subsystem: Option<SubsystemId> = match sub.value_of("subsystem") {
                Some(name) => Some(serde_json::from_value(Value::from(name))?),
                None => None,
            };
            ("Fault clear", CommandType::ClearFaults { target: target_subsystem })
        }
        ("status", _) => ("Fault status", CommandType::GetFaultInjectionStatus),
        _ => return Ok(()),
    };
    run(target, action, command_type).await
}

async fn monitor(target: &Target<'_>) -> CliResult {
    let stream = connect(target).await?;
    let mut lines = BufReader::new(stream).lines();
    println!("{}", "Streaming notifications (Ctrl+C to stop)...".bright_blue().bold());

    while let Some(line) = lines.next_line().await? {
        let Ok(notification) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        if target.format == "json" {
            println!("{}", line);
            continue;
        }
        let subsystem = notification["subsystem"].as_str().unwrap_or("?");
        let kind = notification["event"]["type"].as_str().unwrap_or("?");
        let colored_subsystem = match subsystem {
            "sensor" => subsystem.bright_green(),
            "bluetooth" => subsystem.bright_blue(),
            _ => subsystem.bright_magenta(),
        };
        if target.format == "compact" {
            println!("{} {}", colored_subsystem, kind);
        } else {
            println!("{:<10} {:<26} {}", colored_subsystem, kind.bright_white(), notification["event"]["data"]);
        }
    }
    Ok(())
}

fn inspect(dir: &Path, format: &str) -> CliResult {
    let formats: Vec<String> = DEFAULT_MEDIA_FORMATS.iter().map(|f| (*f).to_string()).collect();
    let files = scan_directory(dir, &formats)?;
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&files)?);
        return Ok(());
    }
    let values: Vec<Value> = files.iter().map(serde_json::to_value).collect::<Result<_, _>>()?;
    print_media_table(&values);
    Ok(())
}

fn print_media_table(files: &[Value]) {
    if files.is_empty() {
        println!("{}", "No media files".dimmed());
        return;
    }
    println!(
        "{}",
        format!("{:<32} {:<24} {:<28} {:>6} {:>10}", "File", "Artist", "Title", "Length", "Size").bright_white().bold()
    );
    for file in files {
        println!(
            "{:<32} {:<24} {:<28} {:>6} {:>10}",
            file["fileName"].as_str().unwrap_or("?").bright_cyan(),
            file["artist"].as_str().unwrap_or("?"),
            file["title"].as_str().unwrap_or("?"),
            file["duration"].as_str().unwrap_or("?"),
            file["fileSize"].as_u64().unwrap_or_default(),
        );
    }
}

async fn run(target: &Target<'_>, action: &str, command_type: CommandType) -> CliResult {
    let response = send_command(target, command_type).await?;
    print_result(action, &response, target.format)
}

fn print_result(action: &str, response: &Value, format: &str) -> CliResult {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(response)?),
        "compact" => println!("{}", response["status"].as_str().unwrap_or("Unknown")),
        _ => {
            let message = response["message"].as_str().unwrap_or_default();
            match response["status"].as_str().unwrap_or("Unknown") {
                "Success" => {
                    println!("{} {}", "✅".green(), action.bright_white());
                    match &response["data"] {
                        Value::Null => {}
                        Value::String(s) => println!("   {}", s.bright_cyan()),
                        data => println!("{}", serde_json::to_string_pretty(data)?),
                    }
                }
                "NegativeAck" | "InvalidCommand" => {
                    println!("{} {} rejected: {}", "❌".red(), action.bright_white(), message.bright_red());
                }
                status => {
                    println!("{} {} {}: {}", "⚠️".yellow(), action.bright_white(), status.to_lowercase(), message.bright_red());
                }
            }
        }
    }
    Ok(())
}

async fn connect(target: &Target<'_>) -> CliResult<TcpStream> {
    let addr = format!("{}:{}", target.host, target.port);
    match TcpStream::connect(&addr).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            eprintln!("{} Failed to connect to head unit simulator at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Start it with: {}", "💡".yellow(), "headunit-simulator".bright_cyan());
            }
            Err(e.into())
        }
    }
}

/// Send one command and wait for its response, skipping notifications the
/// server interleaves on the same connection.
async fn send_command(target: &Target<'_>, command_type: CommandType) -> CliResult<Value> {
    let command = Command {
        id: next_command_id(),
        command_type,
    };
    let stream = connect(target).await?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let exchange = async {
        writer.write_all(serde_json::to_string(&command)?.as_bytes()).await?;
        writer.write_all(b"\n").await?;

        while let Some(line) = lines.next_line().await? {
            let Ok(value) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            if value.get("status").is_some() && value["id"] == command.id {
                return Ok(value);
            }
        }
        Err::<Value, Box<dyn std::error::Error>>("Server closed connection".into())
    };

    match tokio::time::timeout(COMMAND_TIMEOUT, exchange).await {
        Ok(result) => result,
        Err(_) => {
            eprintln!("{} Command timed out after {} seconds", "⏰".yellow(), COMMAND_TIMEOUT.as_secs());
            Err("Command timeout".into())
        }
    }
}

fn next_command_id() -> u32 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    (millis as u32).max(1)
}

fn arg<'a>(matches: &'a ArgMatches<'_>, name: &str) -> CliResult<&'a str> {
    matches
        .value_of(name)
        .ok_or_else(|| format!("missing argument <{name}>").into())
}

fn parse_channel(matches: &ArgMatches<'_>) -> CliResult<SensorChannel> {
    Ok(arg(matches, "channel")?.parse()?)
}

fn parse_register(value: &str) -> CliResult<u8> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => Ok(u8::from_str_radix(hex, 16)?),
        None => Ok(value.parse()?),
    }
}

fn normalize_state(state: &str) -> bool {
    matches!(state, "on" | "enable")
}
