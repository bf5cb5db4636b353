use clap::{App, Arg};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use wick::logging;
use zigcat::config::Config;
use zigcat::exec::{self, ExecConfig, ServeListener};
use zigcat::net::broker::{Broker, BrokerMode};
use zigcat::net::pool::BufferPool;
use zigcat::net::stream::Listener;
use zigcat::shutdown;

/// Process-wide relay buffer pool sizing.
const POOL_MAX_BYTES: usize = 4 * 1024 * 1024;
const POOL_FLOW_FRACTION: f64 = 0.8;

fn main() {
    let matches = App::new("zigcat")
        .version("0.1.0")
        .author("ZigCat contributors")
        .about("Network relay multitool: broker, chat relay and exec modes.")
        .arg(
            Arg::with_name("MODE")
                .help("One of: broker, chat, exec")
                .required(true),
        )
        .arg(
            Arg::with_name("ADDRESS")
                .help("Listen address, ip:port or unix:<path>")
                .required(true),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .help("Path to the JSON config file"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Trace-level logging"),
        )
        .arg(
            Arg::with_name("COMMAND")
                .multiple(true)
                .last(true)
                .help("Command line to run per connection (exec mode)"),
        )
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => match Config::load(Path::new(path)) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("zigcat: {}", err);
                exit(2);
            }
        },
        None => Config::default(),
    };
    if matches.is_present("verbose") {
        config.verbose = true;
    }

    if let Err(err) = config.validate() {
        eprintln!("zigcat: {}", err);
        exit(2);
    }

    let mode = matches.value_of("MODE").unwrap().to_owned();
    let address = matches.value_of("ADDRESS").unwrap().to_owned();
    let command: Vec<String> = matches
        .values_of("COMMAND")
        .map(|values| values.map(str::to_owned).collect())
        .unwrap_or_default();

    // Incompatible mode combinations are refused before any socket opens.
    if mode == "exec" && command.is_empty() {
        eprintln!("zigcat: exec mode requires a command after --");
        exit(2);
    }
    if mode != "exec" && !command.is_empty() {
        eprintln!("zigcat: a command line is only meaningful in exec mode");
        exit(2);
    }

    let log = logging::init(config.verbose);

    let access = match config.build_access_list() {
        Ok(access) => access,
        Err(err) => {
            eprintln!("zigcat: {}", err);
            exit(2);
        }
    };

    ctrlc::set_handler(shutdown::request).expect("Failed to install signal handler");

    let outcome = match mode.as_str() {
        "broker" | "chat" => {
            let broker_mode = if mode == "chat" {
                BrokerMode::Chat
            } else {
                BrokerMode::Relay
            };
            let listener = match bind_broker_listener(&address) {
                Ok(listener) => listener,
                Err(err) => {
                    eprintln!("zigcat: cannot listen on {}: {}", address, err);
                    exit(2);
                }
            };
            let pool = Arc::new(BufferPool::new(POOL_MAX_BYTES, POOL_FLOW_FRACTION));
            Broker::new(listener, broker_mode, &config, access, pool, &log)
                .and_then(|mut broker| broker.run())
        }
        "exec" => {
            let listener = match bind_serve_listener(&address) {
                Ok(listener) => listener,
                Err(err) => {
                    eprintln!("zigcat: cannot listen on {}: {}", address, err);
                    exit(2);
                }
            };
            let mut exec_config = ExecConfig::default();
            exec_config.telnet = config.telnet;
            exec_config.timeouts.idle = config.idle_timeout();
            exec_config.timeouts.connection = config.connect_timeout();
            exec::serve(listener, command, exec_config, access, &log)
        }
        other => {
            eprintln!("zigcat: unknown mode '{}'", other);
            exit(2);
        }
    };

    if let Err(err) = outcome {
        logging::error!(log, "fatal"; "error" => ?err);
        exit(1);
    }
}

fn bind_broker_listener(address: &str) -> std::io::Result<Listener> {
    if let Some(path) = address.strip_prefix("unix:") {
        #[cfg(unix)]
        {
            return Listener::bind_unix(&PathBuf::from(path));
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "unix sockets are not available on this platform",
            ));
        }
    }
    let addr = address
        .parse()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad address"))?;
    Listener::bind_tcp(addr)
}

fn bind_serve_listener(address: &str) -> std::io::Result<ServeListener> {
    if let Some(path) = address.strip_prefix("unix:") {
        #[cfg(unix)]
        {
            let _ = std::fs::remove_file(path);
            return std::os::unix::net::UnixListener::bind(path).map(ServeListener::Unix);
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "unix sockets are not available on this platform",
            ));
        }
    }
    std::net::TcpListener::bind(address).map(ServeListener::Tcp)
}
