use log::LevelFilter;
use opdt::config::{decode_psk, ClientConfig, ServerConfig};
use opdt::udp::{Client, Server};
use opdt::CancelToken;
use std::io::{Error, ErrorKind, Result};
use std::net::{SocketAddr, ToSocketAddrs};
use std::process::exit;
use std::thread;
use std::time::Duration;
use structopt::StructOpt;

mod logging;
use logging::Preset;

#[derive(StructOpt, Debug)]
#[structopt(name = "opdt", about = "Discover the address and port a server observes for your UDP traffic")]
struct Opt {
    /// Run as server using the specified config file
    #[structopt(long = "server")]
    server: Option<String>,

    /// Run as client using the specified server address
    #[structopt(long = "client")]
    client: Option<String>,

    /// Bind address in client mode (default: let system choose)
    #[structopt(long = "client-bind", default_value = "")]
    client_bind: String,

    /// Base64 pre-shared key in client mode
    #[structopt(long = "client-psk", default_value = "")]
    client_psk: String,

    /// Interval between requests in client mode, e.g. 500ms, 2s, 1m (0: 2s)
    #[structopt(long = "client-interval", default_value = "0", parse(try_from_str = parse_duration))]
    client_interval: Duration,

    /// Number of attempts in client mode. Set to 0 to send until interrupted.
    #[structopt(long = "client-attempts", default_value = "5")]
    client_attempts: u32,

    /// Logger preset: console, systemd, production, development
    #[structopt(long = "logger-preset", default_value = "console")]
    logger_preset: Preset,

    /// Override the preset's log level: off, error, warn, info, debug, trace
    #[structopt(long = "log-level")]
    log_level: Option<LevelFilter>,
}

fn main() {
    let opt = Opt::from_args();

    if opt.server.is_some() == opt.client.is_some() {
        eprintln!("Either --server <path> or --client <address> must be specified.");
        Opt::clap().print_help().ok();
        exit(1);
    }

    if let Err(e) = logging::init(opt.logger_preset, opt.log_level) {
        eprintln!("{}", e);
        exit(1);
    }

    let code = match (opt.server.as_deref(), opt.client.as_deref()) {
        (Some(path), _) => run_server(path),
        (_, Some(server_addr)) => run_client(server_addr, &opt),
        _ => 1,
    };
    exit(code);
}

fn run_server(path: &str) -> i32 {
    let config = match ServerConfig::load(path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("failed to load config: {}", e);
            return 1;
        }
    };

    let mut s = match Server::from_config(&config) {
        Ok(s) => s,
        Err(e) => {
            log::error!("failed to initialize server, listen address: {}: {}", config.listen_address, e);
            return 1;
        }
    };

    if let Err(e) = s.start() {
        log::error!("failed to start server: {}", e);
        return 1;
    }

    log::info!(
        "started server, listen address: {}",
        s.local_addr().map_or(config.listen_address.clone(), |a| a.to_string())
    );

    match wait_for_signal() {
        Ok(sig) => log::info!("received {}, stopping...", sig),
        Err(e) => log::error!("failed to wait for signal: {}", e),
    }

    if let Err(e) = s.stop() {
        log::warn!("failed to stop server: {}", e);
    }
    0
}

fn run_client(server_addr: &str, opt: &Opt) -> i32 {
    let config = match client_config(server_addr, opt) {
        Ok(c) => c,
        Err(e) => {
            log::error!("invalid client options, server address: {}: {}", server_addr, e);
            return 1;
        }
    };

    let c = match Client::from_config(&config) {
        Ok(c) => c,
        Err(e) => {
            log::error!(
                "failed to initialize client, server address: {}, bind address: {}: {}",
                config.server_address,
                config.bind_address,
                e
            );
            return 1;
        }
    };

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        thread::spawn(move || {
            match wait_for_signal() {
                Ok(sig) => log::info!("received {}, stopping...", sig),
                Err(e) => log::error!("failed to wait for signal: {}", e),
            }
            cancel.cancel();
        });
    }

    if opt.client_attempts == 0 {
        let outcomes = match c.run(&cancel, opt.client_interval) {
            Ok(o) => o,
            Err(e) => {
                log::error!("failed to start client: {}", e);
                return 1;
            }
        };

        for outcome in outcomes {
            match outcome {
                Ok(addr) => log::info!("got client address: {}", addr),
                Err(e) => log::warn!("failed to get client address: {}", e),
            }
        }
        return 0;
    }

    match c.get(&cancel, opt.client_interval, opt.client_attempts) {
        Ok(addr) => {
            log::info!("got client address: {}", addr);
            0
        }
        Err(e) => {
            log::error!("failed to get client address: {}", e);
            1
        }
    }
}

fn client_config(server_addr: &str, opt: &Opt) -> opdt::Result<ClientConfig> {
    let server_address: SocketAddr = server_addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::new(ErrorKind::Other, "no address"))?;

    Ok(ClientConfig {
        server_address,
        bind_address: opt.client_bind.clone(),
        psk: decode_psk(&opt.client_psk)?,
    })
}

fn wait_for_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r.map(|_| "SIGINT"),
            _ = term.recv() => Ok("SIGTERM"),
        }
    })
}

fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let (num, unit) = match s.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(i) => s.split_at(i),
        None => (s, "s"),
    };

    let n: f64 = num
        .parse()
        .map_err(|_| format!("invalid duration {}", s))?;
    let secs = match unit {
        "ms" => n / 1000.0,
        "s" => n,
        "m" => n * 60.0,
        "h" => n * 3600.0,
        _ => return Err(format!("invalid duration unit {} in {}", unit, s)),
    };

    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration {}: {}", s, e))
}
