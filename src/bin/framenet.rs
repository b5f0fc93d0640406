// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use dotenv::dotenv;
use framenet::{
    setup_local_tracing, AppResult, MulticastSender, NetClient, NetConfig, NetEvent,
    NetMessage, NetServer, NetSystem, Node, Protocol, ReactorKind, Sinks,
};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(version, about = "framenet demo engines")]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Command,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// echo every data frame back to its sender until stdin closes
    Server(Endpoint),
    /// send each stdin line as one frame and print what comes back
    Client(Endpoint),
    /// send each stdin line to a multicast group
    MulticastSend(Endpoint),
    /// print every frame published to a multicast group
    MulticastRecv(Endpoint),
    /// print the effective configuration
    PrintConfig,
}

#[derive(Args, Clone)]
pub struct Endpoint {
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    /// tcp or udp, ignored by the multicast commands
    #[arg(long)]
    pub protocol: Option<String>,
    /// completion or readiness
    #[arg(long)]
    pub reactor: Option<String>,
    /// heartbeat period in milliseconds, clients only
    #[arg(long)]
    pub heart_ms: Option<u64>,
}

impl Endpoint {
    fn apply(&self, config: &mut NetConfig) -> AppResult<()> {
        if let Some(host) = &self.host {
            config.network.host = host.clone();
        }
        if let Some(port) = self.port {
            config.network.port = port;
        }
        if let Some(protocol) = &self.protocol {
            config.network.protocol = match protocol.as_str() {
                "tcp" => Protocol::Tcp,
                "udp" => Protocol::Udp,
                other => {
                    return Err(framenet::AppError::InvalidValue(format!(
                        "unknown protocol {}",
                        other
                    )))
                }
            };
        }
        if let Some(reactor) = &self.reactor {
            config.reactor.kind = match reactor.as_str() {
                "completion" => ReactorKind::Completion,
                "readiness" => ReactorKind::Readiness,
                other => {
                    return Err(framenet::AppError::InvalidValue(format!(
                        "unknown reactor {}",
                        other
                    )))
                }
            };
        }
        if let Some(period) = self.heart_ms {
            config.heartbeat.period_ms = period;
        }
        Ok(())
    }
}

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline = CommandLine::parse();
    if std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }
    setup_local_tracing()?;

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let mut config = if config_path.exists() {
        NetConfig::set_up_config(&config_path)?
    } else {
        info!("{} not found, using defaults", config_path.display());
        NetConfig::default()
    };

    let system = NetSystem::init();
    match commandline.command {
        Command::Server(endpoint) => {
            endpoint.apply(&mut config)?;
            run_server(system, config)
        }
        Command::Client(endpoint) => {
            endpoint.apply(&mut config)?;
            run_client(system, config)
        }
        Command::MulticastSend(endpoint) => {
            endpoint.apply(&mut config)?;
            config.network.protocol = Protocol::UdpMulticast;
            let sender = MulticastSender::new(&config)?;
            for line in std::io::stdin().lock().lines() {
                sender.send(line?.as_bytes())?;
            }
            sender.release();
            Ok(())
        }
        Command::MulticastRecv(endpoint) => {
            endpoint.apply(&mut config)?;
            config.network.protocol = Protocol::UdpMulticast;
            run_client(system, config)
        }
        Command::PrintConfig => {
            println!("{:#?}", config);
            Ok(())
        }
    }
}

fn run_server(system: NetSystem, config: NetConfig) -> AppResult<()> {
    let events = |node: &Node, event: NetEvent| info!("{}: {}", node, event);
    let echo = |node: &Node, data: bytes::Bytes| {
        if let Err(e) = node.send(&data) {
            warn!("echo to {} failed: {}", node, e);
        }
    };
    let server = NetServer::new(system, config, Sinks::new(events, echo));
    let node = server.start()?;
    println!("listening on {}, close stdin to stop", node);

    let mut lines = std::io::stdin().lock().lines();
    while let Some(Ok(_)) = lines.next() {
        println!("{} clients connected", server.client_count());
    }
    server.stop()
}

fn run_client(system: NetSystem, config: NetConfig) -> AppResult<()> {
    let receiver_only = config.network.protocol == Protocol::UdpMulticast;
    let (sinks, messages) = Sinks::channel(1024);
    let client = NetClient::new(system, config, sinks);
    let node = client.start()?;
    println!("connected to {}", node);

    let printer = std::thread::Builder::new()
        .name("framenet-printer".to_string())
        .spawn(move || {
            while let Ok(message) = messages.recv_blocking() {
                match message {
                    NetMessage::Data(node, data) => {
                        println!("{} > {}", node, String::from_utf8_lossy(&data))
                    }
                    NetMessage::Event(node, event) => {
                        let quit = matches!(event, NetEvent::Quit(_));
                        info!("{}: {}", node, event);
                        if quit {
                            break;
                        }
                    }
                }
            }
        })?;

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if receiver_only {
            continue;
        }
        if let Err(e) = client.send(line.as_bytes()) {
            error!("send failed: {}", e);
            break;
        }
    }
    // leave the printer a moment to show trailing echoes
    std::thread::sleep(Duration::from_millis(200));
    if let Err(e) = client.stop() {
        warn!("stopping client: {}", e);
    }
    drop(client);
    if printer.join().is_err() {
        error!("printer thread panicked");
    }
    Ok(())
}
