use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Context;
use clap::Parser;
use log::{error, info};

use psik_fabric::config::{FabricConfig, Opts};
use psik_fabric::fabric::Fabric;
use psik_fabric::ofp_controller::openflow0x01::OF0x01Controller;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cfg = FabricConfig::from_opts(Opts::parse())?;
    let listen = cfg.listen;
    let fabric = Arc::new(Mutex::new(Fabric::new(cfg)));

    let listener =
        TcpListener::bind(listen).with_context(|| format!("failed to bind {}", listen))?;
    info!("listening for switches on {}", listen);

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let fabric = Arc::clone(&fabric);
                thread::spawn(move || Fabric::handle_client_connected(fabric, stream));
            }
            Err(e) => error!("failed to accept connection: {}", e),
        }
    }
    Ok(())
}
