//! Line-protocol echo server.
//!
//! Run with: cargo run --example echo_server -- [port]
//! Then: cargo run --example line_client -- 127.0.0.1:7878

use std::sync::Arc;

use lineloop::{ClientHandle, ConfigBuilder, HandlerError, Networking, RequestHandler};

struct Echo;

impl RequestHandler for Echo {
    fn startup(&self) {
        log::info!("echo handler ready");
    }

    fn handle_request(&self, client: &mut ClientHandle<'_>) -> Result<(), HandlerError> {
        while let Some(frame) = client.input.extract_to_terminator(b'\n') {
            let line = &frame[..frame.len() - 1];
            client
                .conn
                .send_response(&[line, b"\n"])
                .map_err(|e| HandlerError(e.to_string()))?;
        }
        Ok(())
    }
}

fn main() -> Result<(), lineloop::Error> {
    simplelog::TermLogger::init(
        log::LevelFilter::Debug,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )
    .expect("logger init");

    let port: u16 = std::env::args()
        .nth(1)
        .map(|arg| arg.parse().expect("port must be a number"))
        .unwrap_or(7878);

    let config = ConfigBuilder::new()
        .tcp_port(port)
        .udp_port(port + 1)
        .worker_threads(4)
        .build()?;

    let net = Networking::init(config, Arc::new(Echo))?;
    log::info!("listening on 0.0.0.0:{}", net.tcp_port());

    let (_shutdown, handles) = net.launch()?;
    for h in handles {
        h.join().unwrap();
    }
    Ok(())
}
