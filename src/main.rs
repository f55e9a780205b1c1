use std::env;
use std::net::TcpListener;
use std::sync::Arc;

use pubsub_broker::broker::Broker;
use pubsub_broker::config::Config;
use pubsub_broker::connection::handle_client;

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let config = match Config::from_args(&args) {
        Some(c) => c,
        None => {
            eprintln!("Usage: pubsub-broker [<port> [<cache_size>]]");
            eprintln!("  <port>       - optional, default {}", pubsub_broker::config::DEFAULT_PORT);
            eprintln!("  <cache_size> - optional, default {}", pubsub_broker::config::DEFAULT_CACHE_SIZE);
            std::process::exit(1);
        }
    };

    let addr = ("localhost", config.port);
    let listener = TcpListener::bind(addr).expect("failed to bind TCP listener");
    eprintln!(
        "pubsub-broker listening on localhost:{} (cache_size={})",
        config.port, config.cache_size
    );

    let broker = Arc::new(Broker::new(config.cache_size));

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let broker = Arc::clone(&broker);
                std::thread::spawn(move || handle_client(stream, broker));
            }
            Err(e) => {
                eprintln!("accept error: {e}");
            }
        }
    }
}
