//! Connection Handler: per-connection read loop, outbound writer thread,
//! and disconnect cleanup.
//!
//! Grounded on `oxidb-server/src/main.rs::handle_connection`/
//! `handle_client` for the read-loop/logging shape. The bounded-outbound-
//! queue writer thread is the systems-port improvement invited by
//! spec.md §9 ("the source has no such protection and can be improved in
//! the port") — see `Broker::register` in `broker.rs`.

use std::io::{BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;

use serde_json::json;

use crate::broker::Broker;
use crate::command::{parse_command, Command};
use crate::error::BrokerError;
use crate::protocol::{decode_line, read_line, write_reply};

/// Handle one accepted TCP connection to completion.
pub fn handle_client(stream: TcpStream, broker: Arc<Broker>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());
    eprintln!("client connected: {peer}");

    let (conn, rx) = broker.register();

    let writer_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("stream clone error for {peer}: {e}");
            broker.cleanup(conn);
            return;
        }
    };
    let writer_peer = peer.clone();
    let writer = std::thread::spawn(move || {
        let mut writer_stream = writer_stream;
        for value in rx {
            if let Err(e) = write_reply(&mut writer_stream, &value) {
                eprintln!("write error to {writer_peer}: {e}");
                break;
            }
        }
    });

    let mut reader = BufReader::new(stream);
    loop {
        let line = match read_line(&mut reader) {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(e) => {
                eprintln!("read error from {peer}: {e}");
                break;
            }
        };

        if line.is_empty() {
            continue;
        }
        if line == b"quit" {
            break;
        }

        match decode_line(&line) {
            Ok(value) => dispatch(&broker, conn, &value),
            Err(e) => reply_error(&broker, conn, e),
        }
    }

    // Drops the `Connection`'s `SyncSender`, which ends the writer
    // thread's `for value in rx` loop once the queue drains.
    broker.cleanup(conn);
    let _ = writer.join();

    eprintln!("client disconnected: {peer}");
}

fn dispatch(broker: &Broker, conn: crate::broker::ConnId, value: &serde_json::Value) {
    match parse_command(value) {
        Ok(Command::Subscribe {
            topic,
            last_seen,
            cache,
        }) => broker.subscribe(conn, &topic, last_seen, cache),
        Ok(Command::Unsubscribe { topic }) => {
            if let Err(e) = broker.unsubscribe(conn, &topic) {
                reply_error(broker, conn, e);
            }
        }
        Ok(Command::Send {
            topic,
            msg,
            delivery,
            cache,
        }) => broker.send(conn, &topic, &msg, delivery, cache),
        Err(e) => reply_error(broker, conn, e),
    }
}

fn reply_error(broker: &Broker, conn: crate::broker::ConnId, err: BrokerError) {
    broker.reply_direct(conn, json!({"success": false, "reason": err.reason()}));
}
