//! Administrative commands: `reload`, `cookie` and `probe`.

use crate::ui;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchyard_agent::{Agent, MessageHandler};
use switchyard_types::config::DEFAULT_MAX_PAYLOAD_SIZE;
use switchyard_types::{AgentConfig, AgentId, MagicCookie, ReconnectPolicy};
use switchyard_wire::{write_message, Message};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn cmd_reload(addr: &str, cookie: &str) {
    let cookie = match MagicCookie::from_hex(cookie) {
        Ok(c) => c,
        Err(e) => {
            ui::error_with_fix(
                &format!("Invalid admin cookie: {e}"),
                "Pass the admin_cookie value from the router config (32 hex digits)",
            );
            std::process::exit(1);
        }
    };

    match block_on(send_reload(addr, cookie)) {
        Ok(()) => {
            ui::success(&format!("Reload requested from {addr}"));
            ui::hint("The router logs the outcome; a wrong cookie is ignored");
        }
        Err(e) => {
            ui::error(&format!("Could not reach router at {addr}: {e}"));
            std::process::exit(1);
        }
    }
}

async fn send_reload(addr: &str, cookie: MagicCookie) -> Result<(), String> {
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| "connection timed out".to_string())?
        .map_err(|e| e.to_string())?;
    let msg = Message::reload_config(0, cookie);
    write_message(&mut stream, &msg, DEFAULT_MAX_PAYLOAD_SIZE)
        .await
        .map_err(|e| e.to_string())?;
    let _ = stream.shutdown().await;
    Ok(())
}

pub fn cmd_cookie() {
    println!("{}", MagicCookie::random().to_hex());
}

struct Echo;

#[async_trait]
impl MessageHandler for Echo {
    async fn handle_data(&self, _sender: AgentId, payload: Bytes) -> Option<Bytes> {
        Some(payload)
    }
}

pub fn cmd_probe(addr: &str, count: u32) {
    if let Err(e) = block_on(probe(addr, count)) {
        ui::error(&format!("Probe failed: {e}"));
        std::process::exit(1);
    }
}

async fn probe(addr: &str, count: u32) -> Result<(), String> {
    let config = AgentConfig::new(addr).with_reconnect(ReconnectPolicy {
        enabled: false,
        ..ReconnectPolicy::default()
    });
    let agent = Agent::connect(config, Arc::new(Echo))
        .await
        .map_err(|e| e.to_string())?;
    let identity = agent.identity();

    ui::section("Registered");
    ui::kv("Agent id", &identity.agent_id.to_string());
    ui::kv("Router id", &identity.router_id.to_string());

    for i in 1..=count {
        let payload = Bytes::from(format!("probe-{i}"));
        let started = Instant::now();
        let reply = agent
            .request(identity.agent_id, payload.clone(), Duration::from_secs(5))
            .await
            .map_err(|e| e.to_string())?;
        if reply != payload {
            return Err("reply did not match request".to_string());
        }
        ui::kv(
            &format!("Round trip {i}"),
            &format!("{:.2} ms", started.elapsed().as_secs_f64() * 1000.0),
        );
    }

    agent.close().await;
    ui::success("Router is forwarding");
    Ok(())
}

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt.block_on(fut),
        Err(e) => {
            ui::error(&format!("Failed to start runtime: {e}"));
            std::process::exit(1);
        }
    }
}
