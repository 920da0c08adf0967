// src/main.rs
//! airgap-check
//!
//! Evaluates destinations against the configured global defaults, the way a
//! guarded test would see them, and prints one JSON line per destination.
//!
//! ```text
//! airgap-check localhost:8080 example.com:443 api.internal
//! ```
//!
//! Exits with status 1 when any destination is blocked.

use airgap_engine::observability::init_tracing;
use airgap_engine::utils::errors::NAME_RESOLUTION_PORT;
use airgap_engine::{
    AirgapConfig, BuildInfo, ContextStore, DecisionEngine, TestAnnotations, TestLifecycle, VERSION,
};
use anyhow::{bail, Context, Result};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

const CALLER: &str = "airgap-check";

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|arg| arg == "--version") {
        println!("{}", serde_json::to_string(&BuildInfo::current())?);
        return Ok(());
    }
    if args.is_empty() {
        bail!("usage: airgap-check <host[:port]>...");
    }

    let config = AirgapConfig::load().context("Failed to load airgap configuration")?;
    init_tracing(&config.logging)?;
    info!("airgap-check v{}", VERSION);

    let store = Arc::new(ContextStore::new());
    let lifecycle = TestLifecycle::new(Arc::clone(&store), config.defaults.clone());
    let engine = DecisionEngine::from_settings(store, &config.engine);

    let mut blocked = 0usize;
    {
        let _scope = lifecycle.scope(&TestAnnotations::blocking())?;
        for arg in &args {
            let (host, port) = parse_destination(arg)?;
            let decision = engine.decide(&host, port, CALLER);
            if decision.is_blocked() {
                blocked += 1;
            }
            println!(
                "{}",
                json!({ "destination": arg, "host": host, "port": port, "result": decision })
            );
        }
    }

    if blocked > 0 {
        info!("{} of {} destinations blocked", blocked, args.len());
        std::process::exit(1);
    }
    Ok(())
}

/// `host`, `host:port`, `ip:port` or `[ipv6]:port`. A bare host is checked
/// as a name resolution.
fn parse_destination(arg: &str) -> Result<(String, i32)> {
    if let Ok(addr) = arg.parse::<SocketAddr>() {
        return Ok((addr.ip().to_string(), i32::from(addr.port())));
    }

    match arg.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("Invalid port in destination '{}'", arg))?;
            Ok((host.to_string(), i32::from(port)))
        }
        _ => Ok((arg.trim_matches(['[', ']']).to_string(), NAME_RESOLUTION_PORT)),
    }
}
