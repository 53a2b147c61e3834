//! Drives calls through a chain of delegating servers on an in-memory network.
//!
//! The first `hops - 1` servers forward each request to the next hop; the last
//! one replies to the client with the payload reversed. Prints a JSON summary.
//!
//! ```bash
//! RUST_LOG=stagerpc_runtime=debug cargo run -p stagerpc-runtime --bin stagerpc-demo -- --calls 8 --hops 3
//! ```

use anyhow::{bail, Result};
use clap::Parser;
use serde_json::json;
use stagerpc_core::Address;
use stagerpc_runtime::{
    InboundBuffer, ManagerConfig, MemoryNetwork, OpManager, RemoteOp, RemoteOpState, ServerOp,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "stagerpc-demo")]
#[command(about = "Round trips and delegation chains over an in-memory transport")]
struct Args {
    /// Number of calls to issue
    #[arg(short, long, default_value_t = 4, env = "STAGERPC_CALLS")]
    calls: usize,

    /// Servers in the chain; the last one replies
    #[arg(long, default_value_t = 2, env = "STAGERPC_HOPS")]
    hops: usize,

    /// Poll rounds before giving up on outstanding calls
    #[arg(long, default_value_t = 10_000)]
    max_rounds: usize,
}

const CLIENT: Address = Address(1);

fn server_address(hop: usize) -> Address {
    Address(0x100 + hop as u64)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    if args.hops == 0 {
        bail!("--hops must be at least 1");
    }

    let network = MemoryNetwork::new();
    let client = OpManager::new(Box::new(network.bind(CLIENT)?), 1);
    let servers = (0..args.hops)
        .map(|hop| -> Result<OpManager> {
            let transport = network.bind(server_address(hop))?;
            Ok(OpManager::with_config(
                Box::new(transport),
                ManagerConfig::new(hop as u64 + 2),
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut calls = Vec::with_capacity(args.calls);
    for i in 0..args.calls {
        let mut call = RemoteOp::new(&client);
        call.request().append(format!("call-{i}").as_bytes());
        call.send(server_address(0));
        calls.push(call);
    }
    info!(calls = args.calls, hops = args.hops, "calls sent");

    let mut rounds = 0;
    while !calls.iter().all(|call| call.is_ready()) {
        rounds += 1;
        if rounds > args.max_rounds {
            bail!("calls still outstanding after {} poll rounds", args.max_rounds);
        }
        for (hop, server) in servers.iter().enumerate() {
            server.poll();
            loop {
                let op = server.receive_server_op();
                if op.is_empty() {
                    break;
                }
                serve(op, hop, args.hops);
            }
        }
        client.poll();
    }
    // One more round lets every server retire the ops it was handed back.
    for server in &servers {
        server.poll();
    }

    let results: Vec<_> = calls
        .iter()
        .map(|call| {
            json!({
                "op_id": call.op_id().map(|id| id.to_string()),
                "state": format!("{:?}", call.state()),
                "response": call
                    .response()
                    .map(|r| String::from_utf8_lossy(&r.to_vec()).into_owned()),
            })
        })
        .collect();
    let completed = calls
        .iter()
        .filter(|call| call.state() == RemoteOpState::Completed)
        .count();
    let server_stats: Vec<_> = servers.iter().map(OpManager::stats).collect();

    let summary = json!({
        "completed": completed,
        "rounds": rounds,
        "calls": results,
        "client": client.stats(),
        "servers": server_stats,
        "network": network.counters(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Answers or forwards one claimed request, then lets the manager finish it.
fn serve(mut op: ServerOp<'_>, hop: usize, hops: usize) {
    let Some(mut payload) = op.request().map(InboundBuffer::to_vec) else {
        return;
    };
    let Some(response) = op.response() else {
        return;
    };
    if hop + 1 < hops {
        response.append(&payload);
        op.delegate(server_address(hop + 1));
    } else {
        payload.reverse();
        response.append(&payload);
        op.reply();
    }
}
