//! Scenario driver for Multi-Paxos (spec property 9): feeds `li = []`,
//! `li += [1, 2]`, `li += [3, 4]` into node 0 and `i = 42` into node 2,
//! then waits for the background catch-up loop to bring every node's
//! database to `{li: [1, 2, 3, 4], i: 42}`.

use std::time::Duration;

use structopt::StructOpt;
use transport::Envelope;

#[derive(StructOpt)]
#[structopt(name = "multi-paxos-driver")]
struct Opt {
    #[structopt(short = "c", long = "count", default_value = "3")]
    count: usize,

    #[structopt(short = "p", long = "port", default_value = "9600")]
    port: u16,
}

async fn send_command(addr: std::net::SocketAddr, command: serde_json::Value) {
    let reply = transport::call(addr, Envelope::new("command", serde_json::json!({ "command": command })), transport::DEFAULT_TIMEOUT)
        .await
        .expect("[INTERNAL ERROR]: failed to send command");
    let status = reply.body.get("status").and_then(|v| v.as_str()).unwrap_or("unknown");
    if status != "success" {
        log::error!("command {:?} did not succeed: {:?}", command, reply.body);
        std::process::exit(1);
    }
}

#[tokio::main]
async fn main() {
    fern::Dispatch::new()
        .format(|out, message, record| out.finish(format_args!("[driver][{}]: {}", record.level(), message)))
        .level(log::LevelFilter::Info)
        .chain(std::io::stdout())
        .apply()
        .ok();

    let opt = Opt::from_args();

    let mut nodes = Vec::new();
    let mut children = Vec::new();
    for id in 0..opt.count {
        let addr = transport::node_addr(opt.port, id);
        let node = harness::Node::spawn(
            harness::sibling_binary("multi-paxos-node").to_str().unwrap(),
            &["--id".into(), id.to_string(), "--port".into(), opt.port.to_string(), "--count".into(), opt.count.to_string()],
            addr,
        )
        .expect("[INTERNAL ERROR]: failed to spawn multi-paxos node");
        harness::wait_for_port(addr, Duration::from_secs(5)).await.expect("multi-paxos node never came up");
        children.push(node);
        nodes.push((id, addr));
    }

    let node0 = nodes[0].1;
    let node2 = nodes[2 % opt.count].1;

    send_command(node0, serde_json::json!({ "kind": "set", "key": "li", "value": [] })).await;
    send_command(node0, serde_json::json!({ "kind": "append", "key": "li", "value": [1, 2] })).await;
    send_command(node0, serde_json::json!({ "kind": "append", "key": "li", "value": [3, 4] })).await;
    send_command(node2, serde_json::json!({ "kind": "set", "key": "i", "value": 42 })).await;

    let expected = serde_json::json!({ "li": [1, 2, 3, 4], "i": 42 });

    for (id, addr) in &nodes {
        let addr = *addr;
        harness::poll_until(
            || {
                let expected = expected.clone();
                async move {
                    transport::call(addr, Envelope::new("db", serde_json::Value::Null), transport::DEFAULT_TIMEOUT)
                        .await
                        .map(|reply| reply.body.get("db").cloned().unwrap_or(serde_json::Value::Null) == expected)
                        .unwrap_or(false)
                }
            },
            Duration::from_millis(100),
            Duration::from_secs(15),
        )
        .await
        .unwrap_or_else(|_| panic!("node {} never caught up to the expected database", id));
    }

    log::info!("PASS: all {} nodes converged to {:?}", opt.count, expected);
}
