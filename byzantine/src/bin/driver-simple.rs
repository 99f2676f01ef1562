//! Scenario driver for plain single-round `OM(m)` (spec property 3/4):
//! spawns n = 3m+1 generals, has the king broadcast an order, waits for
//! every honest general to finish its cascade, then asserts all honest
//! decisions agree.

use std::time::Duration;

use structopt::StructOpt;
use transport::Envelope;

#[derive(StructOpt)]
#[structopt(name = "byzantine-driver-simple")]
struct Opt {
    #[structopt(short = "m", long = "traitors", default_value = "1")]
    traitors: usize,

    #[structopt(short = "k", long = "king", default_value = "0")]
    king: usize,

    #[structopt(short = "p", long = "port", default_value = "9300")]
    port: u16,

    /// Comma-separated ids that behave as traitors (king may be among them).
    #[structopt(long = "traitor-ids", default_value = "1")]
    traitor_ids: String,
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
    let count = 3 * opt.traitors + 1;
    let traitors: std::collections::HashSet<usize> =
        opt.traitor_ids.split(',').filter_map(|s| s.trim().parse().ok()).collect();

    let mut nodes = Vec::new();
    let mut children = Vec::new();
    for id in 0..count {
        let addr = transport::node_addr(opt.port, id);
        let mut args = vec![
            "--id".to_string(), id.to_string(),
            "--port".to_string(), opt.port.to_string(),
            "--count".to_string(), count.to_string(),
            "--traitors".to_string(), opt.traitors.to_string(),
        ];
        if traitors.contains(&id) {
            args.push("--faulty".to_string());
        }
        let node = harness::Node::spawn(harness::sibling_binary("general").to_str().unwrap(), &args, addr)
            .expect("[INTERNAL ERROR]: failed to spawn general");
        harness::wait_for_port(addr, Duration::from_secs(5)).await.expect("general never came up");
        children.push(node);
        nodes.push((id, addr));
    }

    let king_addr = nodes[opt.king].1;
    transport::call(king_addr, Envelope::new("start", serde_json::json!({ "value": "Attack" })), transport::DEFAULT_TIMEOUT)
        .await
        .expect("[INTERNAL ERROR]: failed to start king broadcast");

    let honest: Vec<_> = nodes.iter().filter(|(id, _)| !traitors.contains(id)).collect();
    for (id, addr) in &honest {
        let addr = *addr;
        harness::poll_until(
            || async move {
                transport::call(addr, Envelope::new("status", serde_json::Value::Null), transport::DEFAULT_TIMEOUT)
                    .await
                    .map(|reply| reply.body.get("done").and_then(|v| v.as_bool()).unwrap_or(false))
                    .unwrap_or(false)
            },
            Duration::from_millis(50),
            Duration::from_secs(10),
        )
        .await
        .unwrap_or_else(|_| panic!("general {} never finished its cascade", id));
    }

    let mut decisions = Vec::new();
    for (id, addr) in &honest {
        let reply = transport::call(*addr, Envelope::new("decide", serde_json::json!({ "default": "Retreat" })), transport::DEFAULT_TIMEOUT)
            .await
            .expect("[INTERNAL ERROR]: failed to query decision");
        let value = reply.body.get("value").cloned().unwrap_or(serde_json::Value::Null);
        log::info!("general {} decided {:?}", id, value);
        decisions.push(value);
    }

    if decisions.windows(2).all(|pair| pair[0] == pair[1]) {
        log::info!("PASS: all honest generals agree on {:?}", decisions.first());
    } else {
        log::error!("FAIL: honest generals disagree: {:?}", decisions);
        std::process::exit(1);
    }
}
