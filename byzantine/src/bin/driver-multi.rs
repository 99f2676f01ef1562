//! Scenario driver for the multi-round king-rotation Byzantine variant:
//! runs several independent rounds against the same long-lived
//! `general-king` processes, picking a new king (and order) each round.

use std::time::Duration;

use structopt::StructOpt;
use transport::Envelope;

#[derive(StructOpt)]
#[structopt(name = "byzantine-driver-multi")]
struct Opt {
    #[structopt(short = "m", long = "traitors", default_value = "1")]
    traitors: usize,

    #[structopt(short = "r", long = "rounds", default_value = "3")]
    rounds: usize,

    #[structopt(short = "p", long = "port", default_value = "9400")]
    port: u16,

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
        let node = harness::Node::spawn(harness::sibling_binary("general-king").to_str().unwrap(), &args, addr)
            .expect("[INTERNAL ERROR]: failed to spawn general-king");
        harness::wait_for_port(addr, Duration::from_secs(5)).await.expect("general-king never came up");
        children.push(node);
        nodes.push((id, addr));
    }

    let honest: Vec<_> = nodes.iter().filter(|(id, _)| !traitors.contains(id)).cloned().collect();
    let orders = ["Attack", "Retreat"];
    let mut failures = 0usize;

    for round_id in 0..opt.rounds {
        let king = round_id % count;
        let order = orders[round_id % orders.len()];
        log::info!("round {}: king={} order={}", round_id, king, order);

        let king_addr = nodes[king].1;
        transport::call(
            king_addr,
            Envelope::new("start", serde_json::json!({ "round_id": round_id, "value": order })),
            transport::DEFAULT_TIMEOUT,
        )
        .await
        .expect("[INTERNAL ERROR]: failed to start round");

        for (id, addr) in &honest {
            let addr = *addr;
            let _ = harness::poll_until(
                || async move {
                    transport::call(addr, Envelope::new("status", serde_json::json!({ "round_id": round_id })), transport::DEFAULT_TIMEOUT)
                        .await
                        .map(|reply| reply.body.get("done").and_then(|v| v.as_bool()).unwrap_or(false))
                        .unwrap_or(false)
                },
                Duration::from_millis(50),
                Duration::from_secs(5),
            )
            .await;
            let _ = id;
        }

        let mut decisions = Vec::new();
        for (id, addr) in &honest {
            let reply = transport::call(
                *addr,
                Envelope::new("decide", serde_json::json!({ "round_id": round_id, "default": "Retreat" })),
                transport::DEFAULT_TIMEOUT,
            )
            .await
            .expect("[INTERNAL ERROR]: failed to query decision");
            let value = reply.body.get("value").cloned().unwrap_or(serde_json::Value::Null);
            log::info!("  general {} decided {:?}", id, value);
            decisions.push(value);
        }

        if !decisions.windows(2).all(|pair| pair[0] == pair[1]) {
            log::error!("round {}: honest generals disagree: {:?}", round_id, decisions);
            failures += 1;
        }
    }

    if failures == 0 {
        log::info!("PASS: all {} rounds reached honest agreement", opt.rounds);
    } else {
        log::error!("FAIL: {} of {} rounds disagreed", failures, opt.rounds);
        std::process::exit(1);
    }
}
