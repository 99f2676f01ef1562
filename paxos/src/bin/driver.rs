//! Scenario driver for single-decree Paxos (spec properties 5 and 6):
//! spawns `count` nodes and fires `--proposers` concurrent `start` calls
//! at distinct nodes with distinct initial values, then asserts every
//! learner converged on the same chosen value.

use std::time::Duration;

use structopt::StructOpt;
use transport::Envelope;

#[derive(StructOpt)]
#[structopt(name = "paxos-driver")]
struct Opt {
    #[structopt(short = "c", long = "count", default_value = "3")]
    count: usize,

    #[structopt(short = "p", long = "port", default_value = "9500")]
    port: u16,

    /// Comma-separated `node_id=value` pairs, each fired concurrently at
    /// `start`. Default pits node 0 proposing "A" against node 1
    /// proposing "B", the property-5 scenario.
    #[structopt(long = "proposers", default_value = "0=A,1=B")]
    proposers: String,
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
            harness::sibling_binary("paxos-node").to_str().unwrap(),
            &["--id".into(), id.to_string(), "--port".into(), opt.port.to_string(), "--count".into(), opt.count.to_string()],
            addr,
        )
        .expect("[INTERNAL ERROR]: failed to spawn paxos node");
        harness::wait_for_port(addr, Duration::from_secs(5)).await.expect("paxos node never came up");
        children.push(node);
        nodes.push((id, addr));
    }

    let proposals: Vec<(usize, String)> = opt
        .proposers
        .split(',')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let id: usize = parts.next()?.trim().parse().ok()?;
            let value = parts.next()?.trim().to_string();
            Some((id, value))
        })
        .collect();

    let starts = proposals.iter().map(|(id, value)| {
        let addr = nodes[*id].1;
        let body = serde_json::json!({ "value": value });
        async move { transport::call(addr, Envelope::new("start", body), transport::DEFAULT_TIMEOUT).await }
    });
    let outcomes = futures::future::join_all(starts).await;
    for (outcome, (id, _)) in outcomes.iter().zip(&proposals) {
        log::info!("proposer {} round outcome: {:?}", id, outcome.as_ref().map(|reply| &reply.body));
    }

    let mut chosen = Vec::new();
    for (id, addr) in &nodes {
        let reply = transport::call(*addr, Envelope::new("status", serde_json::Value::Null), transport::DEFAULT_TIMEOUT)
            .await
            .unwrap_or_else(|_| panic!("node {} never answered status", id));
        let value = reply.body.get("learner_state").and_then(|s| s.get("chosen_value")).cloned().unwrap_or(serde_json::Value::Null);
        log::info!("node {} learned {:?}", id, value);
        chosen.push(value);
    }

    let all_chosen = chosen.iter().all(|value| !value.is_null());
    let all_agree = chosen.windows(2).all(|pair| pair[0] == pair[1]);

    if all_chosen && all_agree {
        log::info!("PASS: all learners converged on {:?}", chosen.first());
    } else {
        log::error!("FAIL: learners disagree or some never learned: {:?}", chosen);
        std::process::exit(1);
    }
}
