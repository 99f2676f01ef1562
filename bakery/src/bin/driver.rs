//! Scenario driver for the bakery protocol (spec property 1): spawns a
//! shared increment server and `count` bakery nodes, starts each node
//! running `loops` critical sections, waits for all nodes to report
//! `done`, then checks the final counter value against `count * loops`.

use std::time::Duration;

use structopt::StructOpt;
use transport::Envelope;

#[derive(StructOpt)]
#[structopt(name = "bakery-driver")]
struct Opt {
    #[structopt(short = "c", long = "count", default_value = "8")]
    count: usize,

    #[structopt(short = "l", long = "loops", default_value = "100")]
    loops: usize,

    #[structopt(short = "p", long = "port", default_value = "9000")]
    port: u16,

    #[structopt(long = "counter-port", default_value = "7000")]
    counter_port: u16,
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
    let counter_addr: std::net::SocketAddr = format!("127.0.0.1:{}", opt.counter_port).parse().unwrap();

    let _counter = harness::Node::spawn(
        harness::sibling_binary("inc-server").to_str().unwrap(),
        &["--port".into(), opt.counter_port.to_string()],
        counter_addr,
    )
    .expect("[INTERNAL ERROR]: failed to spawn increment server");
    harness::wait_for_port(counter_addr, Duration::from_secs(5)).await.expect("increment server never came up");

    let mut nodes = Vec::new();
    let mut children = Vec::new();
    for id in 0..opt.count {
        let addr = transport::node_addr(opt.port, id);
        let node = harness::Node::spawn(
            harness::sibling_binary("bakery-node").to_str().unwrap(),
            &[
                "--id".into(), id.to_string(),
                "--port".into(), opt.port.to_string(),
                "--count".into(), opt.count.to_string(),
                "--loops".into(), opt.loops.to_string(),
                "--counter-port".into(), opt.counter_port.to_string(),
            ],
            addr,
        )
        .expect("[INTERNAL ERROR]: failed to spawn bakery node");
        harness::wait_for_port(addr, Duration::from_secs(5)).await.expect("bakery node never came up");
        children.push(node);
        nodes.push((id, addr));
    }

    for (_, addr) in &nodes {
        transport::call(*addr, Envelope::new("start", serde_json::Value::Null), transport::DEFAULT_TIMEOUT)
            .await
            .expect("[INTERNAL ERROR]: failed to start node");
    }

    for (id, addr) in &nodes {
        let addr = *addr;
        harness::poll_until(
            || async move {
                transport::call(addr, Envelope::new("status", serde_json::Value::Null), transport::DEFAULT_TIMEOUT)
                    .await
                    .map(|reply| reply.body.get("done").and_then(|v| v.as_bool()).unwrap_or(false))
                    .unwrap_or(false)
            },
            Duration::from_millis(50),
            Duration::from_secs(60),
        )
        .await
        .unwrap_or_else(|_| panic!("node {} never finished", id));
    }

    let reply = transport::call(counter_addr, Envelope::new("get", serde_json::Value::Null), transport::DEFAULT_TIMEOUT)
        .await
        .expect("[INTERNAL ERROR]: failed to read final counter value");
    let observed = reply.body.get("value").and_then(|v| v.as_i64()).unwrap_or(-1);
    let expected = (opt.count * opt.loops) as i64;

    if observed == expected {
        log::info!("PASS: observed {} == expected {}", observed, expected);
    } else {
        log::error!("FAIL: observed {} != expected {}", observed, expected);
        std::process::exit(1);
    }
}
