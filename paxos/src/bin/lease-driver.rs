//! Scenario driver for PaxosLease (spec properties 7 and 8): two nodes
//! race `/start` to show mutual exclusion, then one lease holder is left
//! running alone to show that `--extend` keeps it the owner past its own
//! `lease_seconds`, while a lease acquired without `--extend` lapses.

use std::time::Duration;

use structopt::StructOpt;
use transport::Envelope;

#[derive(StructOpt)]
#[structopt(name = "paxos-lease-driver")]
struct Opt {
    #[structopt(short = "c", long = "count", default_value = "3")]
    count: usize,

    #[structopt(short = "p", long = "port", default_value = "9700")]
    port: u16,

    #[structopt(long = "lease-seconds", default_value = "2.0")]
    lease_seconds: f64,
}

async fn start(addr: std::net::SocketAddr) -> serde_json::Value {
    transport::call(addr, Envelope::new("start", serde_json::Value::Null), transport::DEFAULT_TIMEOUT)
        .await
        .expect("[INTERNAL ERROR]: failed to call /start")
        .body
}

async fn status(addr: std::net::SocketAddr) -> serde_json::Value {
    transport::call(addr, Envelope::new("status", serde_json::Value::Null), transport::DEFAULT_TIMEOUT)
        .await
        .expect("[INTERNAL ERROR]: failed to call /status")
        .body
}

fn is_owner(status: &serde_json::Value) -> bool {
    status.get("proposer_state").and_then(|s| s.get("lease_owner")).and_then(|v| v.as_bool()).unwrap_or(false)
}

async fn spawn_nodes(opt: &Opt, extend: Vec<bool>) -> (Vec<harness::Node>, Vec<std::net::SocketAddr>) {
    let mut children = Vec::new();
    let mut addrs = Vec::new();
    for id in 0..opt.count {
        let addr = transport::node_addr(opt.port, id);
        let mut args = vec![
            "--id".to_string(),
            id.to_string(),
            "--port".to_string(),
            opt.port.to_string(),
            "--count".to_string(),
            opt.count.to_string(),
            "--lease-seconds".to_string(),
            opt.lease_seconds.to_string(),
        ];
        if extend[id] {
            args.push("--extend".to_string());
        }
        let node = harness::Node::spawn(harness::sibling_binary("paxos-lease-node").to_str().unwrap(), &args, addr)
            .expect("[INTERNAL ERROR]: failed to spawn paxos-lease node");
        harness::wait_for_port(addr, Duration::from_secs(5)).await.expect("paxos-lease node never came up");
        children.push(node);
        addrs.push(addr);
    }
    (children, addrs)
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

    // Property 7: mutual exclusion. Nodes 0 and 2 race for the lease at
    // the same time; at most one may observe success.
    {
        let (_children, addrs) = spawn_nodes(&opt, vec![false; opt.count]).await;
        let racer_a = addrs[0];
        let racer_b = addrs[2 % opt.count];

        let (reply_a, reply_b) = tokio::join!(start(racer_a), start(racer_b));
        let success_a = reply_a.get("status").and_then(|v| v.as_str()) == Some("success");
        let success_b = reply_b.get("status").and_then(|v| v.as_str()) == Some("success");

        assert!(
            !(success_a && success_b),
            "both racers acquired the lease simultaneously: {:?} / {:?}",
            reply_a,
            reply_b
        );
        assert!(success_a || success_b, "neither racer acquired the lease: {:?} / {:?}", reply_a, reply_b);
        log::info!("PASS: mutual exclusion held (a={}, b={})", success_a, success_b);
    }

    // Property 8: extension. A node started with `--extend` keeps
    // `lease_owner` true well past its own `lease_seconds`; a plain node
    // (no extension) loses ownership once its lease expires.
    {
        let (_children, addrs) = spawn_nodes(&opt, vec![true; opt.count]).await;
        let holder = addrs[0];

        let reply = start(holder).await;
        assert_eq!(reply.get("status").and_then(|v| v.as_str()), Some("success"), "extending node failed to acquire: {:?}", reply);

        tokio::time::sleep(Duration::from_secs_f64(opt.lease_seconds * 1.5)).await;
        let state = status(holder).await;
        assert!(is_owner(&state), "extending node lost the lease past its own lease_seconds: {:?}", state);
        log::info!("PASS: extension kept ownership past lease_seconds");
    }

    {
        let (_children, addrs) = spawn_nodes(&opt, vec![false; opt.count]).await;
        let holder = addrs[0];

        let reply = start(holder).await;
        assert_eq!(reply.get("status").and_then(|v| v.as_str()), Some("success"), "non-extending node failed to acquire: {:?}", reply);

        harness::poll_until(
            || async move {
                let state = status(holder).await;
                !is_owner(&state)
            },
            Duration::from_millis(100),
            Duration::from_secs_f64(opt.lease_seconds * 3.0),
        )
        .await
        .unwrap_or_else(|_| panic!("non-extending node never lost the lease"));
        log::info!("PASS: un-extended lease lapsed within lease_seconds");
    }
}
