//! Multi-round Byzantine general: keeps one `OM(m)` instance per
//! `round_id` so a driver can run many consecutive rounds, each with a
//! freshly chosen king, against the same set of long-lived processes.

use std::sync::Arc;

use byzantine::{majority, net::NetTransport, Order, RoundTable, Transport as _};
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "byzantine-general-king")]
struct Opt {
    #[structopt(short = "i", long = "id")]
    id: usize,

    #[structopt(short = "p", long = "port", default_value = "9400")]
    port: u16,

    #[structopt(short = "n", long = "count")]
    count: usize,

    #[structopt(short = "m", long = "traitors")]
    traitors: usize,

    #[structopt(long = "faulty")]
    faulty: bool,

    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbose: u8,
}

struct Service {
    table: Arc<RoundTable>,
    peers: Vec<std::net::SocketAddr>,
    faulty: bool,
    id: usize,
}

#[async_trait::async_trait]
impl transport::Handler for Service {
    async fn handle(&self, envelope: transport::Envelope) -> transport::Reply {
        let round_id = match envelope.body.get("round_id").and_then(|v| v.as_u64()) {
            Some(round_id) => round_id as usize,
            None => return transport::Reply::bad_request("missing 'round_id' field"),
        };
        let consensus = self.table.get_or_create(round_id);
        match envelope.method.as_str() {
            "order" => {
                let path = match envelope.body.get("path").and_then(|v| v.as_array()).cloned() {
                    Some(values) => values.iter().filter_map(|v| v.as_u64()).map(|v| v as usize).collect::<Vec<_>>(),
                    None => return transport::Reply::bad_request("missing 'path' field"),
                };
                let value: Order = match serde_json::from_value(envelope.body["value"].clone()) {
                    Ok(value) => value,
                    Err(_) => return transport::Reply::bad_request("missing 'value' field"),
                };
                let next_value = self.table.next_value_for(round_id, self.faulty);
                let net = NetTransport::for_round(self.peers.clone(), round_id);
                consensus.on_message(path, value, &net, &next_value).await;
                transport::Reply::ok(serde_json::json!({ "ok": true }))
            }
            "start" => {
                let value: Order = match serde_json::from_value(envelope.body["value"].clone()) {
                    Ok(value) => value,
                    Err(_) => return transport::Reply::bad_request("missing 'value' field"),
                };
                consensus.start(value);
                let net = NetTransport::for_round(self.peers.clone(), round_id);
                for peer in 0..self.peers.len() {
                    if peer != self.id {
                        net.send(peer, vec![self.id], value).await;
                    }
                }
                transport::Reply::ok(serde_json::json!({ "started": true }))
            }
            "status" => transport::Reply::ok(serde_json::json!({ "done": consensus.is_done() })),
            "decide" => {
                let default = envelope
                    .body
                    .get("default")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or(Order::Retreat);
                let decided = consensus.decide(default, |values| majority(values, |_| Order::Retreat));
                transport::Reply::ok(serde_json::json!({ "value": decided }))
            }
            other => transport::Reply::bad_request(format!("unknown method '{}'", other)),
        }
    }
}

fn init_logging(id: usize, verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    fern::Dispatch::new()
        .format(move |out, message, record| out.finish(format_args!("[{}][{}][{}]: {}", id, record.level(), record.target(), message)))
        .level(level)
        .chain(std::io::stdout())
        .apply()
        .expect("[INTERNAL ERROR]: logger already initialized");
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    init_logging(opt.id, opt.verbose);

    let peers: Vec<_> = (0..opt.count).map(|id| transport::node_addr(opt.port, id)).collect();
    let table = Arc::new(RoundTable::new(opt.id, opt.count, opt.traitors));
    let service = Arc::new(Service { table, peers, faulty: opt.faulty, id: opt.id });

    let addr = transport::node_addr(opt.port, opt.id);
    if let Err(error) = transport::serve(addr, service).await {
        log::error!("[{}] server exited: {}", opt.id, error);
        std::process::exit(1);
    }
}
