//! Single-round Oral Messages `OM(m)` general. Node 0 is conventionally
//! the king for this binary; every node passes `--traitors` listing the
//! ids (possibly including itself) that behave as traitors.

use std::sync::Arc;

use byzantine::{net::NetTransport, ByzantineConsensus, Faulty, Honest, NextValue, NodeService, Order};
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "byzantine-general")]
struct Opt {
    #[structopt(short = "i", long = "id")]
    id: usize,

    #[structopt(short = "p", long = "port", default_value = "9300")]
    port: u16,

    /// Total nodes; must satisfy n = 3m + 1.
    #[structopt(short = "n", long = "count")]
    count: usize,

    /// Maximum number of traitors tolerated.
    #[structopt(short = "m", long = "traitors")]
    traitors: usize,

    /// Whether this node itself behaves as a traitor.
    #[structopt(long = "faulty")]
    faulty: bool,

    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbose: u8,
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
    let consensus = Arc::new(ByzantineConsensus::<Order>::new(opt.id, opt.count, opt.traitors));
    let next_value: Box<dyn NextValue<Order> + Send + Sync> =
        if opt.faulty { Box::new(Faulty::default()) } else { Box::new(Honest) };
    let service = Arc::new(NodeService {
        consensus,
        transport: NetTransport::new(peers),
        next_value,
        default: Order::Retreat,
    });

    let addr = transport::node_addr(opt.port, opt.id);
    if let Err(error) = transport::serve(addr, service).await {
        log::error!("[{}] server exited: {}", opt.id, error);
        std::process::exit(1);
    }
}
