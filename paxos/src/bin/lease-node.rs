use std::sync::Arc;

use paxos::lease::{LeaseAcceptor, LeaseProposer, NodeService};
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "paxos-lease-node")]
struct Opt {
    #[structopt(short = "i", long = "id")]
    id: usize,

    #[structopt(short = "p", long = "port", default_value = "9700")]
    port: u16,

    #[structopt(short = "c", long = "count")]
    count: usize,

    /// Globally-known maximal lease time, in seconds.
    #[structopt(long = "lease-seconds", default_value = "5.0")]
    lease_seconds: f64,

    /// Enables proactive extension at the halfway point of the lease.
    #[structopt(long = "extend")]
    extend: bool,

    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbose: u8,
}

fn init_logging(id: usize, verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!("[{}][{}][{}]: {}", id, record.level(), record.target(), message))
        })
        .level(level)
        .level_for("tokio_util", log::LevelFilter::Warn)
        .chain(std::io::stdout())
        .apply()
        .expect("[INTERNAL ERROR]: logger already initialized");
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    init_logging(opt.id, opt.verbose);

    let peers = (0..opt.count).map(|id| transport::node_addr(opt.port, id)).collect();
    let proposer = Arc::new(LeaseProposer::new(opt.id, peers, opt.lease_seconds, opt.extend));
    let service = Arc::new(NodeService { id: opt.id, acceptor: LeaseAcceptor::new(), proposer });

    let addr = transport::node_addr(opt.port, opt.id);
    if let Err(error) = transport::serve(addr, service).await {
        log::error!("[{}] server exited: {}", opt.id, error);
        std::process::exit(1);
    }
}
