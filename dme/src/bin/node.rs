use std::sync::Arc;

use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "dme-node")]
struct Opt {
    #[structopt(short = "i", long = "id")]
    id: usize,

    #[structopt(short = "p", long = "port", default_value = "9100")]
    port: u16,

    #[structopt(short = "c", long = "count")]
    count: usize,

    #[structopt(short = "l", long = "loops", default_value = "100")]
    loops: usize,

    #[structopt(long = "counter-port", default_value = "7000")]
    counter_port: u16,

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
    let counter_addr = format!("127.0.0.1:{}", opt.counter_port).parse().unwrap();
    let node = Arc::new(dme::RaNode::new(opt.id, peers, counter_addr));
    let service = Arc::new(dme::Service { node, num_loops: opt.loops });

    let addr = transport::node_addr(opt.port, opt.id);
    if let Err(error) = transport::serve(addr, service).await {
        log::error!("[{}] server exited: {}", opt.id, error);
        std::process::exit(1);
    }
}
