use std::sync::Arc;

use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "inc-server")]
struct Opt {
    /// Port to listen on.
    #[structopt(short = "p", long = "port", default_value = "7000")]
    port: u16,

    /// Verbosity: -v, -vv, -vvv.
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("[inc-server][{}][{}]: {}", record.level(), record.target(), message))
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
    init_logging(opt.verbose);
    let addr: std::net::SocketAddr = format!("127.0.0.1:{}", opt.port).parse().unwrap();
    let counter = Arc::new(counter::Counter::default());
    if let Err(error) = transport::serve(addr, counter).await {
        log::error!("server exited: {}", error);
        std::process::exit(1);
    }
}
