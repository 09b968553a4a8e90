use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use log::{info, warn};

use shmem::{CacheProxy, ProxyConfig, Shutdown};

mod server;

#[derive(clap::Parser)]
#[clap(about = "GETFILE proxy answering from the shared memory cache")]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "webproxy.toml")]
    config: String,
    #[clap(short = 'p', long = "port")]
    port: Option<u16>,
    #[clap(short = 't', long = "thread-count")]
    nthreads: Option<usize>,
    #[clap(short = 'n', long = "segment-count")]
    nsegments: Option<usize>,
    #[clap(short = 'z', long = "segment-size")]
    segment_size: Option<usize>,
}

impl Opts {
    fn apply(&self, cfg: &mut ProxyConfig) {
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(nthreads) = self.nthreads {
            cfg.nthreads = nthreads;
        }
        if let Some(nsegments) = self.nsegments {
            cfg.nsegments = nsegments;
        }
        if let Some(segment_size) = self.segment_size {
            cfg.segment_size = segment_size;
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts: Opts = Opts::parse();
    let mut cfg: ProxyConfig = confy::load_path(&opts.config)?;
    opts.apply(&mut cfg);
    cfg.validate()?;
    info!("{:?}", &cfg);

    let shutdown = Shutdown::new();
    let _signals = shutdown.listen_for_signals()?;
    let proxy = Arc::new(CacheProxy::new(&cfg)?);
    {
        let proxy = Arc::clone(&proxy);
        shutdown.on_trigger(move || proxy.close());
    }

    let server = server::GfServer::bind(cfg.port)?;
    let workers = server.start(&proxy, cfg.nthreads, &shutdown)?;
    server.run(&shutdown);

    let stuck = workers.join_with_grace(cfg.shutdown_grace());
    if stuck > 0 {
        warn!("Tearing down with {} transfers still in progress", stuck);
    }
    proxy.teardown();
    info!("Bye");
    Ok(())
}
