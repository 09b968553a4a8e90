use std::error::Error;
use std::path::Path;

use clap::Parser;
use log::{info, warn};

use shmem::{CacheConfig, CacheDaemon, ContentStore, Shutdown};

#[derive(clap::Parser)]
#[clap(about = "Serves files from a manifest to the proxy over shared memory")]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "simplecached.toml")]
    config: String,
    #[clap(short = 'm', long = "manifest")]
    manifest: Option<String>,
    #[clap(short = 't', long = "nthreads")]
    nthreads: Option<usize>,
    /// Artificial lookup delay in microseconds.
    #[clap(short = 'd', long = "delay")]
    delay_us: Option<u64>,
}

impl Opts {
    fn apply(&self, cfg: &mut CacheConfig) {
        if let Some(manifest) = &self.manifest {
            cfg.manifest = manifest.clone();
        }
        if let Some(nthreads) = self.nthreads {
            cfg.nthreads = nthreads;
        }
        if let Some(delay_us) = self.delay_us {
            cfg.delay_us = delay_us;
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts: Opts = Opts::parse();
    let mut cfg: CacheConfig = confy::load_path(&opts.config)?;
    opts.apply(&mut cfg);
    cfg.validate()?;
    info!("{:?}", &cfg);

    let store = ContentStore::open(Path::new(&cfg.manifest), cfg.delay())?;
    let shutdown = Shutdown::new();
    let _signals = shutdown.listen_for_signals()?;
    let daemon = CacheDaemon::start(&cfg, store, &shutdown)?;

    shutdown.wait();
    let stuck = daemon.join();
    if stuck > 0 {
        warn!("Exiting with {} workers blocked on abandoned segments", stuck);
    }
    info!("Bye");
    Ok(())
}
