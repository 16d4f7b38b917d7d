use std::error::Error;
use std::sync::Arc;

use crossbeam_channel::select;
use log::{error, info};
use structopt::StructOpt;

mod cli;
mod config;
mod dht;
mod error;

use crate::cli::Opt;
use crate::dht::crawl::Shutdown;
use crate::dht::Crawler;


fn main() -> Result<(), Box<dyn Error>> {
    let opt = Opt::from_args();

    let mut logger = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] {}",
                record.level(),
                message
            ))
        })
        .level(opt.log_level)
        .chain(std::io::stderr());
    if let Some(path) = &opt.log_file {
        logger = logger.chain(fern::log_file(path)?);
    }
    logger.apply()?;

    let config = opt.config()?;
    let (discovery_sink, discoveries) = crossbeam_channel::unbounded();

    let crawler = Arc::new(Crawler::bind(config, discovery_sink)?);
    info!("listening on {} as {}", crawler.local_addr()?, crawler.id());

    let shutdown = Shutdown::new();
    let workers = crawler.start(&shutdown)?;

    let exited = loop {
        select! {
            recv(discoveries) -> discovery => match discovery {
                Ok(discovery) => println!("{}", discovery),
                Err(_) => break None,
            },
            recv(workers.exited) -> name => break name.ok(),
        }
    };

    drop(shutdown);
    workers.join();

    match exited {
        // nothing restarts a dead loop, so take the whole process down
        Some(name) => {
            error!("{} loop exited, shutting down", name);
            Err(format!("{} loop exited", name).into())
        }
        None => Ok(()),
    }
}
