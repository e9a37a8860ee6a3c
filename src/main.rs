//! Process entry point: signal setup, argument handling, resolution,
//! listener startup, reactor run.

use std::env;
use std::process;

use log::error;
use nix::sys::signal::{signal, SigHandler, Signal};

use connbridge::bridge::Acceptor;
use connbridge::fs::JournalStore;
use connbridge::io::Reactor;
use connbridge::net::resolve;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Broken pipes must surface as write errors, not kill the process.
    if let Err(err) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
        eprintln!("Unable to ignore SIGPIPE: {err}");
        process::exit(1);
    }

    let args: Vec<String> = env::args().collect();
    if args.len() < 5 {
        let prog = args.first().map(String::as_str).unwrap_or("connbridge");
        eprintln!("Usage: {prog} srcaddr srcport destaddr destport");
        process::exit(1);
    }
    let (srcnode, srcservice) = (&args[1], &args[2]);
    let (destnode, destservice) = (&args[3], &args[4]);

    let destaddrs = resolve(destnode, destservice).unwrap_or_else(|err| {
        error!("{err}");
        process::exit(1);
    });
    // Only the first destination address is ever dialed.
    let Some(upstream) = destaddrs.into_iter().next() else {
        error!("no valid addresses for destination node '{destnode}' service '{destservice}'");
        process::exit(1);
    };

    let srcaddrs = resolve(srcnode, srcservice).unwrap_or_else(|err| {
        error!("{err}");
        process::exit(1);
    });

    let mut reactor = Reactor::new().unwrap_or_else(|err| {
        error!("{err}");
        process::exit(1);
    });
    let store = JournalStore::new(".");

    // A listener that fails to start is skipped, not fatal.
    for addr in &srcaddrs {
        if let Err(err) = Acceptor::start(&mut reactor, addr, upstream.clone(), store.clone()) {
            error!("{err}");
        }
    }

    if let Err(err) = reactor.run() {
        error!("{err}");
        process::exit(1);
    }

    eprintln!("No more listeners.");
}
