//! # muxproxy server
//!
//! The server binary: parse flags, load the route file, bind the
//! listeners, and run the accept loops until something fatal happens.
//!
//! Everything that can be wrong with the configuration (unreadable route
//! file, bad route lines, unbindable addresses) is fatal here, before any
//! connection is accepted. After startup, only a broken listener stops the
//! process; per-connection problems are logged and absorbed.

use std::sync::{
	atomic::{AtomicUsize, Ordering},
	Arc,
};

use anyhow::anyhow;
use muxproxy::{
	config::Config,
	router::Router,
	server::Server,
	util::{SERVER_HELP, SERVER_NAME},
};
use pico_args::Arguments;
use tokio::runtime::Builder;
use tracing::{debug, info, Level};
use tracing_subscriber::{filter::FilterFn, prelude::*, FmtSubscriber};

fn main() -> Result<(), anyhow::Error> {
	// Parse cli args
	let mut args = Arguments::from_env();

	if args.contains(["-h", "--help"]) {
		println!("{SERVER_HELP}");
		return Ok(());
	}

	let config = Config::from_args(&mut args)?;

	let unknown = args.finish();
	if !unknown.is_empty() {
		return Err(anyhow!("unexpected arguments: {unknown:?}\n\n{SERVER_HELP}"));
	}

	// Logging: everything at or above the configured level, with debug
	// events suppressed unless --debug was given
	let max_level = if config.debug {
		Level::DEBUG
	} else {
		Level::INFO
	};
	let tracing_filter = FilterFn::new(move |metadata| metadata.level() <= &max_level);
	let tracing_subscriber = FmtSubscriber::builder()
		.with_level(true)
		.with_max_level(Level::TRACE)
		.finish()
		.with(tracing_filter);
	tracing::subscriber::set_global_default(tracing_subscriber)
		.expect("setting tracing default subscriber failed");

	let server = &*SERVER_NAME;
	info!(%server, "muxproxy starting");
	debug!(?config, "server configuration parsed");

	let router = Arc::new(
		Router::from_file(&config.route_file)
			.map_err(|err| anyhow!("couldn't read config file: {err}"))?,
	);

	// Start tokio async runtime
	let rt = Builder::new_multi_thread()
		.enable_all()
		.thread_name_fn(|| {
			static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
			let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);
			format!("muxproxy-worker-{id:#04x}")
		})
		.build()
		.expect("async runtime initialization");

	let server = rt.block_on(async { Server::bind(&config.listen, router) })?;
	for addr in server.local_addrs() {
		info!("muxproxy listening on {addr}");
	}

	rt.block_on(server.run())?;
	Ok(())
}
