use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use liteproxy::adnl::AdnlServer;
use liteproxy::config::{ConfigError, DispatchMode, ServerConfig};
use liteproxy::keys::{IdentityRegistry, Keyring};
use liteproxy::limiter::RateLimiter;
use liteproxy::metrics::{self, Metrics};
use liteproxy::proxy::{Router, RouterConfig};
use liteproxy::signal;
use liteproxy::store::UserStore;
use liteproxy::upstream::{UpstreamClient, UpstreamHandle};
use prometheus_client::registry::Registry;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "lite-proxy", long_about = None)]
struct Args {
	/// Lite-server config path
	#[arg(short = 'S', long = "server-config", value_name = "file")]
	server_config: PathBuf,
	/// Database path (keyring and rate limits)
	#[arg(short = 'D', long = "db", value_name = "dir")]
	db: PathBuf,
	/// IP address to serve on
	#[arg(short = 'I', long = "ip")]
	ip: IpAddr,
	/// Client-facing lite port
	#[arg(short = 'L', long = "lite-port")]
	lite_port: u16,
	/// Port advertised for the datagram transport
	#[arg(short = 'A', long = "adnl-port")]
	adnl_port: u16,
	/// Global network config path
	#[arg(short = 'C', long = "config", value_name = "file")]
	global_config: Option<PathBuf>,
	/// Dispatch mode: 0 = single-pick, 1 = race
	#[arg(short = 'm', long = "mode", default_value_t = 1)]
	mode: u32,
	/// Worker threads
	#[arg(short = 't', long = "threads", default_value_t = 20)]
	threads: usize,
	/// Verbosity (0..=9)
	#[arg(short = 'v', long = "verbosity", default_value_t = 0)]
	verbosity: u8,
	/// Metrics listen address
	#[arg(long = "metrics-addr", default_value = "127.0.0.1:19000")]
	metrics_addr: SocketAddr,
}

fn main() -> ExitCode {
	let args = Args::parse();
	init_logging(args.verbosity);

	// Everything configuration-shaped fails fast, before the runtime exists.
	if !(1..=256).contains(&args.threads) {
		error!("--threads must be in range [1..256]");
		return ExitCode::from(2);
	}
	let cfg = match ServerConfig::load(&args.server_config) {
		Ok(cfg) => cfg,
		Err(e) => {
			error!("{e}");
			return ExitCode::from(2);
		},
	};
	let mode = match DispatchMode::from_flag(args.mode) {
		Ok(mode) => mode,
		Err(e) => {
			error!("{e}");
			return ExitCode::from(2);
		},
	};
	if let Some(path) = &args.global_config {
		// The global network config belongs to the transport collaborator;
		// we only refuse to start on unreadable or non-JSON input.
		if let Err(e) = load_global_config(path) {
			error!("{e}");
			return ExitCode::from(2);
		}
	}

	let runtime = match tokio::runtime::Builder::new_multi_thread()
		.worker_threads(args.threads)
		.enable_all()
		.build()
	{
		Ok(runtime) => runtime,
		Err(e) => {
			error!("failed to build runtime: {e}");
			return ExitCode::FAILURE;
		},
	};

	match runtime.block_on(run(args, cfg, mode)) {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			error!("fatal: {e:#}");
			ExitCode::FAILURE
		},
	}
}

fn init_logging(verbosity: u8) {
	let default = match verbosity {
		0 => "info",
		1 => "debug",
		_ => "trace",
	};
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();
}

fn load_global_config(path: &PathBuf) -> Result<serde_json::Value, ConfigError> {
	let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
		path: path.display().to_string(),
		source,
	})?;
	Ok(serde_json::from_str(&raw)?)
}

async fn run(args: Args, cfg: ServerConfig, mode: DispatchMode) -> anyhow::Result<()> {
	info!(
		ip = %args.ip,
		lite_port = args.lite_port,
		adnl_port = args.adnl_port,
		?mode,
		"start lite-proxy"
	);

	let ct = CancellationToken::new();
	let mut prom = Registry::default();
	let metrics = Arc::new(Metrics::new(&mut prom));

	let mut keyring = Keyring::open(args.db.join("keyring"))?;
	if keyring.is_empty() {
		let id = keyring.generate()?;
		info!(%id, "generated local identity");
	}

	let identities = IdentityRegistry::new();
	let admin_ids: HashSet<_> = cfg
		.admin_identities()?
		.into_iter()
		.map(|(id, key)| {
			identities.register(*key.as_bytes());
			info!(admin = %id, "admin identity registered");
			id
		})
		.collect();

	let store = UserStore::open(args.db.join("rate-limits"))?;
	let (limiter, limiter_handle, users) = RateLimiter::new(
		store,
		identities.clone(),
		metrics.clone(),
		ct.child_token(),
	);
	tokio::spawn(limiter.run());

	let (events_tx, events_rx) = mpsc::channel(1024);
	let deadline = Duration::from_millis(cfg.query_deadline_ms);
	let upstreams: Vec<UpstreamHandle> = cfg
		.resolved_upstreams()?
		.iter()
		.map(|u| UpstreamClient::spawn(u, deadline, events_tx.clone(), ct.child_token()))
		.collect();
	info!(count = upstreams.len(), "private lite-servers configured");

	let (inbound_tx, inbound_rx) = mpsc::channel(1024);
	let server = AdnlServer::bind(
		SocketAddr::new(args.ip, args.lite_port),
		inbound_tx,
		ct.child_token(),
	)
	.await?;
	info!(addr = %server.local_addr(), "lite endpoint ready");

	let router = Router::new(
		RouterConfig::new(&cfg, mode),
		upstreams,
		users,
		admin_ids,
		limiter_handle,
		metrics,
		inbound_rx,
		events_rx,
		ct.child_token(),
	);
	tokio::spawn(router.run());

	let listener = tokio::net::TcpListener::bind(args.metrics_addr).await?;
	let app = metrics::App::new(Arc::new(prom));
	let metrics_ct = ct.child_token();
	tokio::spawn(async move {
		let _ = axum::serve(listener, app.router())
			.with_graceful_shutdown(async move { metrics_ct.cancelled().await })
			.await;
	});

	signal::shutdown().await;
	ct.cancel();
	Ok(())
}
