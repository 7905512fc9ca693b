//! Process shutdown plumbing.

#[cfg(unix)]
pub async fn shutdown() {
	use std::process;

	use tokio::signal::unix::{SignalKind, signal};
	use tracing::info;

	async fn watch(kind: SignalKind, name: &'static str) {
		signal(kind)
			.expect("failed to register signal handler")
			.recv()
			.await;
		info!("received signal {name}, starting shutdown");
	}

	tokio::select! {
		_ = watch(SignalKind::interrupt(), "SIGINT") => {
			tokio::spawn(async {
				watch(SignalKind::interrupt(), "SIGINT").await;
				info!("double ctrl-c, exiting immediately");
				process::exit(0);
			});
		},
		_ = watch(SignalKind::terminate(), "SIGTERM") => {},
	}
}

#[cfg(not(unix))]
pub async fn shutdown() {
	use tracing::info;

	tokio::signal::ctrl_c()
		.await
		.expect("failed to register signal handler");
	info!("received ctrl-c, starting shutdown");
}
