mod api;
mod config;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, fmt::format::JsonFields, util::SubscriberInitExt, Layer};
use transcribe_dispatch::{DispatchService, Provisioner, SimProvisioner, SimulatedBackend};

use config::GatewayConfig;

/// Drain window for reclaimed or scaled-down simulated workers, sized to
/// the conventional two-minute spot reclaim notice.
const DRAIN_GRACE: Duration = Duration::from_secs(120);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
	dotenv::dotenv().ok();
	let config = GatewayConfig::parse();
	init_tracing(&config);

	let backend = Arc::new(SimulatedBackend::new(config.sim_time_scale));
	let service = DispatchService::new(config.dispatch.clone(), backend)?;

	info!(
		addr = %config.listen_addr,
		queue_capacity = config.dispatch.queue_capacity,
		provision_delay_ms = config.provision_delay_ms,
		"starting transcription gateway"
	);

	let cancel = CancellationToken::new();

	// Heartbeats must outpace the staleness sweep or healthy workers get
	// reaped as lost.
	let heartbeat_every = config.dispatch.heartbeat_timeout / 3;
	let provisioner = Arc::new(SimProvisioner::new(Duration::from_millis(config.provision_delay_ms), heartbeat_every, DRAIN_GRACE));

	let service_handle = tokio::spawn(Arc::clone(&service).run(cancel.clone()));

	let plan_rx = service.capacity_plan();
	let events = service.worker_events();
	let prov = Arc::clone(&provisioner);
	let prov_cancel = cancel.clone();
	let provisioner_handle = tokio::spawn(async move { prov.run(plan_rx, events, prov_cancel).await });

	let app = api::router(Arc::clone(&service)).layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

	let listener = TcpListener::bind(config.listen_addr).await?;
	info!(addr = %listener.local_addr()?, "🎧 Gateway listening, accepting transcription requests");

	let signal_cancel = cancel.clone();
	tokio::spawn(async move {
		wait_for_shutdown_signal().await;
		info!("🛑 Shutdown signal received (SIGTERM/SIGINT)");
		signal_cancel.cancel();
	});

	let serve_cancel = cancel.clone();
	axum::serve(listener, app)
		.with_graceful_shutdown(async move { serve_cancel.cancelled().await })
		.await?;

	info!("listener stopped; draining dispatch loops");
	cancel.cancel();

	let drain = async {
		if let Err(e) = service_handle.await? {
			error!(error = %e, "dispatch loop exited with error");
		}
		provisioner_handle.await?;
		anyhow::Ok(())
	};
	match tokio::time::timeout(SHUTDOWN_WAIT, drain).await {
		Ok(result) => result?,
		Err(_) => error!("drain timed out, exiting anyway"),
	}

	info!("✅ Shutdown complete");
	Ok(())
}

async fn wait_for_shutdown_signal() {
	let ctrl_c = async {
		signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
	};

	#[cfg(unix)]
	let terminate = async {
		signal::unix::signal(signal::unix::SignalKind::terminate())
			.expect("failed to install SIGTERM handler")
			.recv()
			.await;
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}

fn init_tracing(config: &GatewayConfig) {
	use std::str::FromStr;
	use tracing_subscriber::layer::SubscriberExt;

	let filter = EnvFilter::from_str(&config.rust_log).unwrap_or_else(|_| EnvFilter::new("info"));

	tracing_subscriber::registry()
		.with(if config.log_json {
			Box::new(
				tracing_subscriber::fmt::layer()
					.fmt_fields(JsonFields::default())
					.event_format(tracing_subscriber::fmt::format().json().flatten_event(true).with_span_list(false))
					.with_filter(filter),
			) as Box<dyn Layer<_> + Send + Sync>
		} else {
			Box::new(
				tracing_subscriber::fmt::layer()
					.event_format(tracing_subscriber::fmt::format().pretty())
					.with_filter(filter),
			)
		})
		.init();
}
