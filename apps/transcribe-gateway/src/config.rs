use clap::Parser;
use std::net::SocketAddr;
use transcribe_dispatch::DispatchConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "transcribe-gateway", about = "HTTP admission gateway for the transcription dispatcher")]
pub struct GatewayConfig {
	#[command(flatten)]
	pub dispatch: DispatchConfig,

	#[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8093", help = "Address the HTTP listener binds")]
	pub listen_addr: SocketAddr,

	#[arg(long, env = "RUST_LOG", default_value = "info,tower_http=warn")]
	pub rust_log: String,

	#[arg(long, env = "LOG_JSON", default_value = "false", help = "Emit logs as JSON lines instead of pretty text")]
	pub log_json: bool,

	#[arg(long, env = "PROVISION_DELAY_MS", default_value = "45000", help = "Simulated worker boot time in milliseconds")]
	pub provision_delay_ms: u64,

	#[arg(
        long,
        env = "SIM_TIME_SCALE",
        default_value = "1.0",
        help = "Compression factor for simulated inference time; 0.001 turns a 13s job into 13ms"
    )]
	pub sim_time_scale: f64,
}
