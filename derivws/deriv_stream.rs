// derivws/deriv_stream.rs
use anyhow::{bail, Context, Result};
use clap::Parser;
use derivws::config::validate_app_id;
use derivws::{ClientConfig, DerivClient, StreamEvent, StreamUpdate};
use env_logger::Env;
use log::{info, warn};
use std::time::{Duration, Instant};

/// Stream Deriv market data to stdout
#[derive(Parser, Debug)]
#[command(author, version, about = "Stream ticks and candles from the Deriv WebSocket API")]
struct CliArgs {
  /// Underlying symbol, e.g. R_100 or frxEURUSD
  #[arg(long, default_value = "R_100")]
  symbol: String,

  /// Also stream candles of this many seconds
  #[arg(long)]
  ohlc: Option<u32>,

  /// Fetch this many historical one-minute candles before streaming
  #[arg(long, default_value = "0")]
  history: u32,

  /// How long to stream, in seconds
  #[arg(long, default_value = "30")]
  duration: u64,

  /// Application id (overrides DERIV_APP_ID)
  #[arg(long)]
  app_id: Option<String>,

  /// API token; enables account data
  #[arg(long, env = "DERIV_API_TOKEN", hide_env_values = true)]
  token: Option<String>,
}

fn print_update(update: &StreamUpdate) {
  match update {
    StreamUpdate::Tick(t) => println!("tick  {} {} {}", t.epoch, t.symbol, t.quote),
    StreamUpdate::Ohlc(c) => {
      println!("ohlc  {} {} o={} h={} l={} c={}", c.open_time, c.symbol, c.open, c.high, c.low, c.close)
    }
    other => println!("{:?}", other),
  }
}

// Flags win over the environment, and get the same validation.
fn apply_overrides(config: &mut ClientConfig, args: &CliArgs) -> Result<()> {
  if let Some(app_id) = &args.app_id {
    validate_app_id(app_id).context("invalid --app-id")?;
    config.app_id = app_id.clone();
  }
  if args.token.is_some() {
    config.api_token = args.token.clone();
  }
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
  let args = CliArgs::parse();

  let mut config = ClientConfig::from_env().context("reading configuration")?;
  apply_overrides(&mut config, &args)?;

  let client = DerivClient::new(config);
  client.add_connection_observer(|connected: bool| info!("Connected: {}", connected));
  client.connect()?;
  client.wait_connected(Duration::from_secs(20)).await.context("connecting")?;

  if let Some(info) = client.get_account_info() {
    info!("Authorized as {} ({} {:.2})", info.login_id, info.currency, info.balance);
  }

  if args.history > 0 {
    let candles = client.get_candles(&args.symbol, 60, args.history).await?;
    if candles.is_empty() {
      bail!("no history for {}", args.symbol);
    }
    for c in &candles {
      println!("hist  {} o={} h={} l={} c={}", c.epoch, c.open, c.high, c.low, c.close);
    }
  }

  let ticks = client.stream_ticks(&args.symbol)?;
  let candles = match args.ohlc {
    Some(granularity) => Some(client.stream_ohlc(&args.symbol, granularity)?),
    None => None,
  };

  // The handles block on receive, so poll them from a blocking thread.
  let deadline = Instant::now() + Duration::from_secs(args.duration);
  let streams = tokio::task::spawn_blocking(move || {
    while Instant::now() < deadline {
      if let Some(event) = ticks.next_timeout(Duration::from_millis(200)) {
        match event {
          StreamEvent::Update(update) => print_update(&update),
          StreamEvent::Error(e) => warn!("Tick stream failed: {}", e),
        }
      }
      if let Some(stream) = candles.as_ref() {
        for event in stream.drain() {
          match event {
            StreamEvent::Update(update) => print_update(&update),
            StreamEvent::Error(e) => warn!("Candle stream failed: {}", e),
          }
        }
      }
    }
    // Dropping the handles unsubscribes.
  });
  streams.await?;

  if client.is_connected() {
    let stats = client.get_account_stats();
    info!("Session P/L {:.2} over {} contract(s).", stats.total_profit, stats.contracts_seen);
  }
  client.disconnect();
  Ok(())
}
