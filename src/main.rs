mod config;
mod conn;
mod decode;
mod feed;
mod pipeline;
mod poll;
mod pool;
mod wire;

use crate::config::Config;
use crate::conn::StoreConnection;
use crate::decode::{FrameDecoder, CHANNEL_ORDER, NUM_STREAMS};
use crate::feed::MongoFeed;
use crate::pipeline::Inserter;
use crate::poll::PollLoop;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,pmu_forwarder=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();
}

fn print_usage() {
    eprintln!("usage: pmu-forwarder <serial> <stream-uuid>...");
    eprintln!("The first argument is the serial number of the uPMU to forward data for.");
    eprintln!("The remaining {NUM_STREAMS} arguments are the destination stream UUIDs,");
    eprintln!("in the following order:");
    for channel in CHANNEL_ORDER {
        eprintln!("  {channel}");
    }
}

fn parse_targets(args: &[String]) -> Result<[Uuid; NUM_STREAMS]> {
    let mut targets = [Uuid::nil(); NUM_STREAMS];
    for (i, raw) in args.iter().enumerate() {
        targets[i] = Uuid::parse_str(raw.trim())
            .with_context(|| format!("invalid stream UUID for {}: {raw}", CHANNEL_ORDER[i]))?;
    }
    Ok(targets)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() != NUM_STREAMS + 1 {
        print_usage();
        std::process::exit(2);
    }

    init_tracing();
    let config = Config::load()?;
    let serial = args[0].trim().to_string();
    let targets = parse_targets(&args[1..])?;

    let conn = Arc::new(
        StoreConnection::connect(&config.destination_addr)
            .await
            .with_context(|| format!("cannot connect to destination store at {}", config.destination_addr))?,
    );
    let feed = MongoFeed::connect(
        &config.mongo_uri,
        &config.mongo_database,
        &config.mongo_collection,
    )
    .await
    .context("cannot open source store of received files")?;

    let inserter = Inserter::new(
        Arc::clone(&conn),
        targets,
        Arc::new(FrameDecoder),
        config.max_inflight_sends,
    );
    let poll = PollLoop::new(
        Arc::new(feed),
        inserter,
        serial.clone(),
        config.poll_interval(),
    );

    let shutdown = CancellationToken::new();
    let mut handle = tokio::spawn(poll.run(shutdown.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received; waiting for the current scan to finish");
            shutdown.cancel();
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "poll loop task failed");
            }
        }
        res = &mut handle => {
            if let Err(err) = res {
                tracing::error!(error = %err, "poll loop task failed");
            }
        }
    }

    match conn.shutdown().await {
        Ok(()) => tracing::info!(serial = %serial, "closed destination connection"),
        Err(err) => tracing::warn!(serial = %serial, error = %err, "could not close destination connection"),
    }

    Ok(())
}
