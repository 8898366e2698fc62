mod cli;

use anyhow::Context;
use vrfping::{Pinger, stats, utils};

#[tokio::main]
async fn main() {
    // Enable debug logging if RUST_LOG is set
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    }

    if let Err(e) = run().await {
        utils::exit_with_error(&format!("{:#}", e), 1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = cli::parse_args()?;

    let mut pinger = Pinger::resolve(&args.target, args.family, args.pinger_config())
        .await
        .with_context(|| format!("cannot ping '{}'", args.target))?;

    pinger
        .on_reply(|packet| println!("{}", stats::format_response(packet, false)))
        .on_duplicate(|packet| println!("{}", stats::format_response(packet, true)))
        .on_finish(|statistics| println!("{}", statistics.format_summary()));

    utils::setup_signal_handler(pinger.stop_handle());

    println!(
        "{}",
        stats::format_header(
            &args.target,
            pinger.addr(),
            args.source_address,
            args.interface.as_deref()
        )
    );

    pinger
        .run()
        .await
        .context("failed to ping target host")?;
    Ok(())
}
