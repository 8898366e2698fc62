use std::process;
use std::time::Duration;

use crate::pinger::StopHandle;

/// Generate a random identifier for ICMP packets
pub fn generate_identifier() -> u16 {
    use rand::Rng;
    rand::thread_rng().gen_range(1..=65535)
}

/// Print error message and exit with error code
pub fn exit_with_error(message: &str, code: i32) -> ! {
    eprintln!("vrfping: {}", message);
    process::exit(code);
}

/// Parse a duration such as `500ms`, `10s`, `1.5m` or `1m30s`.
///
/// A duration is one or more number and unit pairs; units are `ns`, `us`
/// (or `µs`), `ms`, `s`, `m` and `h`. A bare `0` is also accepted.
pub fn parse_duration(input: &str) -> anyhow::Result<Duration> {
    let input = input.trim();
    if input == "0" {
        return Ok(Duration::ZERO);
    }
    if input.is_empty() {
        return Err(anyhow::anyhow!("empty duration"));
    }

    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    let mut rest = input;
    let mut nanos = 0.0f64;

    while !rest.is_empty() {
        let number_end = rest.find(|c: char| !is_number(c)).unwrap_or(rest.len());
        let (value, tail) = rest.split_at(number_end);
        let value: f64 = value
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid number in duration '{}'", input))?;

        let unit_end = tail.find(is_number).unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);
        let nanos_per_unit = match unit {
            "" => return Err(anyhow::anyhow!("missing unit in duration '{}'", input)),
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(anyhow::anyhow!("unknown unit '{}' in duration '{}'", unit, input)),
        };

        nanos += value * nanos_per_unit;
        rest = tail;
    }

    let nanos = nanos.round();
    if !nanos.is_finite() || nanos > u64::MAX as f64 {
        return Err(anyhow::anyhow!("duration '{}' is out of range", input));
    }
    Ok(Duration::from_nanos(nanos as u64))
}

/// Stop the session on Ctrl+C. Repeated signals are harmless.
pub fn setup_signal_handler(stop: StopHandle) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupt received, stopping");
            stop.stop();
        }
    });
}
