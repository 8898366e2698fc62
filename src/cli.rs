use clap::{Arg, ArgAction, ArgMatches, Command};
use std::net::IpAddr;
use std::time::Duration;

use vrfping::utils::parse_duration;
use vrfping::{IpFamily, PingerConfig};

const EXAMPLES: &str = "\
Examples:

    # ping 10.0.0.2 through the VRF device vrf-priv1 from 10.0.0.3
    vrfping --src 10.0.0.3 --if vrf-priv1 --privileged 10.0.0.2

    # ping 5 times at 500ms intervals
    vrfping -c 5 -i 500ms www.example.com

    # ping for 10 seconds
    vrfping -t 10s www.example.com

    # send a privileged raw ICMP ping with a 100-byte payload
    sudo vrfping --privileged -s 100 1.1.1.1";

#[derive(Debug, Clone)]
pub struct PingArgs {
    pub target: String,
    /// `None` pings until interrupted.
    pub count: Option<u32>,
    pub interval: Duration,
    pub timeout: Duration,
    pub size: usize,
    pub privileged: bool,
    pub source_address: Option<IpAddr>,
    pub interface: Option<String>,
    pub family: Option<IpFamily>,
}

impl PingArgs {
    pub fn pinger_config(&self) -> PingerConfig {
        PingerConfig {
            count: self.count,
            interval: self.interval,
            timeout: self.timeout,
            size: self.size,
            privileged: self.privileged,
            source: self.source_address,
            interface: self.interface.clone(),
            ..PingerConfig::default()
        }
    }
}

pub fn build_cli() -> Command {
    Command::new("vrfping")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Send ICMP echo requests, optionally pinned to a source address and interface")
        .after_help(EXAMPLES)
        .arg(
            Arg::new("target")
                .help("Target hostname or IP address")
                .required(true)
                .index(1)
        )
        .arg(
            Arg::new("count")
                .short('c')
                .help("Number of echo requests to send, -1 for unlimited")
                .value_name("count")
                .default_value("-1")
                .allow_negative_numbers(true)
                .value_parser(clap::value_parser!(i64).range(-1..=u32::MAX as i64))
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .help("Wait between echo requests, e.g. 500ms")
                .value_name("interval")
                .default_value("1s")
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .help("Stop after this long regardless of replies, e.g. 10s or 1m30s")
                .value_name("timeout")
                .default_value("100000s")
        )
        .arg(
            Arg::new("size")
                .short('s')
                .help("Echo payload size in bytes")
                .value_name("size")
                .default_value("16")
                .value_parser(clap::value_parser!(usize))
        )
        .arg(
            Arg::new("privileged")
                .long("privileged")
                .help("Use a raw socket (requires root or CAP_NET_RAW)")
                .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("source_address")
                .long("src")
                .help("Source address to send from")
                .value_name("address")
                .value_parser(clap::value_parser!(IpAddr))
        )
        .arg(
            Arg::new("interface")
                .long("if")
                .help("Interface or VRF device to bind to")
                .value_name("interface")
        )
        .arg(
            Arg::new("force_ipv4")
                .short('4')
                .help("Force using IPv4")
                .action(ArgAction::SetTrue)
                .conflicts_with("force_ipv6")
        )
        .arg(
            Arg::new("force_ipv6")
                .short('6')
                .help("Force using IPv6")
                .action(ArgAction::SetTrue)
        )
}

pub fn parse_args() -> anyhow::Result<PingArgs> {
    from_matches(&build_cli().get_matches())
}

fn from_matches(matches: &ArgMatches) -> anyhow::Result<PingArgs> {
    let target = matches
        .get_one::<String>("target")
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("missing target"))?;

    let count = match matches.get_one::<i64>("count").copied() {
        Some(-1) | None => None,
        Some(n) => Some(u32::try_from(n)?),
    };

    let duration = |name: &str| -> anyhow::Result<Duration> {
        let raw = matches
            .get_one::<String>(name)
            .ok_or_else(|| anyhow::anyhow!("missing {}", name))?;
        parse_duration(raw)
    };

    let family = if matches.get_flag("force_ipv4") {
        Some(IpFamily::V4)
    } else if matches.get_flag("force_ipv6") {
        Some(IpFamily::V6)
    } else {
        None
    };

    Ok(PingArgs {
        target,
        count,
        interval: duration("interval")?,
        timeout: duration("timeout")?,
        size: matches.get_one::<usize>("size").copied().unwrap_or(16),
        privileged: matches.get_flag("privileged"),
        source_address: matches.get_one::<IpAddr>("source_address").copied(),
        interface: matches.get_one::<String>("interface").cloned(),
        family,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<PingArgs> {
        let matches = build_cli().try_get_matches_from(std::iter::once("vrfping").chain(args.iter().copied()))?;
        from_matches(&matches)
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["10.0.0.2"]).unwrap();
        assert_eq!(args.target, "10.0.0.2");
        assert_eq!(args.count, None);
        assert_eq!(args.interval, Duration::from_secs(1));
        assert_eq!(args.timeout, Duration::from_secs(100_000));
        assert_eq!(args.size, 16);
        assert!(!args.privileged);
        assert_eq!(args.family, None);
    }

    #[test]
    fn test_vrf_options() {
        let args = parse(&[
            "--src", "10.0.0.3", "--if", "vrf-priv1", "--privileged", "-c", "5", "-i", "500ms", "-6", "host",
        ])
        .unwrap();
        assert_eq!(args.source_address, Some("10.0.0.3".parse().unwrap()));
        assert_eq!(args.interface.as_deref(), Some("vrf-priv1"));
        assert!(args.privileged);
        assert_eq!(args.count, Some(5));
        assert_eq!(args.interval, Duration::from_millis(500));
        assert_eq!(args.family, Some(IpFamily::V6));

        let config = args.pinger_config();
        assert_eq!(config.count, Some(5));
        assert_eq!(config.interface.as_deref(), Some("vrf-priv1"));

        let compound = parse(&["-t", "1m30s", "host"]).unwrap();
        assert_eq!(compound.timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(parse(&["-c", "-2", "host"]).is_err());
        assert!(parse(&["-i", "fast", "host"]).is_err());
        assert!(parse(&["-4", "-6", "host"]).is_err());
        assert!(parse(&[]).is_err());
    }
}
