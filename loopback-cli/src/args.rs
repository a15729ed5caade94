//! Command-line flags.

use std::path::PathBuf;
use std::time::Duration;

pub const USAGE: &str = "\
Usage: loopback [--config <file.json>] [--sample-rate <hz>] [--block-size <frames>]
                [--capacity <frames>] [--backend cpal|synthetic] [--duration <secs>]
                [--list-devices] [--stats-json] [--help]

Plays the default input device through the default output device until
Ctrl+C or --duration. Log level is taken from RUST_LOG.";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliArgs {
    pub config: Option<PathBuf>,
    pub sample_rate: Option<u32>,
    pub block_size: Option<u32>,
    pub capacity: Option<usize>,
    pub backend: Option<String>,
    pub duration: Option<Duration>,
    pub list_devices: bool,
    pub stats_json: bool,
    pub help: bool,
}

pub fn parse_args<I>(args: I) -> Result<CliArgs, String>
where
    I: IntoIterator<Item = String>,
{
    let mut out = CliArgs::default();
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --config".into());
                };
                out.config = Some(PathBuf::from(v));
            }
            "--sample-rate" => {
                out.sample_rate = Some(parse_positive(it.next(), "--sample-rate")?);
            }
            "--block-size" => {
                out.block_size = Some(parse_positive(it.next(), "--block-size")?);
            }
            "--capacity" => {
                out.capacity = Some(parse_positive::<u32>(it.next(), "--capacity")? as usize);
            }
            "--backend" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --backend".into());
                };
                match v.trim().to_ascii_lowercase().as_str() {
                    "cpal" | "synthetic" => out.backend = Some(v.trim().to_ascii_lowercase()),
                    other => return Err(format!("unknown backend: {other}")),
                }
            }
            "--duration" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --duration".into());
                };
                let secs = v
                    .parse::<f64>()
                    .ok()
                    .filter(|s| s.is_finite() && *s > 0.0)
                    .ok_or_else(|| "invalid value for --duration".to_string())?;
                out.duration = Some(Duration::from_secs_f64(secs));
            }
            "--list-devices" => out.list_devices = true,
            "--stats-json" => out.stats_json = true,
            "--help" | "-h" => out.help = true,
            other => {
                return Err(format!("unknown argument: {other}"));
            }
        }
    }
    Ok(out)
}

fn parse_positive<T>(value: Option<String>, flag: &str) -> Result<T, String>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let Some(v) = value else {
        return Err(format!("missing value for {flag}"));
    };
    v.parse::<T>()
        .ok()
        .filter(|n| *n > T::default())
        .ok_or_else(|| format!("invalid value for {flag}"))
}
