use std::time::Duration;

use anyhow::{Context, bail};

pub const DEFAULT_ROOM: &str = "loopback";
pub const DEFAULT_PEERS: usize = 3;
/// More peers than this and a single process mostly measures its own CPU.
pub const MAX_PEERS: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct Args {
    pub room: String,
    pub peers: usize,
    pub sub_room: Option<String>,
    pub duration: Option<Duration>,
    /// Capture the first peer's audio from this PulseAudio source ("default" for the default one).
    pub mic: Option<String>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            room: DEFAULT_ROOM.to_string(),
            peers: DEFAULT_PEERS,
            sub_room: None,
            duration: None,
            mic: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Run(Args),
    Help,
    Version,
}

pub const USAGE: &str = "\
vortex-mesh - run a loopback Vortex room with several in-process peers

Configuration is read from VORTEX_CONFIG (default: vortex.toml) and VORTEX_* overrides.

USAGE:
    vortex-mesh [OPTIONS]

OPTIONS:
    --room <ID>             Room identifier [default: loopback]
    --peers <N>             Number of peers to start [default: 3]
    --sub-room <NAME>       Sub-room every peer joins [default: from config]
    --duration <SECS>       Stop after this many seconds [default: until Ctrl-C]
    --mic <SOURCE>          Capture the first peer from a PulseAudio source
    -V, --version           Print version and exit
    -h, --help              Print this help and exit";

pub fn parse_args() -> anyhow::Result<Command> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    parse_from(&args)
}

pub fn parse_from(args: &[String]) -> anyhow::Result<Command> {
    let mut parsed = Args::default();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => return Ok(Command::Version),
            "-h" | "--help" => return Ok(Command::Help),
            "--room" => {
                i += 1;
                parsed.room = args.get(i).context("Missing --room value")?.clone();
                if parsed.room.trim().is_empty() {
                    bail!("--room must not be empty");
                }
            }
            "--peers" => {
                i += 1;
                parsed.peers = args
                    .get(i)
                    .context("Missing --peers value")?
                    .parse()
                    .context("Invalid --peers value")?;
                if !(1..=MAX_PEERS).contains(&parsed.peers) {
                    bail!("--peers must be between 1 and {MAX_PEERS}");
                }
            }
            "--sub-room" => {
                i += 1;
                parsed.sub_room = Some(args.get(i).context("Missing --sub-room value")?.clone());
            }
            "--duration" => {
                i += 1;
                let secs: u64 = args
                    .get(i)
                    .context("Missing --duration value")?
                    .parse()
                    .context("Invalid --duration value")?;
                parsed.duration = Some(Duration::from_secs(secs));
            }
            "--mic" => {
                i += 1;
                parsed.mic = Some(args.get(i).context("Missing --mic value")?.clone());
            }
            other => bail!("Unknown argument: {other} (see --help)"),
        }
        i += 1;
    }

    Ok(Command::Run(parsed))
}
