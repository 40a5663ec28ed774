use clap::Parser;
use lazy_static::lazy_static;
use std::net::IpAddr;

/// Command line flags for the bridge process.
///
/// `--generate` and `--reset` are sub-modes handled in `main` before the
/// normal startup sequence runs; everything else configures a normal run.
#[derive(Parser, Debug)]
#[command(author, version, about = "Matrix application service bridging IRC networks", long_about = None)]
pub struct Args {
    /// Path to the appservice registration YAML.
    #[arg(short = 'c', long)]
    pub config: String,

    /// Address the transaction HTTP listener binds to.
    #[arg(short = 'l', long, default_value = "127.0.0.1")]
    pub listen_address: IpAddr,

    /// Port the transaction HTTP listener binds to.
    #[arg(short = 'p', long, default_value_t = 9898)]
    pub listen_port: u16,

    /// Drop privileges to this uid after binding listen sockets.
    #[arg(short = 'u', long)]
    pub uid: Option<u32>,

    /// Drop privileges to this gid after binding listen sockets.
    #[arg(short = 'g', long)]
    pub gid: Option<u32>,

    /// Enable the ident (RFC 1413) responder on port 113.
    #[arg(short = 'i', long, default_value_t = false)]
    pub identd: bool,

    /// Write a fresh registration file to the path given by `--config` and exit.
    #[arg(long, default_value_t = false)]
    pub generate: bool,

    /// Leave and forget every joined room, wipe persisted config, and exit.
    #[arg(long, default_value_t = false)]
    pub reset: bool,

    /// Pre-seed the bridge owner instead of waiting for the first direct invite.
    #[arg(short = 'o', long)]
    pub owner: Option<String>,

    /// Increase log verbosity; may be repeated.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Homeserver base URL the bridge talks to.
    #[arg(default_value = "http://localhost:8008")]
    pub homeserver: String,
}

pub fn args() -> &'static Args {
    lazy_static! {
        static ref ARGS: Args = Args::parse();
    }
    &ARGS
}
