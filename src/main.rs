//! Producer/consumer harness for the shared memory channel.
//!
//! Two processes run this binary under the same channel name, one per role:
//!
//! ```text
//! shm-channel producer 10 1 5000 64
//! shm-channel consumer 10 1 5000 random
//! ```
//!
//! The channel itself never blocks or retries; the retry loops and their
//! delays all live here, so the polling policy can change without touching
//! the framing protocol.

use std::str::FromStr;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use shm_channel::{Channel, Role};

/// Payload length argument: a byte count or the literal `random`.
#[derive(Debug, Clone, Copy)]
enum LengthArg {
    Fixed(usize),
    Random,
}

impl FromStr for LengthArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s == "random" {
            Ok(LengthArg::Random)
        } else {
            s.parse::<usize>()
                .map(LengthArg::Fixed)
                .map_err(|_| format!("expected a byte count or \"random\", got {s:?}"))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum RoleArg {
    Producer,
    Consumer,
}

#[derive(Parser, Debug)]
#[command(name = "shm-channel", about = "Shared memory channel harness")]
struct Cli {
    /// Which side of the channel to run.
    #[arg(value_enum)]
    role: RoleArg,

    /// Delay in milliseconds between messages and between retries.
    sleep_ms: u64,

    /// Channel data capacity in mebibytes.
    capacity_mb: usize,

    /// Number of messages to exchange before exiting.
    count: u64,

    /// Payload length in bytes, or "random".
    length: LengthArg,

    /// Channel name both processes must agree on.
    #[arg(long, default_value = "shm-channel")]
    name: String,

    /// Log filter directive.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    // The argument grammar is part of the external contract: any malformed
    // invocation exits with -1 rather than clap's usual code.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            std::process::exit(-1);
        }
    };
    if let LengthArg::Fixed(0) = cli.length {
        eprintln!("error: payload length must be at least 1");
        std::process::exit(-1);
    }

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_level.as_str())
        .init();

    match cli.role {
        RoleArg::Producer => run_producer(&cli),
        RoleArg::Consumer => run_consumer(&cli),
    }
}

fn run_producer(cli: &Cli) -> Result<()> {
    let channel = Channel::open(&cli.name, cli.capacity_mb, Role::Producer)?;
    let delay = Duration::from_millis(cli.sleep_ms);
    // Seeded so repeated runs produce the same traffic.
    let mut rng = StdRng::seed_from_u64(0);
    let max_random = (channel.capacity() / 2).max(1);

    info!(name = %cli.name, count = cli.count, "producer up");
    for seq in 0..cli.count {
        let len = match cli.length {
            LengthArg::Fixed(len) => len,
            LengthArg::Random => rng.gen_range(1..=max_random),
        };
        let message = random_payload(&mut rng, len);

        while !channel.send(&message)? {
            // Backpressure: the consumer has not freed enough room yet.
            thread::sleep(delay);
        }
        debug!(seq, len, crc = crc32fast::hash(&message), "sent");
        thread::sleep(delay);
    }

    info!(count = cli.count, "producer done");
    Ok(())
}

fn run_consumer(cli: &Cli) -> Result<()> {
    let channel = Channel::open(&cli.name, cli.capacity_mb, Role::Consumer)?;
    let delay = Duration::from_millis(cli.sleep_ms);
    let mut buf = Vec::new();

    info!(name = %cli.name, count = cli.count, "consumer up");
    let mut remaining = cli.count;
    while remaining > 0 {
        let len = channel.peek_next_size();
        if len == 0 {
            std::hint::spin_loop();
            continue;
        }
        buf.resize(len, 0);
        if channel.receive(&mut buf)? {
            remaining -= 1;
            debug!(len, crc = crc32fast::hash(&buf), "received");
            thread::sleep(delay);
        }
    }

    info!(count = cli.count, "consumer done");
    Ok(())
}

/// Alphanumeric payload of `len` bytes, readable in logs and hexdumps.
fn random_payload(rng: &mut StdRng, len: usize) -> Bytes {
    let bytes: Vec<u8> = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .take(len)
        .collect();
    Bytes::from(bytes)
}
