// SPDX-License-Identifier: MIT OR Apache-2.0

//! Snapshot recorder for HTTP cameras.

mod fetch;
mod mp4;
mod registry;
mod storage;

use anyhow::Error;
use clap::Parser;

#[derive(Parser)]
#[command(version, about)]
enum Cmd {
    /// Downloads one snapshot from every camera in the registry file.
    Fetch(fetch::Opts),
    /// Assembles downloaded snapshots into an MJPEG `.mp4` file.
    Mp4(mp4::Opts),
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();
    let cmd = Cmd::parse();
    match cmd {
        Cmd::Fetch(opts) => fetch::run(opts).await,
        Cmd::Mp4(opts) => mp4::run(opts).await,
    }
}
