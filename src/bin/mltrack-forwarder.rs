//! Forwarder process entry point
//!
//! Spawned by the log shipper with `<remote> <local-port> <parent-pid>`;
//! relays log frames from the parent's loopback socket to the collector
//! until end-of-stream or the parent goes away.

use anyhow::Context;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (remote, local_port, parent_pid) =
        mltrack::logship::forwarder::parse_args(&args).context("bad arguments")?;

    mltrack::logship::forwarder::run(&remote, local_port, parent_pid)
        .await
        .context("relay failed")
}
