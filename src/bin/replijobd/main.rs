mod args;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use replijob::cluster::MemoryCluster;
use replijob::controller::Node;
use replijob::server::{serve_conn, NodeHandle, NodeTask};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::{select, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::EnvFilter;

use crate::args::Args;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if args.debug { "trace" } else { "info" })
    });
    if args.debug {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    }

    if args.nodes == 0 {
        error!("unsupported configuration: at least one node is required");
        return ExitCode::from(2);
    }

    // Cancellation and termination channel. Every task holds a sender, so
    // recv() returns once all of them have wound down.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    let (shutdown_hold, mut shutdown_wait) = mpsc::channel::<()>(1);

    let exit_code =
        if let Err(error) = begin(args, cancel.clone(), shutdown_hold).await {
            error!(%error, "encountered runtime error");
            // Bring down whatever did start.
            cancel.cancel();
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        };

    shutdown_wait.recv().await;

    exit_code
}

/// Starts every local node, fully meshed, each behind its own listener.
/// Nothing is spawned unless every listener could be bound.
async fn begin(
    args: Args,
    cancel: CancellationToken,
    shutdown_hold: mpsc::Sender<()>,
) -> Result<()> {
    let configs: Vec<_> = (0..args.nodes).map(|n| args.node_config(n)).collect();

    let mut listeners = Vec::with_capacity(configs.len());
    for n in 0..args.nodes {
        let port = args
            .port
            .checked_add(n)
            .context("not enough ports for all nodes")?;
        let listener = TcpListener::bind((args.listen, port))
            .await
            .with_context(|| format!("binding port {port}"))?;
        listeners.push(listener);
    }

    let (inboxes, receivers): (Vec<_>, Vec<_>) =
        configs.iter().map(|_| mpsc::unbounded_channel()).unzip();

    let mut accepting = Vec::with_capacity(configs.len());
    for ((config, peers), listener) in
        configs.iter().zip(receivers).zip(listeners)
    {
        let mut cluster = MemoryCluster::new(config.node_id);
        for (other, inbox) in configs.iter().zip(&inboxes) {
            if other.node_id != config.node_id {
                cluster.connect(other.node_id, inbox.clone());
            }
        }

        info!(
            addr = %listener.local_addr()?,
            node = %config.node_id,
            "listening"
        );

        let (task, handle) =
            NodeTask::new(Node::new(config.clone(), cluster), peers);
        {
            let cancel = cancel.clone();
            let hold = shutdown_hold.clone();
            tokio::spawn(async move {
                task.run(cancel).await;
                drop(hold);
            });
        }

        accepting.push(tokio::spawn(accept_loop(
            listener,
            handle,
            cancel.clone(),
            shutdown_hold.clone(),
        )));
    }

    for accept in accepting {
        accept.await.context("accept loop panicked")?;
    }

    Ok(())
}

/// Accepts incoming connections until an exit signal is sent, and handles
/// each connection as its own task.
async fn accept_loop(
    listener: TcpListener,
    node: NodeHandle,
    cancel: CancellationToken,
    shutdown_hold: mpsc::Sender<()>,
) {
    loop {
        let conn = match select! {
            accept = listener.accept() => accept,
            _ = cancel.cancelled() => break,
        } {
            Ok((conn, _)) => conn,
            Err(error) => {
                warn!(%error, "failed to accept connection");
                continue;
            },
        };

        tokio::spawn(begin_handle(
            node.clone(),
            cancel.clone(),
            shutdown_hold.clone(),
            conn,
        ));
    }
}

#[instrument(name = "handle", err, fields(peer = %conn.peer_addr()?), skip_all)]
async fn begin_handle(
    node: NodeHandle,
    cancel: CancellationToken,
    _shutdown_hold: mpsc::Sender<()>,
    mut conn: TcpStream,
) -> Result<()> {
    conn.set_nodelay(true).context("setting NODELAY")?;

    let ret = serve_conn(node, cancel, &mut conn).await;

    conn.shutdown().await.context("during shutdown")?;
    debug!("shut down connection");

    ret.context("serving connection")
}
