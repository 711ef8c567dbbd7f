//! Accept loop and shutdown coordination.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::proxy::{self, ProxyContext};

/// Bind the listener with `SO_REUSEADDR` so a restarted monitor can take the
/// port back immediately.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    let resolved = tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| Error::Msg(format!("cannot resolve bind address '{addr}'")))?;
    let socket = if resolved.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(resolved)?;
    Ok(socket.listen(1024)?)
}

/// Accept clients until shutdown, dialing the upstream and spawning one
/// relay worker per connection. Workers observe the same shutdown broadcast;
/// a worker that loses the event log triggers it.
pub async fn run(
    listener: TcpListener,
    upstream_addr: String,
    ctx: Arc<ProxyContext>,
    shutdown: watch::Sender<bool>,
) -> Result<()> {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        let (client, addr) = tokio::select! {
            _ = shutdown_rx.changed() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        tracing::debug!(%addr, "accepted connection");
        let ctx = ctx.clone();
        let upstream_addr = upstream_addr.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let upstream = match TcpStream::connect(&upstream_addr).await {
                Ok(s) => s,
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                    tracing::warn!(%addr, "Upstream connection refused: is Mongo up?");
                    return;
                }
                Err(e) => {
                    tracing::warn!(%addr, error = %e, "failed to reach upstream");
                    return;
                }
            };
            let shutdown_rx = shutdown.subscribe();
            if let Err(e) = proxy::run_connection(client, upstream, ctx, shutdown_rx).await {
                if matches!(e, Error::LogWrite(_)) {
                    // Losing the event log defeats the honeypot; bring the
                    // whole process down.
                    tracing::error!(error = %e, "fatal event log failure; shutting down");
                    let _ = shutdown.send(true);
                } else {
                    tracing::error!(%addr, error = %e, "connection worker failed");
                }
            }
        });
    }
}

/// Bind on `bind_addr` and run the accept loop in a background task.
/// Returns the bound address and the shutdown handle; used by tests and by
/// anyone embedding the proxy.
pub async fn spawn_with_shutdown(
    bind_addr: &str,
    upstream_addr: String,
    ctx: Arc<ProxyContext>,
) -> Result<(SocketAddr, watch::Sender<bool>, JoinHandle<Result<()>>)> {
    let listener = bind(bind_addr).await?;
    let addr = listener.local_addr()?;
    let (shutdown, _) = watch::channel(false);
    let handle = tokio::spawn(run(listener, upstream_addr, ctx, shutdown.clone()));
    Ok((addr, shutdown, handle))
}
