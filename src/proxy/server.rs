//! Accept loop and fixed worker pool.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, bounded};

use crate::error::Result;
use crate::proxy::handler::{ProxyContext, handle_connection};
use crate::shutdown::Shutdown;

const ACCEPT_POLL: Duration = Duration::from_millis(100);

pub struct ProxyServer {
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
    workers: usize,
    shutdown: Shutdown,
}

impl ProxyServer {
    pub fn bind(
        addr: impl ToSocketAddrs,
        ctx: ProxyContext,
        workers: usize,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        // accept polls so the shutdown flag is noticed
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            ctx: Arc::new(ctx),
            workers: workers.max(1),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until shutdown is triggered, then waits for in-flight
    /// connections to finish.
    pub fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        tracing::info!(%addr, workers = self.workers, "proxy listening");

        let (sender, receiver) = bounded::<TcpStream>(self.workers * 4);
        let pool: Vec<JoinHandle<()>> = (0..self.workers)
            .map(|index| {
                let receiver = receiver.clone();
                let ctx = self.ctx.clone();
                thread::Builder::new()
                    .name(format!("proxy-worker-{index}"))
                    .spawn(move || worker(&receiver, &ctx))
            })
            .collect::<io::Result<_>>()?;
        drop(receiver);

        while !self.shutdown.is_triggered() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    tracing::trace!(%peer, "connection accepted");
                    if let Err(err) = stream.set_nonblocking(false) {
                        tracing::warn!(%peer, error = %err, "could not configure connection");
                        continue;
                    }
                    if sender.send(stream).is_err() {
                        tracing::warn!("worker pool gone; stopping accept loop");
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }

        drop(sender);
        for handle in pool {
            if handle.join().is_err() {
                tracing::warn!("proxy worker panicked");
            }
        }
        tracing::info!(%addr, "proxy stopped");
        Ok(())
    }

    /// Runs the server on its own thread.
    pub fn spawn(self) -> Result<JoinHandle<Result<()>>> {
        Ok(thread::Builder::new()
            .name("proxy-accept".into())
            .spawn(move || self.run())?)
    }
}

fn worker(receiver: &Receiver<TcpStream>, ctx: &ProxyContext) {
    for stream in receiver {
        let peer = stream.peer_addr().ok();
        if let Err(err) = handle_connection(stream, ctx) {
            tracing::debug!(peer = ?peer, error = %err, "connection failed");
        }
    }
}
