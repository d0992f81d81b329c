//! Bidirectional relay between a client and the next hop.
//!
//! A reader thread per socket forwards what it reads over a bounded channel;
//! the pump thread writes each chunk to the opposite socket and reports what
//! happened. A poll that sees nothing for its whole interval counts as idle,
//! and the relay is abandoned once enough consecutive idle polls add up.

use std::io::{self, Read, Write};
use std::net::{Shutdown as SocketShutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

use crate::constants::RELAY_CHUNK;

/// Chunks a reader may run ahead of the pump.
const READ_AHEAD: usize = 8;

/// One step of the relay.
#[derive(Debug, PartialEq, Eq)]
pub enum PumpEvent<'a> {
    /// Bytes read from the client and already written to the origin.
    FromClient(&'a [u8]),
    /// Bytes read from the origin and already written to the client.
    FromOrigin(&'a [u8]),
    ClientClosed,
    OriginClosed,
    Idle,
    /// Idle limit reached.
    Abandoned,
}

/// Which peer a relayed chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Origin,
}

/// Byte totals of a finished relay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_bytes: u64,
    pub origin_bytes: u64,
    pub abandoned: bool,
}

enum Message {
    Data(Side, Vec<u8>),
    Closed(Side),
    Failed(io::Error),
}

pub struct Pump<'s> {
    client: &'s TcpStream,
    origin: &'s TcpStream,
    events: Receiver<Message>,
    readers: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    poll: Duration,
    last: Vec<u8>,
    idle_polls: u32,
    max_idle_polls: u32,
}

impl<'s> Pump<'s> {
    pub fn new(
        client: &'s TcpStream,
        origin: &'s TcpStream,
        poll: Duration,
        max_idle_polls: u32,
    ) -> io::Result<Self> {
        let poll = poll.max(Duration::from_millis(1));
        // readers wake once per poll to notice the stop flag
        client.set_read_timeout(Some(poll))?;
        origin.set_read_timeout(Some(poll))?;

        let (sender, events) = bounded(READ_AHEAD);
        let stop = Arc::new(AtomicBool::new(false));
        let mut pump = Self {
            client,
            origin,
            events,
            readers: Vec::with_capacity(2),
            stop,
            poll,
            last: Vec::new(),
            idle_polls: 0,
            max_idle_polls: max_idle_polls.max(1),
        };
        for (side, stream) in [(Side::Client, client), (Side::Origin, origin)] {
            let stream = stream.try_clone()?;
            let sender = sender.clone();
            let stop = pump.stop.clone();
            let name = match side {
                Side::Client => "relay-client",
                Side::Origin => "relay-origin",
            };
            pump.readers.push(
                thread::Builder::new()
                    .name(name.into())
                    .spawn(move || read_side(stream, side, &sender, &stop))?,
            );
        }
        Ok(pump)
    }

    pub fn poll(&mut self) -> io::Result<PumpEvent<'_>> {
        match self.events.recv_timeout(self.poll) {
            Ok(Message::Data(side, bytes)) => {
                let mut peer = match side {
                    Side::Client => self.origin,
                    Side::Origin => self.client,
                };
                peer.write_all(&bytes)?;
                self.idle_polls = 0;
                self.last = bytes;
                Ok(match side {
                    Side::Client => PumpEvent::FromClient(&self.last),
                    Side::Origin => PumpEvent::FromOrigin(&self.last),
                })
            }
            Ok(Message::Closed(Side::Client)) => {
                // origin sees end of request; a failure here only means it
                // already went away
                let _ = self.origin.shutdown(SocketShutdown::Write);
                Ok(PumpEvent::ClientClosed)
            }
            Ok(Message::Closed(Side::Origin)) | Err(RecvTimeoutError::Disconnected) => {
                let _ = self.client.shutdown(SocketShutdown::Write);
                Ok(PumpEvent::OriginClosed)
            }
            Ok(Message::Failed(err)) => Err(err),
            Err(RecvTimeoutError::Timeout) => {
                self.idle_polls += 1;
                if self.idle_polls >= self.max_idle_polls {
                    Ok(PumpEvent::Abandoned)
                } else {
                    Ok(PumpEvent::Idle)
                }
            }
        }
    }

    /// Polls until the origin closes or the idle limit is reached, handing
    /// every relayed chunk to `observe`.
    pub fn run(mut self, mut observe: impl FnMut(Side, &[u8])) -> io::Result<RelayStats> {
        let mut stats = RelayStats::default();
        loop {
            match self.poll()? {
                PumpEvent::FromClient(bytes) => {
                    stats.client_bytes += bytes.len() as u64;
                    observe(Side::Client, bytes);
                }
                PumpEvent::FromOrigin(bytes) => {
                    stats.origin_bytes += bytes.len() as u64;
                    observe(Side::Origin, bytes);
                }
                PumpEvent::ClientClosed | PumpEvent::Idle => {}
                PumpEvent::OriginClosed => return Ok(stats),
                PumpEvent::Abandoned => {
                    stats.abandoned = true;
                    return Ok(stats);
                }
            }
        }
    }
}

impl Drop for Pump<'_> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // a reader blocked on a full channel sees the disconnect
        drop(std::mem::replace(&mut self.events, crossbeam_channel::never()));
        for reader in self.readers.drain(..) {
            if reader.join().is_err() {
                tracing::warn!("relay reader panicked");
            }
        }
    }
}

fn read_side(mut stream: TcpStream, side: Side, sender: &Sender<Message>, stop: &AtomicBool) {
    let mut buf = vec![0; RELAY_CHUNK];
    while !stop.load(Ordering::SeqCst) {
        let message = match read_some(&mut stream, &mut buf) {
            Ok(None) => continue,
            Ok(Some(0)) => Message::Closed(side),
            Ok(Some(n)) => Message::Data(side, buf[..n].to_vec()),
            Err(err) => Message::Failed(err),
        };
        let done = !matches!(message, Message::Data(..));
        if sender.send(message).is_err() || done {
            return;
        }
    }
}

/// `Ok(None)` when the read timed out.
fn read_some(stream: &mut impl Read, buf: &mut [u8]) -> io::Result<Option<usize>> {
    match stream.read(buf) {
        Ok(n) => Ok(Some(n)),
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ) =>
        {
            Ok(None)
        }
        Err(err) if err.kind() == io::ErrorKind::ConnectionReset => Ok(Some(0)),
        Err(err) => Err(err),
    }
}
