//! Data-channel worker: serves the decoder's read and seek requests from the
//! host's [`MediaSource`].
//!
//! One connection at a time. The decoder writes `Play{size}` ("I need `size`
//! more bytes") or `Seek{offset}` records; a read request is answered with
//! raw bytes only, a seek with nothing. When the source runs dry before
//! `size` bytes were written the connection is closed, which the decoder
//! reads as end of stream, and the worker goes back to accepting.

use std::io::{self, SeekFrom, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use mb_protocol::{stream, Opcode, ProtocolError};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::MediaSource;

/// Chunk size used when copying from the source into the socket.
const COPY_CHUNK: usize = 64 * 1024;

/// Worker notifications, drained by the player on its own tick.
#[derive(Debug)]
pub(crate) enum DataEvent {
    /// A decoder connection ended; `served` bytes went out over it.
    Closed { served: u64, short_read: bool },
    /// The source failed a read or seek. Reads are treated as end of stream.
    SourceError(io::Error),
    /// The decoder sent something unreadable; the connection was dropped.
    Desync(ProtocolError),
}

/// Handle to the running worker thread.
pub(crate) struct DataServer {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    active: Arc<Mutex<Option<UnixStream>>>,
    events: Receiver<DataEvent>,
    worker: Option<JoinHandle<()>>,
}

impl DataServer {
    /// Start serving connections accepted on `listener` (bound at `path`).
    pub fn spawn(
        listener: UnixListener,
        path: &Path,
        source: Box<dyn MediaSource>,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let active = Arc::new(Mutex::new(None));
        let (tx, events) = unbounded();

        let worker = {
            let stop = Arc::clone(&stop);
            let active = Arc::clone(&active);
            thread::Builder::new()
                .name("data-worker".into())
                .spawn(move || accept_loop(listener, source, stop, active, tx))?
        };

        Ok(Self {
            path: path.to_path_buf(),
            stop,
            active,
            events,
            worker: Some(worker),
        })
    }

    /// Pending worker notifications, without blocking.
    pub fn try_event(&self) -> Option<DataEvent> {
        self.events.try_recv().ok()
    }

    /// Stop the worker and wait for it. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        self.stop.store(true, Ordering::SeqCst);

        // Unblock a read on the live connection, then the accept
        if let Some(conn) = self.active.lock().as_ref() {
            let _ = conn.shutdown(std::net::Shutdown::Both);
        }
        if let Err(e) = UnixStream::connect(&self.path) {
            debug!("Data worker wake-up connect failed: {}", e);
        }

        if worker.join().is_err() {
            warn!("Data worker panicked");
        }
        debug!("Data worker stopped");
    }
}

impl Drop for DataServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: UnixListener,
    mut source: Box<dyn MediaSource>,
    stop: Arc<AtomicBool>,
    active: Arc<Mutex<Option<UnixStream>>>,
    tx: Sender<DataEvent>,
) {
    for conn in listener.incoming() {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        let conn = match conn {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Data channel accept failed: {}", e);
                continue;
            }
        };

        match conn.try_clone() {
            Ok(clone) => *active.lock() = Some(clone),
            Err(e) => warn!("Failed to track data connection: {}", e),
        }
        // shutdown() may have looked for a live connection before it was stored
        if stop.load(Ordering::SeqCst) {
            break;
        }

        debug!("Decoder connected to data channel");
        let event = serve(conn, source.as_mut(), &tx);
        *active.lock() = None;

        if tx.send(event).is_err() {
            break;
        }
    }

    info!("Data worker exiting");
}

/// Answer requests on one connection until it ends.
fn serve(mut conn: UnixStream, source: &mut dyn MediaSource, tx: &Sender<DataEvent>) -> DataEvent {
    let mut served = 0u64;
    let mut buf = vec![0u8; COPY_CHUNK];

    loop {
        let cmd = match stream::read_command(&mut conn) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => {
                return DataEvent::Closed {
                    served,
                    short_read: false,
                }
            }
            Err(ProtocolError::UnknownOpcode(op)) => {
                debug!("Ignoring unknown data request {:#x}", op);
                continue;
            }
            Err(ProtocolError::Io(e)) if e.kind() == io::ErrorKind::ConnectionReset => {
                return DataEvent::Closed {
                    served,
                    short_read: false,
                }
            }
            Err(e) => return DataEvent::Desync(e),
        };

        match cmd.opcode {
            Opcode::Play => {
                let wanted = cmd.arg0;
                let sent = match forward(&mut conn, source, wanted, &mut buf, tx) {
                    Ok(sent) => sent,
                    Err(e) => {
                        // Decoder went away mid-transfer
                        debug!("Data connection write failed: {}", e);
                        return DataEvent::Closed {
                            served,
                            short_read: false,
                        };
                    }
                };
                served += sent;
                trace!(wanted, sent, "Served read request");

                if sent < wanted {
                    debug!(served, "Source exhausted, closing data connection");
                    return DataEvent::Closed {
                        served,
                        short_read: true,
                    };
                }
            }
            Opcode::Seek => {
                trace!(offset = cmd.arg0, "Seek request");
                if let Err(e) = source.seek(SeekFrom::Start(cmd.arg0)) {
                    warn!("Source seek to {} failed: {}", cmd.arg0, e);
                    let _ = tx.send(DataEvent::SourceError(e));
                }
            }
            other => debug!("Ignoring {:?} on data channel", other),
        }
    }
}

/// Copy up to `wanted` bytes from the source to the connection.
fn forward(
    conn: &mut UnixStream,
    source: &mut dyn MediaSource,
    wanted: u64,
    buf: &mut [u8],
    tx: &Sender<DataEvent>,
) -> io::Result<u64> {
    let mut sent = 0u64;

    while sent < wanted {
        let chunk = (wanted - sent).min(buf.len() as u64) as usize;
        let n = match source.read(&mut buf[..chunk]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Source read failed: {}", e);
                let _ = tx.send(DataEvent::SourceError(e));
                0
            }
        };
        if n == 0 {
            break;
        }

        conn.write_all(&buf[..n])?;
        sent += n as u64;
    }

    Ok(sent)
}
