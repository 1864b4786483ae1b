//! Client side of the data channel
//!
//! The decoder never sees the media file. Every byte comes from the host
//! through `Play{size}` read requests on a Unix stream connection, and
//! repositioning goes through `Seek{offset}`. The connection is owned by a
//! reader thread; the pipeline asks it for byte ranges and picks up the
//! answers without blocking the control loop.

use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use mb_protocol::{stream, Command};
use tracing::{debug, trace, warn};

/// Largest single read request sent to the host.
pub const REQUEST_SIZE: usize = 4096;

/// Bytes fetched for one request, tagged with where they start.
///
/// Shorter than requested only at the end of the stream.
#[derive(Debug)]
pub struct Chunk {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// A byte source a pipeline pulls from by request.
///
/// Answers arrive in request order.
pub trait ByteSource {
    /// Total stream length in bytes.
    fn stream_len(&self) -> u64;

    /// Ask for `len` bytes starting at `offset`.
    fn request(&mut self, offset: u64, len: usize) -> io::Result<()>;

    /// The next answer, if one has arrived.
    fn try_chunk(&mut self) -> Option<io::Result<Chunk>>;

    /// Block until the next answer arrives.
    fn wait_chunk(&mut self) -> io::Result<Chunk>;

    /// Drop any connection state; the next request starts afresh.
    fn release(&mut self) {}
}

enum Request {
    Fetch { offset: u64, len: usize },
    Release,
}

/// Handle to the `data-reader` thread, which owns the [`DataSource`].
///
/// Dropping the handle stops the thread and waits for it.
pub struct DataReader {
    stream_len: u64,
    requests: Option<Sender<Request>>,
    chunks: Receiver<io::Result<Chunk>>,
    worker: Option<JoinHandle<()>>,
}

impl DataReader {
    pub fn spawn(source: DataSource) -> io::Result<Self> {
        let stream_len = source.stream_size;
        let (request_tx, request_rx) = channel::unbounded();
        let (chunk_tx, chunk_rx) = channel::unbounded();

        let worker = thread::Builder::new()
            .name("data-reader".to_string())
            .spawn(move || read_loop(source, request_rx, chunk_tx))?;

        Ok(Self {
            stream_len,
            requests: Some(request_tx),
            chunks: chunk_rx,
            worker: Some(worker),
        })
    }

    fn send(&self, request: Request) -> io::Result<()> {
        self.requests
            .as_ref()
            .ok_or_else(reader_stopped)?
            .send(request)
            .map_err(|_| reader_stopped())
    }
}

impl ByteSource for DataReader {
    fn stream_len(&self) -> u64 {
        self.stream_len
    }

    fn request(&mut self, offset: u64, len: usize) -> io::Result<()> {
        self.send(Request::Fetch { offset, len })
    }

    fn try_chunk(&mut self) -> Option<io::Result<Chunk>> {
        match self.chunks.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(reader_stopped())),
        }
    }

    fn wait_chunk(&mut self) -> io::Result<Chunk> {
        self.chunks.recv().map_err(|_| reader_stopped())?
    }

    fn release(&mut self) {
        if let Err(e) = self.send(Request::Release) {
            debug!("Could not release data channel: {}", e);
        }
    }
}

impl Drop for DataReader {
    fn drop(&mut self) {
        // Closing the request channel ends the read loop
        self.requests = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Data reader thread panicked");
            }
        }
    }
}

fn reader_stopped() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "data reader stopped")
}

fn read_loop(
    mut source: DataSource,
    requests: Receiver<Request>,
    chunks: Sender<io::Result<Chunk>>,
) {
    debug!("Data reader started");

    for request in requests.iter() {
        match request {
            Request::Fetch { offset, len } => {
                let result = fetch(&mut source, offset, len).map(|bytes| Chunk { offset, bytes });
                if chunks.send(result).is_err() {
                    break;
                }
            }
            Request::Release => source.release(),
        }
    }

    debug!("Data reader stopped");
}

fn fetch(source: &mut DataSource, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    source.seek(SeekFrom::Start(offset))?;

    let mut bytes = Vec::with_capacity(len);
    source.by_ref().take(len as u64).read_to_end(&mut bytes)?;
    trace!(offset, wanted = len, got = bytes.len(), "Fetched");
    Ok(bytes)
}

/// Reads the host's media bytes over the data channel.
///
/// Connects lazily, and again after the host ended a connection with a
/// short read.
#[derive(Debug)]
pub struct DataSource {
    path: PathBuf,
    conn: Option<UnixStream>,
    stream_size: u64,
    position: u64,
}

impl DataSource {
    pub fn new(path: impl Into<PathBuf>, stream_size: u64) -> Self {
        Self {
            path: path.into(),
            conn: None,
            stream_size,
            position: 0,
        }
    }

    fn connection(&mut self) -> io::Result<&mut UnixStream> {
        if self.conn.is_none() {
            let mut conn = UnixStream::connect(&self.path)?;
            debug!("Connected data channel {}", self.path.display());

            // A fresh connection carries no position; restate ours
            stream::write_command(&mut conn, &Command::stream_seek(self.position))?;
            self.conn = Some(conn);
        }

        self.conn
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }

    fn request(&mut self, size: usize) -> io::Result<()> {
        let cmd = Command::read_request(size as u32);
        let result = self
            .connection()
            .and_then(|conn| stream::write_command(conn, &cmd));

        match result {
            Ok(()) => Ok(()),
            // The host closed an idle connection; one retry on a new one
            Err(e) if is_disconnect(&e) => {
                debug!("Data channel dropped ({}), reconnecting", e);
                self.conn = None;
                let conn = self.connection()?;
                stream::write_command(conn, &cmd)
            }
            Err(e) => Err(e),
        }
    }

    /// Close the connection; the next read connects again.
    pub fn release(&mut self) {
        if self.conn.take().is_some() {
            debug!("Data channel released");
        }
    }
}

impl Read for DataSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.stream_size.saturating_sub(self.position);
        let wanted = buf.len().min(REQUEST_SIZE).min(remaining as usize);
        if wanted == 0 {
            return Ok(0);
        }

        self.request(wanted)?;

        let Some(conn) = self.conn.as_mut() else {
            return Ok(0);
        };
        let mut filled = 0;
        while filled < wanted {
            match conn.read(&mut buf[filled..wanted]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_disconnect(&e) => break,
                Err(e) => return Err(e),
            }
        }

        self.position += filled as u64;
        trace!(wanted, filled, position = self.position, "Data read");

        if filled < wanted {
            // Short read: the host closed this connection
            debug!(position = self.position, "Data channel reached end of stream");
            self.conn = None;
        }
        Ok(filled)
    }
}

impl Seek for DataSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.stream_size.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start of stream"))?;

        if target == self.position && self.conn.is_some() {
            return Ok(target);
        }

        self.position = target;

        // Without a connection the position is restated on the next connect
        if let Some(conn) = self.conn.as_mut() {
            if let Err(e) = stream::write_command(conn, &Command::stream_seek(target)) {
                debug!("Seek on dropped data channel: {}", e);
                self.conn = None;
            }
        }
        Ok(target)
    }
}

/// In-memory source answering every request immediately, unless held.
#[cfg(test)]
pub struct MemorySource {
    data: Vec<u8>,
    answers: std::collections::VecDeque<Chunk>,
    held: std::sync::Arc<std::sync::atomic::AtomicBool>,
    pub releases: usize,
}

#[cfg(test)]
impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            answers: Default::default(),
            held: Default::default(),
            releases: 0,
        }
    }

    /// While set, `try_chunk` reports nothing ready.
    pub fn hold(&self) -> std::sync::Arc<std::sync::atomic::AtomicBool> {
        std::sync::Arc::clone(&self.held)
    }
}

#[cfg(test)]
impl ByteSource for MemorySource {
    fn stream_len(&self) -> u64 {
        self.data.len() as u64
    }

    fn request(&mut self, offset: u64, len: usize) -> io::Result<()> {
        let start = (offset as usize).min(self.data.len());
        let end = start.saturating_add(len).min(self.data.len());
        self.answers.push_back(Chunk {
            offset,
            bytes: self.data[start..end].to_vec(),
        });
        Ok(())
    }

    fn try_chunk(&mut self) -> Option<io::Result<Chunk>> {
        if self.held.load(std::sync::atomic::Ordering::SeqCst) {
            return None;
        }
        self.answers.pop_front().map(Ok)
    }

    fn wait_chunk(&mut self) -> io::Result<Chunk> {
        self.answers
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "nothing requested"))
    }

    fn release(&mut self) {
        self.releases += 1;
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::NotConnected
    )
}
