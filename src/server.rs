//! The mio event loop.
//!
//! A single thread owns the listener and every connection. Parsed requests
//! are handed to a worker pool; finished responses come back over a channel
//! and wake the loop through a mio `Registration`.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};
use mio::net::{TcpListener, TcpStream};
use slab::Slab;
use threadpool::ThreadPool;
use num_cpus;

use {Request, Response};
use errors::*;
use http_stream::HttpStreamReader;
use response::{self, ResponseMode};


const LISTENER: Token = Token(::std::usize::MAX - 1);
const WAKER: Token = Token(::std::usize::MAX - 2);

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Bytes pulled off a socket per read
const READ_CHUNK: usize = 4096;

/// How long the listener sits out after an accept error other than WouldBlock
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);


/// A bound, listening socket waiting for a handler
pub struct Server {
    listener: TcpListener,
    addr: SocketAddr,
}
impl Server {
    /// Bind and listen on the first address `addr` resolves to that accepts us.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Server> {
        let addrs = addr.to_socket_addrs().chain_err(|| "failed to resolve listen address")?;
        let mut last_err = None;
        for addr in addrs {
            match TcpListener::bind(&addr) {
                Ok(listener) => {
                    let addr = listener.local_addr()?;
                    return Ok(Server { listener, addr })
                }
                Err(e) => {
                    debug!("bind {} failed: {}", addr, e);
                    last_err = Some((addr, e));
                }
            }
        }
        match last_err {
            Some((addr, e)) => Err(Error::with_chain(e, ErrorKind::Bind(addr.to_string()))),
            None => Err(Error::with_chain(
                io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing"),
                ErrorKind::Bind("<unresolved>".into()))),
        }
    }

    /// The address actually bound, with any port `0` filled in
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Answer every request with `handler`.
    ///
    /// Only returns if polling itself fails.
    pub fn serve<F>(self, handler: F) -> Result<()>
        where F: Fn(Request) -> Response + Send + Sync + 'static
    {
        let mut event_loop = EventLoop::new(self.listener, self.addr, Arc::new(handler))?;
        event_loop.run()
    }
}


/// Bind `addr` and serve `handler` on it until a fatal error
pub fn start<A, F>(addr: A, handler: F) -> Result<()>
    where A: ToSocketAddrs,
          F: Fn(Request) -> Response + Send + Sync + 'static
{
    Server::bind(addr)?.serve(handler)
}


/// A handler's output, on its way back to the event loop
struct Completion {
    token: usize,
    id: u64,
    response: Response,
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Waiting on (more of) a request
    Reading,
    /// A request is with the worker pool
    Handling,
    /// Flush what's queued, then hang up
    Closing,
}

enum Step {
    Wait,
    Dispatch(Request),
    Close,
}


struct Connection {
    /// Distinguishes this connection from later ones reusing its slab slot
    id: u64,
    stream: TcpStream,
    reader: HttpStreamReader,
    state: State,
    mode: ResponseMode,
    write_buf: Vec<u8>,
    bytes_written: usize,
    read_closed: bool,
}
impl Connection {
    fn new(stream: TcpStream, id: u64) -> Self {
        Connection {
            id,
            stream,
            reader: HttpStreamReader::new(),
            state: State::Reading,
            mode: ResponseMode::closing(),
            write_buf: Vec::with_capacity(1024),
            bytes_written: 0,
            read_closed: false,
        }
    }

    /// Read one chunk off the socket into the reader.
    /// Returns `false` once the socket has nothing more for now.
    fn read_chunk(&mut self) -> io::Result<bool> {
        let mut buf = [0; READ_CHUNK];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.read_closed = true;
                    return Ok(true)
                }
                Ok(n) => {
                    self.reader.receive_chunk(&buf[..n]);
                    return Ok(true)
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write as much of the queued output as the socket takes
    fn flush(&mut self) -> io::Result<()> {
        while self.bytes_written < self.write_buf.len() {
            match self.stream.write(&self.write_buf[self.bytes_written..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "peer stopped accepting data"))
                }
                Ok(n) => self.bytes_written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Move the connection along as far as it can go without blocking.
    ///
    /// The socket is only read while a request is wanted and nothing is
    /// waiting to be written, and then one chunk at a time, so a client that
    /// never reads its responses gets TCP backpressure instead of buffering.
    fn advance(&mut self) -> io::Result<Step> {
        loop {
            self.flush()?;
            if self.bytes_written < self.write_buf.len() {
                // resumed by the next writable event
                return Ok(Step::Wait)
            }
            self.write_buf.clear();
            self.bytes_written = 0;

            match self.state {
                State::Handling => return Ok(Step::Wait),
                State::Closing => return Ok(Step::Close),
                State::Reading => {}
            }

            match self.reader.try_build_request() {
                Ok(Some(request)) => {
                    self.mode = ResponseMode::of(&request);
                    if self.read_closed {
                        self.mode.keep_alive = false;
                    }
                    self.state = State::Handling;
                    return Ok(Step::Dispatch(request))
                }
                Ok(None) => {
                    if self.reader.take_continue() {
                        self.write_buf.extend_from_slice(CONTINUE);
                        continue
                    }
                    if self.read_closed {
                        return Ok(Step::Close)
                    }
                    if !self.read_chunk()? {
                        // resumed by the next readable event
                        return Ok(Step::Wait)
                    }
                }
                Err(e) => {
                    debug!("rejecting request: {}", e);
                    self.write_buf = response::encode(&response::for_error(&e), ResponseMode::closing());
                    self.state = State::Closing;
                }
            }
        }
    }

    /// Queue the handler's response for the request in flight
    fn respond(&mut self, resp: &Response) {
        if self.state != State::Handling { return }
        self.write_buf.extend_from_slice(&response::encode(resp, self.mode));
        self.state = if self.mode.keep_alive { State::Reading } else { State::Closing };
    }
}


struct EventLoop<F> {
    poll: Poll,
    listener: TcpListener,
    addr: SocketAddr,
    connections: Slab<Connection>,
    next_id: u64,
    handler: Arc<F>,
    pool: ThreadPool,
    done_tx: Sender<Completion>,
    done_rx: Receiver<Completion>,
    _registration: Registration,
    waker: SetReadiness,
    accept_backoff: AcceptBackoff,
}
impl<F> EventLoop<F>
    where F: Fn(Request) -> Response + Send + Sync + 'static
{
    fn new(listener: TcpListener, addr: SocketAddr, handler: Arc<F>) -> Result<Self> {
        let poll = Poll::new()?;
        poll.register(&listener, LISTENER, Ready::readable(), PollOpt::level())?;

        let (registration, waker) = Registration::new2();
        poll.register(&registration, WAKER, Ready::readable(), PollOpt::edge())?;

        let (done_tx, done_rx) = mpsc::channel();
        let workers = num_cpus::get();
        debug!("starting {} handler workers", workers);
        Ok(EventLoop {
            poll,
            listener,
            addr,
            connections: Slab::with_capacity(1024),
            next_id: 0,
            handler,
            pool: ThreadPool::with_name("ok_responder-worker".into(), workers),
            done_tx,
            done_rx,
            _registration: registration,
            waker,
            accept_backoff: AcceptBackoff::default(),
        })
    }

    fn run(&mut self) -> Result<()> {
        info!("** Listening on {} **", self.addr);

        let mut events = Events::with_capacity(1024);
        loop {
            let timeout = self.accept_backoff.timeout(Instant::now());
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted { continue }
                return Err(e.into())
            }
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => self.complete(),
                    token => self.advance(token.0),
                }
            }
            if self.accept_backoff.expired(Instant::now()) {
                self.resume_accepting()?;
            }
        }
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    match self.register(stream) {
                        Ok(token) => debug!("opened connection {} to {}", token, peer),
                        Err(e) => warn!("failed to register connection from {}: {}", peer, e),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // the listener stays readable (e.g. out of descriptors),
                    // so stop polling it for a while rather than spin
                    warn!("accept failed, pausing for {:?}: {}", ACCEPT_BACKOFF, e);
                    if let Err(e) = self.poll.deregister(&self.listener) {
                        warn!("failed to pause listener: {}", e);
                    }
                    self.accept_backoff.pause(Instant::now());
                    break
                }
            }
        }
    }

    fn resume_accepting(&mut self) -> Result<()> {
        self.accept_backoff.resume();
        self.poll.register(&self.listener, LISTENER, Ready::readable(), PollOpt::level())?;
        debug!("accepting connections again");
        Ok(())
    }

    fn register(&mut self, stream: TcpStream) -> io::Result<usize> {
        stream.set_nodelay(true)?;
        let entry = self.connections.vacant_entry();
        let token = entry.key();
        self.poll.register(&stream, Token(token),
                           Ready::readable() | Ready::writable(),
                           PollOpt::edge())?;
        self.next_id += 1;
        entry.insert(Connection::new(stream, self.next_id));
        Ok(token)
    }

    fn advance(&mut self, token: usize) {
        let step = match self.connections.get_mut(token) {
            Some(conn) => conn.advance(),
            None => return,
        };
        match step {
            Ok(Step::Wait) => {}
            Ok(Step::Dispatch(request)) => self.dispatch(token, request),
            Ok(Step::Close) => self.close(token),
            Err(e) => {
                debug!("i/o error on connection {}: {}", token, e);
                self.close(token)
            }
        }
    }

    fn dispatch(&mut self, token: usize, request: Request) {
        let id = match self.connections.get(token) {
            Some(conn) => conn.id,
            None => return,
        };
        let handler = Arc::clone(&self.handler);
        let done = self.done_tx.clone();
        let waker = self.waker.clone();
        self.pool.execute(move || {
            let response = match panic::catch_unwind(AssertUnwindSafe(|| handler(request))) {
                Ok(response) => response,
                Err(_) => {
                    error!("request handler panicked");
                    response::internal_error()
                }
            };
            if done.send(Completion { token, id, response }).is_ok() {
                if let Err(e) = waker.set_readiness(Ready::readable()) {
                    warn!("failed to wake event loop: {}", e);
                }
            }
        });
    }

    /// Pick up every response the workers have finished
    fn complete(&mut self) {
        // reset before draining so a send racing with us re-arms the waker
        if let Err(e) = self.waker.set_readiness(Ready::empty()) {
            warn!("failed to reset waker: {}", e);
        }
        while let Ok(done) = self.done_rx.try_recv() {
            let live = match self.connections.get_mut(done.token) {
                Some(conn) if conn.id == done.id => {
                    conn.respond(&done.response);
                    true
                }
                _ => false,
            };
            if live {
                self.advance(done.token);
            } else {
                debug!("dropping response for closed connection {}", done.token);
            }
        }
    }

    fn close(&mut self, token: usize) {
        if !self.connections.contains(token) { return }
        let conn = self.connections.remove(token);
        if let Err(e) = self.poll.deregister(&conn.stream) {
            debug!("deregister of connection {} failed: {}", token, e);
        }
        debug!("closed connection {}", token);
    }
}


/// When a paused listener may be polled again
#[derive(Debug, Default)]
struct AcceptBackoff {
    until: Option<Instant>,
}
impl AcceptBackoff {
    fn pause(&mut self, now: Instant) {
        self.until = Some(now + ACCEPT_BACKOFF);
    }

    fn resume(&mut self) {
        self.until = None;
    }

    /// Longest the event loop may block while paused
    fn timeout(&self, now: Instant) -> Option<Duration> {
        self.until.map(|until| until.saturating_duration_since(now))
    }

    fn expired(&self, now: Instant) -> bool {
        self.until.map(|until| now >= until).unwrap_or(false)
    }
}
