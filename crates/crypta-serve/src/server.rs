//! The server event loop.
//!
//! One dedicated OS thread runs a classical poll loop over the listener,
//! a wakeup pipe and the client sockets. Translator calls may block the
//! loop briefly on disk and crypto; that is accepted, the protocol layer
//! sees at most a few hundred operations per second.
//!
//! `run` exits when `stop` is signalled through the pipe, or when at least
//! one client has been seen and the last one disconnects, which the host
//! unmounting the filesystem looks like from here.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::nfs::{NfsState, Session, handle_compound};
use crate::rpc;
use crate::xdr::XdrReader;
use crate::BlockDevice;

/// Simultaneous client cap; excess connections are closed on accept.
pub const MAX_CLIENTS: usize = 8;

/// Per-connection receive buffer cap. Crossing it means the client's
/// framing is broken and the connection is closed.
pub const RECV_BUF_CAP: usize = 512 * 1024;

const RECORD_LAST: u32 = 0x8000_0000;

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// `stop` was requested.
    Stopped,
    /// Every client that ever connected has disconnected.
    ClientsGone,
}

/// Thread-safe stop signal: a flag plus one byte down the wakeup pipe so a
/// parked poll returns immediately.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    wake: Arc<File>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
        let _ = (&*self.wake).write_all(&[1u8]);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    /// Raw inbound bytes, not yet framed.
    inbuf: Vec<u8>,
    /// Record fragments assembled so far.
    fragments: Vec<u8>,
    session: Session,
}

/// An NFSv4 storage server bound to 127.0.0.1 on an ephemeral port.
pub struct NfsServer {
    listener: TcpListener,
    port: u16,
    state: NfsState,
    stop_flag: Arc<AtomicBool>,
    wake_read: File,
    wake_write: Arc<File>,
}

impl NfsServer {
    /// Binds the loopback socket. The server owns nothing but sockets and a
    /// shared handle to the device callbacks.
    pub fn bind(device: Arc<dyn BlockDevice>) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        let port = listener.local_addr()?.port();
        let (wake_read, wake_write) = nix::unistd::pipe().map_err(io::Error::from)?;
        log::info!("storage server listening on 127.0.0.1:{port}");
        Ok(Self {
            listener,
            port,
            state: NfsState::new(device),
            stop_flag: Arc::new(AtomicBool::new(false)),
            wake_read: File::from(wake_read),
            wake_write: Arc::new(File::from(wake_write)),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.port
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: Arc::clone(&self.stop_flag),
            wake: Arc::clone(&self.wake_write),
        }
    }

    /// Runs the event loop on the calling thread until stopped or until the
    /// last client disconnects.
    pub fn run(self) -> io::Result<RunOutcome> {
        let mut connections: Vec<Connection> = Vec::new();
        let mut seen_client = false;

        loop {
            if self.stop_flag.load(Ordering::Acquire) {
                return Ok(RunOutcome::Stopped);
            }
            if seen_client && connections.is_empty() {
                return Ok(RunOutcome::ClientsGone);
            }

            let (wake_ready, accept_ready, conn_ready) = self.wait_ready(&connections)?;

            if wake_ready {
                let mut sink = [0u8; 16];
                let _ = (&self.wake_read).read(&mut sink);
                continue; // stop flag re-checked at the top
            }

            if accept_ready {
                match self.listener.accept() {
                    Ok((stream, peer)) => {
                        if connections.len() >= MAX_CLIENTS {
                            log::warn!("refusing client {peer}: at {MAX_CLIENTS}-client cap");
                        } else {
                            log::debug!("client connected: {peer}");
                            stream.set_nodelay(true).ok();
                            seen_client = true;
                            connections.push(Connection {
                                stream,
                                peer,
                                inbuf: Vec::new(),
                                fragments: Vec::new(),
                                session: Session::default(),
                            });
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => return Err(err),
                }
            }

            // Service ready connections, highest index first so a
            // swap_remove never moves an unserviced-but-ready socket into a
            // slot this pass has already passed. The sockets are blocking;
            // only ready ones may be read.
            for index in (0..conn_ready.len()).rev() {
                if !conn_ready[index] {
                    continue;
                }
                if !self.service(&mut connections[index]) {
                    let gone = connections.swap_remove(index);
                    log::debug!("client disconnected: {}", gone.peer);
                }
            }
        }
    }

    /// Polls all file descriptors; returns wakeup/accept readiness and a
    /// per-connection readiness vector.
    fn wait_ready(&self, connections: &[Connection]) -> io::Result<(bool, bool, Vec<bool>)> {
        let mut fds = Vec::with_capacity(2 + connections.len());
        fds.push(PollFd::new(self.wake_read.as_fd(), PollFlags::POLLIN));
        fds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
        for connection in connections {
            fds.push(PollFd::new(connection.stream.as_fd(), PollFlags::POLLIN));
        }

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Ok((false, false, vec![false; connections.len()])),
            Err(err) => return Err(io::Error::from(err)),
        }

        let ready = |fd: &PollFd<'_>| {
            fd.revents()
                .map(|ev| ev.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
                .unwrap_or(false)
        };
        let wake = ready(&fds[0]);
        let accept = ready(&fds[1]);
        let conns = fds[2..].iter().map(ready).collect();
        Ok((wake, accept, conns))
    }

    /// Reads available bytes and processes every complete record. Returns
    /// false when the connection should be dropped.
    fn service(&self, connection: &mut Connection) -> bool {
        let mut chunk = [0u8; 64 * 1024];
        let n = match connection.stream.read(&mut chunk) {
            Ok(0) => return false,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return true,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return true,
            Err(err) => {
                log::debug!("read error from {}: {err}", connection.peer);
                return false;
            }
        };
        connection.inbuf.extend_from_slice(&chunk[..n]);
        if connection.inbuf.len() + connection.fragments.len() > RECV_BUF_CAP {
            log::warn!("dropping {}: receive buffer cap exceeded", connection.peer);
            return false;
        }

        // Record-marking: 4-byte header, high bit flags the last fragment.
        loop {
            if connection.inbuf.len() < 4 {
                return true;
            }
            let mark = u32::from_be_bytes(connection.inbuf[..4].try_into().unwrap());
            let len = (mark & !RECORD_LAST) as usize;
            let last = mark & RECORD_LAST != 0;
            if len > RECV_BUF_CAP {
                log::warn!("dropping {}: oversized record ({len} bytes)", connection.peer);
                return false;
            }
            if connection.inbuf.len() < 4 + len {
                return true;
            }

            connection.fragments.extend_from_slice(&connection.inbuf[4..4 + len]);
            connection.inbuf.drain(..4 + len);
            if !last {
                continue;
            }

            let message = std::mem::take(&mut connection.fragments);
            match self.dispatch(connection, &message) {
                Ok(Some(reply)) => {
                    if let Err(err) = write_record(&mut connection.stream, &reply) {
                        log::debug!("write error to {}: {err}", connection.peer);
                        return false;
                    }
                }
                Ok(None) => {}
                Err(()) => return false,
            }
        }
    }

    /// Parses one RPC message and produces the framed reply.
    fn dispatch(&self, connection: &mut Connection, message: &[u8]) -> Result<Option<Vec<u8>>, ()> {
        let mut call = match rpc::parse_call(message) {
            Ok(call) => call,
            Err(_) => {
                log::debug!("malformed RPC from {}", connection.peer);
                return Err(());
            }
        };

        if call.program != rpc::PROGRAM_NFS || call.version != rpc::NFS_VERSION {
            return Ok(Some(rpc::accepted_reply(
                call.xid,
                rpc::ACCEPT_PROG_UNAVAIL,
                &[],
            )));
        }

        let reply = match call.procedure {
            rpc::PROC_NULL => rpc::accepted_reply(call.xid, rpc::ACCEPT_SUCCESS, &[]),
            rpc::PROC_COMPOUND => {
                let body = handle_compound(&self.state, &mut connection.session, &mut call.args);
                rpc::accepted_reply(call.xid, rpc::ACCEPT_SUCCESS, &body)
            }
            _ => rpc::accepted_reply(call.xid, rpc::ACCEPT_PROC_UNAVAIL, &[]),
        };
        Ok(Some(reply))
    }
}

fn write_record(stream: &mut TcpStream, payload: &[u8]) -> io::Result<()> {
    let mark = RECORD_LAST | payload.len() as u32;
    stream.write_all(&mark.to_be_bytes())?;
    stream.write_all(payload)?;
    stream.flush()
}

/// A server running on its dedicated thread.
pub struct ServerRunner {
    stop: StopHandle,
    port: u16,
    thread: Option<std::thread::JoinHandle<io::Result<RunOutcome>>>,
}

impl ServerRunner {
    /// Spawns the event-loop thread.
    pub fn spawn(server: NfsServer) -> Self {
        let stop = server.stop_handle();
        let port = server.local_port();
        let thread = std::thread::Builder::new()
            .name("crypta-serve".into())
            .spawn(move || server.run())
            .expect("spawn server thread");
        Self {
            stop,
            port,
            thread: Some(thread),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Blocks until the loop exits on its own (host unmount).
    pub fn wait(mut self) -> io::Result<RunOutcome> {
        self.thread
            .take()
            .expect("runner already joined")
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("server thread panicked")))
    }

    /// Requests stop and joins, giving in-flight work `drain` to finish.
    /// Returns false on a forced shutdown (thread abandoned past the
    /// deadline; its translator handle drops when it finally dies).
    pub fn shutdown(mut self, drain: Duration) -> bool {
        self.stop.stop();
        let Some(thread) = self.thread.take() else {
            return true;
        };
        let deadline = std::time::Instant::now() + drain;
        while std::time::Instant::now() < deadline {
            if thread.is_finished() {
                let _ = thread.join();
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        log::warn!("storage server did not drain in {drain:?}; forcing dismount");
        false
    }
}

impl Drop for ServerRunner {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.stop.stop();
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemDevice;
    use crate::xdr::{XdrReader, XdrWriter};
    use std::time::Instant;

    fn spawn_server() -> (ServerRunner, u16) {
        let device = MemDevice::new(1 << 20);
        let server = NfsServer::bind(device).unwrap();
        let port = server.local_port();
        (ServerRunner::spawn(server), port)
    }

    fn rpc_null_call(xid: u32) -> Vec<u8> {
        let mut w = XdrWriter::new();
        w.u32(xid)
            .u32(0) // CALL
            .u32(2)
            .u32(rpc::PROGRAM_NFS)
            .u32(rpc::NFS_VERSION)
            .u32(rpc::PROC_NULL)
            .u32(0)
            .opaque(b"")
            .u32(0)
            .opaque(b"");
        w.into_vec()
    }

    fn exchange(stream: &mut TcpStream, message: &[u8]) -> Vec<u8> {
        write_record(stream, message).unwrap();
        let mut head = [0u8; 4];
        stream.read_exact(&mut head).unwrap();
        let mark = u32::from_be_bytes(head);
        let len = (mark & !RECORD_LAST) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).unwrap();
        body
    }

    #[test]
    fn null_call_round_trips() {
        let (runner, port) = spawn_server();
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        let reply = exchange(&mut stream, &rpc_null_call(99));
        let mut r = XdrReader::new(&reply);
        assert_eq!(r.u32().unwrap(), 99);
        assert_eq!(r.u32().unwrap(), 1); // REPLY
        drop(stream);
        assert!(runner.shutdown(Duration::from_secs(2)));
    }

    #[test]
    fn stop_returns_promptly() {
        let (runner, port) = spawn_server();
        // Leave a client connected so the loop is parked in poll.
        let _stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        assert!(runner.shutdown(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn run_exits_when_last_client_leaves() {
        let (runner, port) = spawn_server();
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        drop(stream);

        let outcome = runner.wait().unwrap();
        assert_eq!(outcome, RunOutcome::ClientsGone);
    }

    #[test]
    fn fragmented_records_reassemble() {
        let (runner, port) = spawn_server();
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();

        // Send a NULL call split across two fragments.
        let message = rpc_null_call(7);
        let (a, b) = message.split_at(8);
        let mark_a = (a.len() as u32).to_be_bytes();
        stream.write_all(&mark_a).unwrap();
        stream.write_all(a).unwrap();
        let mark_b = (RECORD_LAST | b.len() as u32).to_be_bytes();
        stream.write_all(&mark_b).unwrap();
        stream.write_all(b).unwrap();

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).unwrap();
        let len = (u32::from_be_bytes(head) & !RECORD_LAST) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).unwrap();
        let mut r = XdrReader::new(&body);
        assert_eq!(r.u32().unwrap(), 7);

        drop(stream);
        assert!(runner.shutdown(Duration::from_secs(2)));
    }

    #[test]
    fn malformed_record_mark_closes_connection() {
        let (runner, port) = spawn_server();
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        // Oversized record length.
        stream.write_all(&(RECV_BUF_CAP as u32 + 10).to_be_bytes()).unwrap();
        stream.write_all(&[0u8; 16]).unwrap();

        let mut probe = [0u8; 1];
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(stream.read(&mut probe).unwrap_or(0), 0, "server must close");
        drop(stream);
        let _ = runner.shutdown(Duration::from_secs(2));
    }
}
