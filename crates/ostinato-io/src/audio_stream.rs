//! Framed bidirectional transport over a pair of named pipes.
//!
//! The server creates `<address>.send` (it reads) and `<address>.recv`
//! (it writes) with mode 0600; the client opens the existing nodes with
//! the directions swapped. Write ends are opened read-write so a peer
//! hanging up does not immediately EOF the pipe.
//!
//! Frame format, little-endian:
//!
//! ```text
//! u32 magic ∈ { BLOCK_START = 0x424C4B21, CLOSE = 0x434C4F53 }
//! if BLOCK_START:
//!     u32 num_bytes (< 2^30)
//!     bytes[num_bytes] payload
//! ```
//!
//! All pipe I/O is poll-driven with 500 ms timeouts so that a
//! cooperative [`StreamCloser::close`] breaks a pending operation within
//! one timeout. There is no partial-frame recovery: a desynchronised
//! stream is closed.

use crate::block_data::BlockData;
use ostinato_core::{Error, Result};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const BLOCK_START_MAGIC: u32 = 0x424C_4B21;
pub const CLOSE_MAGIC: u32 = 0x434C_4F53;

/// Largest accepted payload, in bytes.
pub const MAX_PAYLOAD: usize = (1 << 30) - 1;

const POLL_TIMEOUT_MS: i32 = 500;
// One default pipe capacity per read keeps large frames cheap.
const READ_CHUNK: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Server,
    Client,
}

/// Cooperative cancellation handle; cloneable and thread-safe.
#[derive(Debug, Clone)]
pub struct StreamCloser {
    closed: Arc<AtomicBool>,
}

impl StreamCloser {
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn path_with_suffix(address: &Path, suffix: &str) -> PathBuf {
    let mut s = address.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

fn cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::invalid_argument(format!("bad address {}", path.display())))
}

fn mkfifo(path: &Path) -> Result<()> {
    let cpath = cstring(path)?;
    // SAFETY: plain syscall on an owned C string.
    let rc = unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn open_fifo(path: &Path, flags: libc::c_int) -> Result<libc::c_int> {
    let cpath = cstring(path)?;
    // SAFETY: plain syscall on an owned C string.
    let fd = unsafe { libc::open(cpath.as_ptr(), flags | libc::O_NONBLOCK) };
    if fd < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    set_blocking(fd, true)?;
    Ok(fd)
}

fn set_blocking(fd: libc::c_int, blocking: bool) -> Result<()> {
    let mut arg: libc::c_int = i32::from(!blocking);
    // SAFETY: FIONBIO takes a pointer to an int flag.
    let rc = unsafe { libc::ioctl(fd, libc::FIONBIO, &mut arg) };
    if rc < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// One endpoint of the framed pipe pair.
pub struct AudioStream {
    address: PathBuf,
    role: Role,
    pipe_in: libc::c_int,
    pipe_out: libc::c_int,
    closed: Arc<AtomicBool>,
    buffer: Vec<u8>,
}

impl AudioStream {
    /// Create the FIFO pair and open the server side.
    pub fn serve(address: impl Into<PathBuf>) -> Result<Self> {
        let address = address.into();
        let path_in = path_with_suffix(&address, ".send");
        let path_out = path_with_suffix(&address, ".recv");

        mkfifo(&path_in)?;
        let pipe_in = open_fifo(&path_in, libc::O_RDONLY)?;

        mkfifo(&path_out)?;
        // Read-write so the pipe never sees EOF while no client reads.
        let pipe_out = open_fifo(&path_out, libc::O_RDWR)?;

        tracing::info!(address = %address.display(), "serving audio stream");
        Ok(Self {
            address,
            role: Role::Server,
            pipe_in,
            pipe_out,
            closed: Arc::new(AtomicBool::new(false)),
            buffer: Vec::new(),
        })
    }

    /// Open the pre-existing FIFO pair as the client side.
    pub fn connect(address: impl Into<PathBuf>) -> Result<Self> {
        let address = address.into();
        let path_in = path_with_suffix(&address, ".recv");
        let path_out = path_with_suffix(&address, ".send");

        let pipe_in = open_fifo(&path_in, libc::O_RDONLY)?;
        let pipe_out = open_fifo(&path_out, libc::O_RDWR)?;

        tracing::info!(address = %address.display(), "connected audio stream");
        Ok(Self {
            address,
            role: Role::Client,
            pipe_in,
            pipe_out,
            closed: Arc::new(AtomicBool::new(false)),
            buffer: Vec::new(),
        })
    }

    /// Handle for closing the stream from another thread.
    pub fn closer(&self) -> StreamCloser {
        StreamCloser {
            closed: self.closed.clone(),
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn fill_buffer(&mut self) -> Result<()> {
        loop {
            let mut fds = libc::pollfd {
                fd: self.pipe_in,
                events: libc::POLLIN,
                revents: 0,
            };
            // SAFETY: valid pollfd array of length 1.
            let rc = unsafe { libc::poll(&mut fds, 1, POLL_TIMEOUT_MS) };
            if rc < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }

            if fds.revents & libc::POLLIN != 0 {
                let mut chunk = [0u8; READ_CHUNK];
                // SAFETY: reading into a stack buffer of the given length.
                let n = unsafe {
                    libc::read(self.pipe_in, chunk.as_mut_ptr() as *mut libc::c_void, READ_CHUNK)
                };
                if n < 0 {
                    return Err(Error::Io(std::io::Error::last_os_error()));
                }
                if n == 0 {
                    return Err(Error::ConnectionClosed);
                }
                self.buffer.extend_from_slice(&chunk[..n as usize]);
                return Ok(());
            }
            if fds.revents & libc::POLLHUP != 0 {
                tracing::warn!("pipe disconnected");
                return Err(Error::ConnectionClosed);
            }

            if self.is_closed() {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    fn take_bytes(&mut self, num_bytes: usize) -> Result<Vec<u8>> {
        while self.buffer.len() < num_bytes {
            self.fill_buffer()?;
        }
        let rest = self.buffer.split_off(num_bytes);
        Ok(std::mem::replace(&mut self.buffer, rest))
    }

    fn take_u32(&mut self) -> Result<u32> {
        let bytes = self.take_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Receive one frame's payload.
    pub fn receive_bytes(&mut self) -> Result<Vec<u8>> {
        match self.take_u32()? {
            CLOSE_MAGIC => Err(Error::ConnectionClosed),
            BLOCK_START_MAGIC => {
                let num_bytes = self.take_u32()? as usize;
                if num_bytes > MAX_PAYLOAD {
                    return Err(Error::BadFrame(format!("oversize frame ({num_bytes} bytes)")));
                }
                self.take_bytes(num_bytes)
            }
            magic => Err(Error::BadFrame(format!("unrecognised magic {magic:#010x}"))),
        }
    }

    fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let mut fds = libc::pollfd {
                fd: self.pipe_out,
                events: libc::POLLOUT,
                revents: 0,
            };
            // SAFETY: valid pollfd array of length 1.
            let rc = unsafe { libc::poll(&mut fds, 1, POLL_TIMEOUT_MS) };
            if rc < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }

            if fds.revents & (libc::POLLERR | libc::POLLHUP) != 0 {
                return Err(Error::ConnectionClosed);
            }
            if fds.revents & libc::POLLOUT != 0 {
                // SAFETY: writing from a live slice.
                let n = unsafe {
                    libc::write(self.pipe_out, data.as_ptr() as *const libc::c_void, data.len())
                };
                if n < 0 {
                    return Err(Error::Io(std::io::Error::last_os_error()));
                }
                data = &data[n as usize..];
                continue;
            }

            if self.is_closed() {
                return Err(Error::ConnectionClosed);
            }
        }
        Ok(())
    }

    /// Send one framed payload.
    pub fn send_bytes(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::BadFrame(format!(
                "payload too large ({} bytes)",
                payload.len()
            )));
        }
        let mut header = [0u8; 8];
        header[0..4].copy_from_slice(&BLOCK_START_MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        self.write_all(&header)?;
        self.write_all(payload)
    }

    pub fn send_block(&mut self, block: &BlockData) -> Result<()> {
        self.send_bytes(&block.encode()?)
    }

    pub fn receive_block(&mut self) -> Result<BlockData> {
        BlockData::decode(&self.receive_bytes()?)
    }

    pub fn cleanup(&mut self) {
        self.buffer.clear();

        if self.role == Role::Client && self.pipe_out >= 0 {
            // Tell the peer we are going away; best effort.
            if self.write_all(&CLOSE_MAGIC.to_le_bytes()).is_err() {
                tracing::warn!("failed to send close frame");
            }
        }

        for fd in [self.pipe_in, self.pipe_out] {
            if fd >= 0 {
                // SAFETY: fd is owned by this stream and closed once.
                unsafe { libc::close(fd) };
            }
        }
        self.pipe_in = -1;
        self.pipe_out = -1;

        if self.role == Role::Server {
            for suffix in [".send", ".recv"] {
                let path = path_with_suffix(&self.address, suffix);
                if let Ok(cpath) = cstring(&path) {
                    // SAFETY: plain syscall; missing nodes are ignored.
                    unsafe { libc::unlink(cpath.as_ptr()) };
                }
            }
        }
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.cleanup();
    }
}
