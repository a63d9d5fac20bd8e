//! Two-process wheel demo.
//!
//! The parent process creates a shared region and a notified wheel, spawns
//! this same executable as the consumer, hands it the memfd and the two
//! eventfds over `SCM_RIGHTS`, and then produces a stream of random-sized
//! messages. The child verifies every payload and reports the byte total
//! back over the socket; the parent checks it and prints throughput.
//!
//! Run with: `carousel-demo [--mode spin|evented] [--count N]`

use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::process::Command;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use carousel::{NotifiedWheel, Wheel};
use carousel_shm::{scm, SharedRegion};

const MAGIC: &[u8] = b"\xc0\xa7\x05\xe1";

#[derive(Parser)]
#[command(name = "carousel-demo")]
#[command(about = "Producer/consumer soak over a shared-memory wheel")]
struct Cli {
    /// Wheel region size in bytes (multiple of 64).
    #[arg(long, default_value_t = 128 * 1024)]
    bytes: usize,

    /// Number of messages to push through the wheel.
    #[arg(long, default_value_t = 1_000_000)]
    count: u64,

    /// Largest payload size; sizes are uniform in [1, max-payload].
    #[arg(long, default_value_t = 16)]
    max_payload: u64,

    /// How each side waits when the wheel is full or empty.
    #[arg(long, value_enum, default_value = "evented")]
    mode: Mode,

    #[command(subcommand)]
    role: Option<Role>,
}

#[derive(Subcommand)]
enum Role {
    /// Internal: consumer child, attached to an inherited socket.
    #[command(hide = true)]
    Consume {
        /// Inherited socket descriptor carrying the handshake.
        #[arg(long)]
        peer_fd: RawFd,
        #[arg(long, value_enum)]
        mode: Mode,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Busy-retry with a scheduler yield.
    Spin,
    /// Sleep on the notification descriptors via a poll loop.
    Evented,
}

impl Mode {
    fn flag(self) -> &'static str {
        match self {
            Mode::Spin => "spin",
            Mode::Evented => "evented",
        }
    }
}

/// xorshiftr128+, fixed seed so parent and any rerun agree.
struct Rng {
    s: [u64; 2],
}

impl Rng {
    fn new() -> Self {
        Self { s: [420, 69] }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.s[0];
        let y = self.s[1];
        self.s[0] = y;
        x ^= x << 23;
        x ^= x >> 17;
        x ^= y;
        self.s[1] = x.wrapping_add(y);
        x
    }
}

fn fill_payload(buf: &mut [u8]) {
    let prefix = MAGIC.len().min(buf.len());
    let len = buf.len();
    buf[..prefix].copy_from_slice(&MAGIC[..prefix]);
    for byte in &mut buf[prefix..] {
        *byte = len as u8;
    }
}

fn verify_payload(buf: &[u8]) -> Result<(), String> {
    let prefix = MAGIC.len().min(buf.len());
    if buf[..prefix] != MAGIC[..prefix] {
        return Err(format!("bad magic prefix in {}-byte payload", buf.len()));
    }
    if buf[prefix..].iter().any(|&b| b != buf.len() as u8) {
        return Err(format!("bad filler in {}-byte payload", buf.len()));
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match &cli.role {
        Some(Role::Consume { peer_fd, mode }) => consume(*peer_fd, *mode),
        None => produce(&cli),
    }
}

// =============================================================================
// Producer (parent)
// =============================================================================

fn produce(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let (ours, theirs) = UnixStream::pair()?;

    // The child's end must survive exec: drop close-on-exec on it, then tell
    // the child its number on the command line.
    clear_cloexec(theirs.as_raw_fd())?;
    let mut child = Command::new(std::env::current_exe()?)
        .arg("consume")
        .arg(format!("--peer-fd={}", theirs.as_raw_fd()))
        .arg(format!("--mode={}", cli.mode.flag()))
        .spawn()?;
    drop(theirs);

    let region = SharedRegion::create("carousel-demo", cli.bytes)?;
    // SAFETY: fresh exclusive mapping; the child attaches only after the
    // handshake below.
    let wheel = unsafe { Wheel::init_notified(region.as_mut_ptr(), region.len())? };
    let wheel = NotifiedWheel::create(wheel)?;

    // Handshake: region size and message count, plus the three descriptors.
    let mut handshake = [0u8; 16];
    handshake[..8].copy_from_slice(&(region.len() as u64).to_le_bytes());
    handshake[8..].copy_from_slice(&cli.count.to_le_bytes());
    scm::send_fds_with_data(
        ours.as_fd(),
        &[region.memfd(), wheel.readable_fd(), wheel.writable_fd()],
        &handshake,
    )?;

    info!(
        bytes = region.len(),
        count = cli.count,
        mode = cli.mode.flag(),
        "producing"
    );

    let mut rng = Rng::new();
    let mut total = 0u64;
    let started = Instant::now();
    let mut waiter = Waiter::new(cli.mode, wheel.writable_fd().as_raw_fd(), libc::POLLOUT)?;

    for _ in 0..cli.count {
        let size = 1 + (rng.next() % cli.max_payload) as usize;
        let mut slice = loop {
            match wheel.alloc(size) {
                Some(slice) => break slice,
                None => waiter.wait()?,
            }
        };
        fill_payload(slice.payload_mut());
        wheel.commit(slice.offset());
        total += size as u64;
    }

    // The child echoes its byte total when it has consumed everything.
    let mut reply = [0u8; 8];
    (&ours).read_exact(&mut reply)?;
    let consumed = u64::from_le_bytes(reply);
    let elapsed = started.elapsed();

    let status = child.wait()?;
    if !status.success() {
        return Err(format!("consumer exited with {status}").into());
    }
    if consumed != total {
        return Err(format!("consumed {consumed} bytes, produced {total}").into());
    }
    if let Some(err) = wheel.take_signal_error() {
        return Err(format!("notification descriptor error: {err}").into());
    }

    info!(
        messages = cli.count,
        bytes = total,
        secs = elapsed.as_secs_f64(),
        msgs_per_sec = (cli.count as f64 / elapsed.as_secs_f64()).round(),
        "done"
    );
    Ok(())
}

// =============================================================================
// Consumer (child)
// =============================================================================

fn consume(peer_fd: RawFd, mode: Mode) -> Result<(), Box<dyn std::error::Error>> {
    // SAFETY: the parent spawned us with this inherited descriptor and
    // nothing else in this process owns it.
    let sock = unsafe { UnixStream::from_raw_fd(peer_fd) };

    let mut handshake = [0u8; 16];
    let (mut fds, n) = scm::recv_fds_with_data(sock.as_fd(), &mut handshake)?;
    if n != handshake.len() || fds.len() != 3 {
        return Err(format!("bad handshake: {n} bytes, {} fds", fds.len()).into());
    }
    let len = u64::from_le_bytes(handshake[..8].try_into()?) as usize;
    let count = u64::from_le_bytes(handshake[8..].try_into()?);

    let writable = fds.pop().expect("three fds");
    let readable = fds.pop().expect("three fds");
    let region = SharedRegion::from_fd(fds.pop().expect("three fds"), len)?;
    // SAFETY: the parent initialized the wheel before sending the handshake.
    let wheel = unsafe { Wheel::attach(region.as_mut_ptr()) };
    let wheel = NotifiedWheel::from_fds(wheel, readable, writable);

    info!(bytes = len, count, "consuming");

    let mut total = 0u64;
    let mut waiter = Waiter::new(mode, wheel.readable_fd().as_raw_fd(), libc::POLLIN)?;

    for _ in 0..count {
        let slice = loop {
            match wheel.peek() {
                Some(slice) => break slice,
                None => waiter.wait()?,
            }
        };
        verify_payload(slice.payload())?;
        total += slice.payload().len() as u64;
        wheel.release(slice.offset());
    }

    (&sock).write_all(&total.to_le_bytes())?;
    if let Some(err) = wheel.take_signal_error() {
        return Err(format!("notification descriptor error: {err}").into());
    }
    Ok(())
}

// =============================================================================
// Waiting disciplines
// =============================================================================

/// One side's "wheel not ready" strategy: yield, or sleep in a mio poll on
/// the matching notification descriptor.
enum Waiter {
    Spin,
    Evented {
        poll: mio::Poll,
        events: mio::Events,
    },
}

const WHEEL_TOKEN: mio::Token = mio::Token(0);

impl Waiter {
    fn new(mode: Mode, fd: RawFd, interest: libc::c_short) -> std::io::Result<Self> {
        match mode {
            Mode::Spin => Ok(Self::Spin),
            Mode::Evented => {
                let poll = mio::Poll::new()?;
                let interest = if interest == libc::POLLOUT {
                    mio::Interest::WRITABLE
                } else {
                    mio::Interest::READABLE
                };
                poll.registry()
                    .register(&mut mio::unix::SourceFd(&fd), WHEEL_TOKEN, interest)?;
                Ok(Self::Evented {
                    poll,
                    events: mio::Events::with_capacity(4),
                })
            }
        }
    }

    fn wait(&mut self) -> std::io::Result<()> {
        match self {
            Self::Spin => {
                std::thread::yield_now();
                Ok(())
            }
            Self::Evented { poll, events } => loop {
                match poll.poll(events, None) {
                    Ok(()) if !events.is_empty() => return Ok(()),
                    Ok(()) => continue,
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            },
        }
    }
}

fn clear_cloexec(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: fcntl on a descriptor we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
