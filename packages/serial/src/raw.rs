//! Byte-level transport seams. The codec and link layer only ever see these
//! traits, so the scheduler tests can run against the in-memory loopback
//! instead of a USB stick.

use crate::consts::BAUD_RATE;
use crate::error::Result;
use std::collections::VecDeque;
use std::io::Read;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// The read half of a raw byte link.
pub trait RawRead: Send {
    /// Read up to `buf.len()` bytes, waiting at most `timeout` for the
    /// first one. Returns `Ok(0)` on timeout.
    fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;
}

/// The write half of a raw byte link.
pub trait RawWrite: Send {
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()>;
}

/// Open the vendor USB-serial bridge at 115200 8-N-1 and split it into
/// read and write halves.
pub fn open_port(path: &str) -> Result<(Box<dyn RawRead>, Box<dyn RawWrite>)> {
    let port = serialport::new(path, BAUD_RATE)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .timeout(Duration::from_millis(100))
        .open()?;
    let writer = port.try_clone()?;
    Ok((Box::new(PortRead { port }), Box::new(PortWrite { port: writer })))
}

struct PortRead {
    port: Box<dyn serialport::SerialPort>,
}

impl RawRead for PortRead {
    fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.port.set_timeout(timeout)?;
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

struct PortWrite {
    port: Box<dyn serialport::SerialPort>,
}

impl RawWrite for PortWrite {
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        use std::io::Write;
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }
}

/// One direction of the in-memory loopback.
#[derive(Default)]
struct Pipe {
    buf: Mutex<VecDeque<u8>>,
    avail: Condvar,
}

impl Pipe {
    fn push(&self, bytes: &[u8]) {
        let mut buf = self.buf.lock().expect("pipe lock poisoned");
        buf.extend(bytes);
        self.avail.notify_all();
    }

    fn pull(&self, out: &mut [u8], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut buf = self.buf.lock().expect("pipe lock poisoned");
        loop {
            if !buf.is_empty() {
                let n = out.len().min(buf.len());
                for slot in out.iter_mut().take(n) {
                    *slot = buf.pop_front().expect("len checked");
                }
                return n;
            }
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            let (guard, _) = self
                .avail
                .wait_timeout(buf, deadline - now)
                .expect("pipe lock poisoned");
            buf = guard;
        }
    }
}

/// An in-memory duplex byte link. `MemoryLink::pair()` returns the two
/// ends; whatever one end writes, the other reads.
#[derive(Clone)]
pub struct MemoryLink {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
}

impl MemoryLink {
    pub fn pair() -> (MemoryLink, MemoryLink) {
        let a = Arc::new(Pipe::default());
        let b = Arc::new(Pipe::default());
        (
            MemoryLink {
                rx: a.clone(),
                tx: b.clone(),
            },
            MemoryLink { rx: b, tx: a },
        )
    }

    /// Split one end into owned read/write halves.
    pub fn split(self) -> (Box<dyn RawRead>, Box<dyn RawWrite>) {
        (Box::new(self.clone()), Box::new(self))
    }
}

impl RawRead for MemoryLink {
    fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        Ok(self.rx.pull(buf, timeout))
    }
}

impl RawWrite for MemoryLink {
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.tx.push(buf);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_loopback() {
        let (mut a, mut b) = MemoryLink::pair();
        a.write_all_bytes(&[1, 2, 3]).unwrap();

        let mut buf = [0u8; 8];
        let n = b.read_bytes(&mut buf, Duration::from_millis(100)).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);

        // And nothing more
        let n = b.read_bytes(&mut buf, Duration::from_millis(10)).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_both_directions() {
        let (mut a, mut b) = MemoryLink::pair();
        b.write_all_bytes(&[9]).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(a.read_bytes(&mut buf, Duration::from_millis(100)).unwrap(), 1);
        assert_eq!(buf[0], 9);
    }
}
