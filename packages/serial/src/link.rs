//! The link layer: one shared control-flow mailbox between the reader and
//! writer threads, the incremental frame decoder for the reader, and the
//! blocking ACK-gated send path for the writer.
//!
//! All wire writes happen on the writer thread. Inbound frames still get
//! their ACK within the 10 ms budget because the reader only *requests*
//! the ACK here; the writer services those requests inside every one of
//! its wait loops, including the middle of its own send.

use crate::consts::*;
use crate::error::{Error, Result};
use crate::frame::{SerialControlByte, SerialData, SerialFrame};
use crate::raw::{RawRead, RawWrite};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Extra ACK window for beaming sends to frequent listeners: the stick may
/// spend up to a full second waking the target before it can even transmit.
pub const BEAM_ACK_EXTRA: Duration = Duration::from_millis(1100);

/// A single wake-up channel for the writer thread. State lives elsewhere,
/// under locks that are only ever held briefly; every wait publishes what
/// it is waiting for first and then blocks here.
#[derive(Default)]
pub struct Wakeup {
    gen: Mutex<u64>,
    cv: Condvar,
}

impl Wakeup {
    pub fn notify(&self) {
        let mut gen = self.gen.lock().expect("wakeup lock poisoned");
        *gen += 1;
        self.cv.notify_all();
    }

    /// The current notification generation. Capture it before inspecting
    /// the state you are about to wait on; a notify between the
    /// inspection and the wait is then never lost.
    pub fn generation(&self) -> u64 {
        *self.gen.lock().expect("wakeup lock poisoned")
    }

    /// Block until the generation moves past `seen` or the deadline
    /// passes. Returns false on timeout.
    pub fn wait_past(&self, seen: u64, deadline: Instant) -> bool {
        let mut gen = self.gen.lock().expect("wakeup lock poisoned");
        loop {
            if *gen != seen {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(gen, deadline - now)
                .expect("wakeup lock poisoned");
            gen = guard;
        }
    }

    /// Block until notified or the deadline passes. Returns false on timeout.
    pub fn wait_deadline(&self, deadline: Instant) -> bool {
        self.wait_past(self.generation(), deadline)
    }
}

#[derive(Default)]
struct LinkInner {
    /// ACK/NAK/CAN received from the stick, for the in-flight send.
    control: VecDeque<SerialControlByte>,
    /// Control bytes the reader wants sent (ACK/NAK for inbound frames).
    tx_requests: VecDeque<u8>,
    /// NAKs emitted since the last good inbound frame.
    consecutive_naks: u32,
    stopping: bool,
}

/// Control-flow state shared by the reader and writer threads.
pub struct LinkShared {
    inner: Mutex<LinkInner>,
    wakeup: Arc<Wakeup>,
}

impl LinkShared {
    pub fn new(wakeup: Arc<Wakeup>) -> Self {
        Self {
            inner: Mutex::new(LinkInner::default()),
            wakeup,
        }
    }

    /// Reader side: a control byte arrived from the stick.
    pub fn offer_control(&self, byte: SerialControlByte) {
        let mut inner = self.inner.lock().expect("link lock poisoned");
        inner.control.push_back(byte);
        drop(inner);
        self.wakeup.notify();
    }

    /// Reader side: a good data frame arrived, answer it with an ACK.
    pub fn request_ack(&self) {
        let mut inner = self.inner.lock().expect("link lock poisoned");
        inner.tx_requests.push_back(SerialControlByte::ACK as u8);
        inner.consecutive_naks = 0;
        drop(inner);
        self.wakeup.notify();
    }

    /// Reader side: a bad frame arrived, answer with a NAK. Returns how many
    /// NAKs have gone out in a row so the caller can declare link failure.
    pub fn request_nak(&self) -> u32 {
        let mut inner = self.inner.lock().expect("link lock poisoned");
        inner.tx_requests.push_back(SerialControlByte::NAK as u8);
        inner.consecutive_naks += 1;
        let count = inner.consecutive_naks;
        drop(inner);
        self.wakeup.notify();
        count
    }

    pub fn shutdown(&self) {
        self.inner.lock().expect("link lock poisoned").stopping = true;
        self.wakeup.notify();
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.lock().expect("link lock poisoned").stopping
    }

    fn pop_control(&self) -> Option<SerialControlByte> {
        self.inner
            .lock()
            .expect("link lock poisoned")
            .control
            .pop_front()
    }

    fn clear_control(&self) {
        self.inner
            .lock()
            .expect("link lock poisoned")
            .control
            .clear();
    }

    fn take_tx_requests(&self) -> Vec<u8> {
        let mut inner = self.inner.lock().expect("link lock poisoned");
        inner.tx_requests.drain(..).collect()
    }
}

/// The writer half: owns the raw write end, sends data frames and blocks
/// for the link-layer ACK.
pub struct FrameWriter {
    dst: Box<dyn RawWrite>,
    shared: Arc<LinkShared>,
    wakeup: Arc<Wakeup>,
}

impl FrameWriter {
    pub fn new(dst: Box<dyn RawWrite>, shared: Arc<LinkShared>, wakeup: Arc<Wakeup>) -> Self {
        Self {
            dst,
            shared,
            wakeup,
        }
    }

    /// Write any ACK/NAK the reader asked for. Must be called from every
    /// writer-thread wait loop.
    pub fn service_requests(&mut self) -> Result<()> {
        for byte in self.shared.take_tx_requests() {
            self.dst.write_all_bytes(&[byte])?;
        }
        Ok(())
    }

    /// Send a finalized message buffer as a data frame and wait for the
    /// stick's ACK. Retries on NAK and timeout; a CAN gets a randomized
    /// backoff first since the stick was mid-transmission toward us.
    pub fn send_data(&mut self, msg: &[u8], beaming: bool) -> Result<()> {
        let frame = SerialData::for_message(msg);
        let window = if beaming {
            ACK_TIMEOUT + BEAM_ACK_EXTRA
        } else {
            ACK_TIMEOUT
        };

        for _attempt in 1..=MAX_SEND_ATTEMPTS {
            self.shared.clear_control();
            self.dst.write_all_bytes(frame.as_ref())?;

            let deadline = Instant::now() + window;
            loop {
                self.service_requests()?;
                if self.shared.is_stopping() {
                    return Err(Error::Stopping);
                }
                match self.shared.pop_control() {
                    Some(SerialControlByte::ACK) => return Ok(()),
                    Some(SerialControlByte::NAK) => break,
                    Some(SerialControlByte::CAN) => {
                        self.backoff_after_can()?;
                        break;
                    }
                    Some(SerialControlByte::SOF) | None => {}
                }
                if !self.wakeup.wait_deadline(deadline) {
                    break;
                }
            }
        }
        Err(Error::AckTimeout(MAX_SEND_ATTEMPTS))
    }

    /// Sleep 100-1500 ms, still answering inbound frames.
    fn backoff_after_can(&mut self) -> Result<()> {
        let mut r = [0u8; 2];
        getrandom::getrandom(&mut r).expect("system randomness unavailable");
        let span = (CAN_BACKOFF_MAX - CAN_BACKOFF_MIN).as_millis() as u64;
        let wait = CAN_BACKOFF_MIN + Duration::from_millis(u16::from_be_bytes(r) as u64 % span);

        let deadline = Instant::now() + wait;
        loop {
            self.service_requests()?;
            if self.shared.is_stopping() {
                return Err(Error::Stopping);
            }
            if !self.wakeup.wait_deadline(deadline) {
                return Ok(());
            }
        }
    }
}

/// The reader half: feeds raw bytes through the nom parser and yields one
/// frame at a time.
pub struct FrameReader {
    src: Box<dyn RawRead>,
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new(src: Box<dyn RawRead>) -> Self {
        Self {
            src,
            buf: Vec::with_capacity(256),
        }
    }

    /// Try to produce the next frame, reading for at most `timeout` when
    /// the buffer does not already hold a complete one.
    pub fn poll_frame(&mut self, timeout: Duration) -> Result<Option<SerialFrame>> {
        loop {
            if let Some(frame) = self.try_parse() {
                return Ok(Some(frame));
            }

            let mut chunk = [0u8; 64];
            let n = self.src.read_bytes(&mut chunk, timeout)?;
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn try_parse(&mut self) -> Option<SerialFrame> {
        if self.buf.is_empty() {
            return None;
        }
        match SerialFrame::parse(&self.buf) {
            Ok((rest, frame)) => {
                let consumed = self.buf.len() - rest.len();
                self.buf.drain(..consumed);
                Some(frame)
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::raw::MemoryLink;
    use std::thread;

    fn writer_pair() -> (FrameWriter, MemoryLink, Arc<LinkShared>) {
        let (ours, theirs) = MemoryLink::pair();
        let wakeup = Arc::new(Wakeup::default());
        let shared = Arc::new(LinkShared::new(wakeup.clone()));
        let (_, tx) = ours.split();
        (FrameWriter::new(tx, shared.clone(), wakeup), theirs, shared)
    }

    #[test]
    fn test_send_acked() {
        let (mut writer, mut stick, shared) = writer_pair();

        // The "stick" acks as soon as the frame lands
        let ack_shared = shared.clone();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 64];
            let n = stick
                .read_bytes(&mut buf, Duration::from_secs(1))
                .unwrap();
            ack_shared.offer_control(SerialControlByte::ACK);
            buf[..n].to_vec()
        });

        let msg = [0x03u8, 0x00, 0x08];
        writer.send_data(&msg, false).unwrap();

        let seen = handle.join().unwrap();
        assert_eq!(seen, hex::decode("01030008f4").unwrap());
    }

    #[test]
    fn test_send_retries_on_nak_then_acks() {
        let (mut writer, mut stick, shared) = writer_pair();

        let responder = shared.clone();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 64];
            let mut frames = 0;
            while frames < 2 {
                let n = stick
                    .read_bytes(&mut buf, Duration::from_secs(2))
                    .unwrap();
                if n == 0 {
                    continue;
                }
                frames += 1;
                if frames == 1 {
                    responder.offer_control(SerialControlByte::NAK);
                } else {
                    responder.offer_control(SerialControlByte::ACK);
                }
            }
            frames
        });

        writer.send_data(&[0x03, 0x00, 0x08], false).unwrap();
        assert_eq!(handle.join().unwrap(), 2);
    }

    #[test]
    fn test_send_services_inbound_acks_while_waiting() {
        let (mut writer, mut stick, shared) = writer_pair();

        // No control byte ever arrives for our frame, but an inbound frame
        // needs its ACK; it must be written before the send gives up.
        shared.request_ack();
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            let mut buf = [0u8; 64];
            let deadline = Instant::now() + Duration::from_millis(400);
            while Instant::now() < deadline {
                let n = stick
                    .read_bytes(&mut buf, Duration::from_millis(50))
                    .unwrap();
                seen.extend_from_slice(&buf[..n]);
            }
            seen
        });

        // Shut down quickly so the test does not ride out all the retries
        let stopper = shared.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            stopper.shutdown();
        });

        let _ = writer.send_data(&[0x03, 0x00, 0x08], false);
        let seen = handle.join().unwrap();
        assert!(seen.contains(&(SerialControlByte::ACK as u8)));
    }

    #[test]
    fn test_nak_counter() {
        let wakeup = Arc::new(Wakeup::default());
        let shared = LinkShared::new(wakeup);
        assert_eq!(shared.request_nak(), 1);
        assert_eq!(shared.request_nak(), 2);
        shared.request_ack();
        assert_eq!(shared.request_nak(), 1);
    }

    #[test]
    fn test_reader_assembles_split_frames() {
        let (ours, mut theirs) = MemoryLink::pair();
        let (rx, _tx) = ours.split();
        let mut reader = FrameReader::new(rx);

        theirs.write_all_bytes(&hex::decode("0103").unwrap()).unwrap();
        assert_eq!(
            reader.poll_frame(Duration::from_millis(20)).unwrap(),
            None
        );

        theirs.write_all_bytes(&hex::decode("0008f406").unwrap()).unwrap();
        let frame = reader.poll_frame(Duration::from_millis(100)).unwrap();
        assert!(matches!(frame, Some(SerialFrame::Data(_))));
        let frame = reader.poll_frame(Duration::from_millis(100)).unwrap();
        assert_eq!(frame, Some(SerialFrame::ACK));
    }
}
