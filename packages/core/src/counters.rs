use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

static NEXT_CALLBACK_ID: AtomicU8 = AtomicU8::new(1);
static NEXT_ACK_ID: AtomicU32 = AtomicU32::new(1);

/// Reserve the next callback id for an outgoing SEND_DATA. Ids cycle through
/// 1..=254; 0 means "no callback" and 0xFF is the non-blocking marker, so
/// neither is ever handed out. Concurrent callers each get a distinct id.
pub fn next_callback_id() -> u8 {
    loop {
        let current = NEXT_CALLBACK_ID.load(Ordering::Relaxed);
        let next = match current {
            0xfe.. => 1,
            _ => current + 1,
        };
        if NEXT_CALLBACK_ID
            .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return current.clamp(1, 0xfe);
        }
    }
}

/// Reserve the next ack id. Every outbound message gets one at construction,
/// so replies can be correlated even when Z-Wave callback ids get reused.
pub fn next_ack_id() -> u32 {
    NEXT_ACK_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn callback_ids_skip_zero_and_ff() {
        // The counter is process-global, so run enough iterations to cycle
        // it fully no matter where other tests left it.
        let mut seen_wrap = false;
        let mut last = next_callback_id();
        for _ in 0..600 {
            let id = next_callback_id();
            assert_ne!(id, 0);
            assert_ne!(id, 0xff);
            if last == 0xfe {
                assert_eq!(id, 1, "must wrap from 254 directly to 1");
                seen_wrap = true;
            }
            last = id;
        }
        assert!(seen_wrap);
    }

    #[test]
    fn ack_ids_increase() {
        let a = next_ack_id();
        let b = next_ack_id();
        assert!(b > a);
    }
}
