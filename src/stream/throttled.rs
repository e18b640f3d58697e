//! Rate/latency-limited wrapper over an inner stream, per §4.3/§4.5.

use crate::error::{EvdError, Result};
use crate::stream::{Readable, Writable};
use crate::throttle::ThrottleSet;

type DelayCb = Box<dyn FnMut(u64) + Send>;

pub struct ThrottledInputStream<R> {
    base: R,
    throttles: ThrottleSet,
    delay_read_cb: Option<DelayCb>,
}

impl<R: Readable> ThrottledInputStream<R> {
    pub fn new(base: R, throttles: ThrottleSet) -> Self {
        Self {
            base,
            throttles,
            delay_read_cb: None,
        }
    }

    pub fn on_delay_read<F: FnMut(u64) + Send + 'static>(&mut self, f: F) {
        self.delay_read_cb = Some(Box::new(f));
    }

    pub fn throttles_mut(&mut self) -> &mut ThrottleSet {
        &mut self.throttles
    }
}

impl<R: Readable> Readable for ThrottledInputStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.throttles.is_empty() {
            return self.base.read(buf);
        }
        let (allowed, hint) = self.throttles.request(buf.len());
        if allowed == 0 {
            if let Some(cb) = &mut self.delay_read_cb {
                cb(hint);
            }
            return Err(EvdError::would_block());
        }
        let n = self.base.read(&mut buf[..allowed])?;
        self.throttles.report(n);
        Ok(n)
    }
}

pub struct ThrottledOutputStream<W> {
    base: W,
    throttles: ThrottleSet,
    delay_write_cb: Option<DelayCb>,
}

impl<W: Writable> ThrottledOutputStream<W> {
    pub fn new(base: W, throttles: ThrottleSet) -> Self {
        Self {
            base,
            throttles,
            delay_write_cb: None,
        }
    }

    pub fn on_delay_write<F: FnMut(u64) + Send + 'static>(&mut self, f: F) {
        self.delay_write_cb = Some(Box::new(f));
    }

    pub fn throttles_mut(&mut self) -> &mut ThrottleSet {
        &mut self.throttles
    }
}

impl<W: Writable> Writable for ThrottledOutputStream<W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.throttles.is_empty() {
            return self.base.write(buf);
        }
        let (allowed, hint) = self.throttles.request(buf.len());
        if allowed == 0 {
            if let Some(cb) = &mut self.delay_write_cb {
                cb(hint);
            }
            return Err(EvdError::would_block());
        }
        let n = self.base.write(&buf[..allowed])?;
        self.throttles.report(n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::Throttle;
    use std::sync::{Arc, Mutex};

    struct CountingWriter(Vec<u8>);
    impl Writable for CountingWriter {
        fn write(&mut self, buf: &[u8]) -> Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }
    }

    #[test]
    fn clamps_write_to_bandwidth_and_hints_retry() {
        let mut set = ThrottleSet::new();
        set.add(Arc::new(parking_lot::Mutex::new(Throttle::new(10, 0))));
        let mut out = ThrottledOutputStream::new(CountingWriter(Vec::new()), set);
        let hints = Arc::new(Mutex::new(Vec::new()));
        let h2 = hints.clone();
        out.on_delay_write(move |ms| h2.lock().unwrap().push(ms));

        let n = out.write(&[0u8; 100]).unwrap();
        assert_eq!(n, 10);
        let n2 = out.write(&[0u8; 100]).unwrap();
        assert_eq!(n2, 0);
        assert_eq!(hints.lock().unwrap().len(), 1);
    }

    #[test]
    fn unthrottled_passes_through() {
        let mut out = ThrottledOutputStream::new(CountingWriter(Vec::new()), ThrottleSet::new());
        assert_eq!(out.write(&[1, 2, 3]).unwrap(), 3);
    }
}
