use crate::codec::error::SinkError;

/// Byte sink driven by the serializer.
///
/// A sink accepts between 0 and `bytes.len()` bytes per call and returns how
/// many it took. A short count signals overflow: the serializer will return
/// [EncodeError::Overflow](crate::codec::error::EncodeError::Overflow) and
/// the caller must retry the same operation with the same sink once it can
/// accept more data. Bytes already accepted are never re-sent on a retry.
pub trait Sink {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, SinkError>;
}

/// Unbounded in-memory sink.
#[derive(Debug, Default)]
pub struct VecSink {
    buf: Vec<u8>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl Sink for VecSink {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, SinkError> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }
}

/// Test sink that accepts a limited byte budget, then overflows until
/// refilled. Exercises the serializer's retry discipline.
#[cfg(test)]
pub(crate) struct ChokeSink {
    pub accepted: Vec<u8>,
    pub budget: usize,
}

#[cfg(test)]
impl ChokeSink {
    pub fn new(budget: usize) -> Self {
        ChokeSink {
            accepted: Vec::new(),
            budget,
        }
    }

    pub fn refill(&mut self, budget: usize) {
        self.budget = budget;
    }
}

#[cfg(test)]
impl Sink for ChokeSink {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, SinkError> {
        let n = bytes.len().min(self.budget);
        self.accepted.extend_from_slice(&bytes[..n]);
        self.budget -= n;
        Ok(n)
    }
}
