//! Wire layout of a single application-level block (§3, §4.4).
//!
//! Every block on the TCP stream starts with a fixed header: two signed
//! 32-bit sizes in network byte order, followed by a sender timestamp
//! carried as two 64-bit fields (seconds, nanoseconds) so a 64-bit sender
//! talking to a 32-bit receiver still round-trips the full timestamp.

use byteorder::{BigEndian, ByteOrder};

use crate::time::Timestamp;

#[allow(unused)]
mod field {
    use std::ops::Range;
    pub type Field = Range<usize>;

    pub const THIS_BLOCK_SIZE: Field = 0..4;
    pub const REQUEST_BLOCK_SIZE: Field = 4..8;
    pub const TIMESTAMP_SECS: Field = 8..16;
    pub const TIMESTAMP_NANOS: Field = 16..24;
}

/// Size of the fixed header; also `MIN_BLOCK_SIZE` (§3).
pub const HEADER_LEN: usize = field::TIMESTAMP_NANOS.end;
pub const MIN_BLOCK_SIZE: i32 = HEADER_LEN as i32;

/// `request_block_size` sentinel meaning "this is a response block".
pub const RESPONSE_BLOCK: i32 = -1;
/// `request_block_size` sentinel meaning "no response requested".
pub const NO_RESPONSE: i32 = 0;

/// A read/write view over a block header living at the front of a buffer.
#[derive(Debug)]
pub struct Header<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Header<T> {
    pub fn new(buffer: T) -> Header<T> {
        Header { buffer }
    }

    pub fn this_block_size(&self) -> i32 {
        BigEndian::read_i32(&self.buffer.as_ref()[field::THIS_BLOCK_SIZE])
    }

    pub fn request_block_size(&self) -> i32 {
        BigEndian::read_i32(&self.buffer.as_ref()[field::REQUEST_BLOCK_SIZE])
    }

    pub fn timestamp(&self) -> Timestamp {
        let data = self.buffer.as_ref();
        Timestamp {
            secs: BigEndian::read_i64(&data[field::TIMESTAMP_SECS]),
            nanos: BigEndian::read_i64(&data[field::TIMESTAMP_NANOS]),
        }
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Header<T> {
    pub fn set_this_block_size(&mut self, value: i32) {
        BigEndian::write_i32(&mut self.buffer.as_mut()[field::THIS_BLOCK_SIZE], value);
    }

    pub fn set_request_block_size(&mut self, value: i32) {
        BigEndian::write_i32(&mut self.buffer.as_mut()[field::REQUEST_BLOCK_SIZE], value);
    }

    pub fn set_timestamp(&mut self, tp: Timestamp) {
        let data = self.buffer.as_mut();
        BigEndian::write_i64(&mut data[field::TIMESTAMP_SECS], tp.secs);
        BigEndian::write_i64(&mut data[field::TIMESTAMP_NANOS], tp.nanos);
    }

    /// Builds a request block header: the block carries `this_block_size`
    /// bytes and asks for a response of `requested_response_size` bytes
    /// (0 meaning none), stamped with the current send time.
    pub fn build_request(&mut self, this_block_size: i32, requested_response_size: i32, now: Timestamp) {
        self.set_this_block_size(this_block_size);
        self.set_request_block_size(requested_response_size);
        self.set_timestamp(now);
    }

    /// Builds a response header that echoes `echoed_timestamp` byte-for-byte
    /// so the originator can compute RTT (§3, §4.4).
    pub fn build_response(&mut self, response_size: i32, echoed_timestamp: Timestamp) {
        self.set_this_block_size(response_size);
        self.set_request_block_size(RESPONSE_BLOCK);
        self.set_timestamp(echoed_timestamp);
    }
}

/// Validates a freshly-parsed `this_block_size` against `[MIN_BLOCK_SIZE,
/// max]`. Returns `None` (keep the previous value, log a warning) on
/// violation, per §4.4.
pub fn validate_block_size(parsed: i32, max_block_size: i32) -> Option<i32> {
    if parsed >= MIN_BLOCK_SIZE && parsed <= max_block_size {
        Some(parsed)
    } else {
        None
    }
}

/// Validates a freshly-parsed `request_block_size`: must be `0`, `-1`, or in
/// `[MIN_BLOCK_SIZE, max]`.
pub fn validate_request_block_size(parsed: i32, max_block_size: i32) -> Option<i32> {
    if parsed == NO_RESPONSE || parsed == RESPONSE_BLOCK
        || (parsed >= MIN_BLOCK_SIZE && parsed <= max_block_size)
    {
        Some(parsed)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_request_header() {
        let mut buf = vec![0u8; HEADER_LEN];
        let now = Timestamp::new(1_700_000_000, 123_456_789);
        let mut h = Header::new(&mut buf);
        h.build_request(1460, 800, now);

        let h = Header::new(&buf);
        assert_eq!(h.this_block_size(), 1460);
        assert_eq!(h.request_block_size(), 800);
        assert_eq!(h.timestamp(), now);
    }

    #[test]
    fn response_echoes_timestamp_byte_for_byte() {
        let mut req_buf = vec![0u8; HEADER_LEN];
        let sent = Timestamp::new(42, 7);
        Header::new(&mut req_buf).build_request(200, 0, sent);

        let echoed = Header::new(&req_buf).timestamp();
        let mut resp_buf = vec![0u8; HEADER_LEN];
        let mut resp = Header::new(&mut resp_buf);
        resp.build_response(200, echoed);

        let parsed = Header::new(&resp_buf);
        assert_eq!(parsed.timestamp(), sent);
        assert_eq!(parsed.request_block_size(), RESPONSE_BLOCK);
    }

    #[test]
    fn validate_block_size_rejects_out_of_range() {
        assert_eq!(validate_block_size(HEADER_LEN as i32, 1000), Some(HEADER_LEN as i32));
        assert_eq!(validate_block_size(HEADER_LEN as i32 - 1, 1000), None);
        assert_eq!(validate_block_size(1001, 1000), None);
    }

    #[test]
    fn validate_request_block_size_accepts_sentinels() {
        assert_eq!(validate_request_block_size(0, 1000), Some(0));
        assert_eq!(validate_request_block_size(-1, 1000), Some(-1));
        assert_eq!(validate_request_block_size(-2, 1000), None);
    }
}
