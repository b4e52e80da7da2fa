//! Incremental frame reassembly.
//!
//! TCP delivers an arbitrary split of the byte stream, so [`FrameDecoder`]
//! keeps a cursor into whichever field it is currently filling and resumes
//! exactly where the previous chunk left off. A single chunk may complete one
//! frame and start the next; [`FrameDecoder::advance`] stops at the first
//! completed frame and reports how much input it consumed, so the caller can
//! feed the remainder back in after handling the frame.
//!
//! ## Buffers
//!
//! Each decoder owns one data buffer sized for the common case
//! (`expected_data_len`). Frames that fit are read into it. Larger frames
//! (up to `max_data_len`) get a dedicated buffer of exactly their size, which
//! is released when the next frame begins.

use tracing::warn;

use crate::protocol::{DecodeError, FrameHeader, FrameLimits, HEADER_LEN, round_up4};

/// Which field of the frame the decoder is currently filling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    FilePath,
    SerialNumber,
    Data,
}

/// A fully received frame, borrowed from the decoder's buffers.
///
/// Valid until the next call to [`FrameDecoder::advance`].
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub send_id: [u8; 4],
    pub file_path: &'a str,
    pub serial_number: &'a str,
    pub data: &'a [u8],
    /// `true` when the payload exceeded the shared buffer and was read into a
    /// buffer allocated for this frame alone.
    pub dedicated_buffer: bool,
}

/// Result of feeding one chunk (or the rest of one) to the decoder.
#[derive(Debug)]
pub struct Advance<'a> {
    /// Bytes of the input that were consumed.
    pub consumed: usize,
    /// The frame completed by this input, if any.
    pub frame: Option<Frame<'a>>,
}

/// Per-connection frame reassembly state machine.
pub struct FrameDecoder {
    limits: FrameLimits,
    state: State,
    /// Cursor within the field named by `state`.
    pos: usize,
    header_buf: [u8; HEADER_LEN],
    header: FrameHeader,
    path_buf: Vec<u8>,
    serial_buf: Vec<u8>,
    shared_data: Vec<u8>,
    dedicated_data: Option<Vec<u8>>,
    file_path: String,
    serial_number: String,
}

impl FrameDecoder {
    pub fn new(limits: FrameLimits) -> Self {
        Self {
            limits,
            state: State::Header,
            pos: 0,
            header_buf: [0; HEADER_LEN],
            header: FrameHeader::default(),
            path_buf: vec![0; round_up4(limits.max_file_path_len) as usize],
            serial_buf: vec![0; round_up4(limits.max_serial_len) as usize],
            shared_data: vec![0; limits.expected_data_len as usize],
            dedicated_data: None,
            file_path: String::new(),
            serial_number: String::new(),
        }
    }

    /// Whether the decoder sits on a frame boundary (no partial frame held).
    pub fn is_idle(&self) -> bool {
        self.state == State::Header && self.pos == 0
    }

    /// Consume bytes from `input` until a frame completes or the input runs
    /// out.
    ///
    /// Bytes after the end of a completed frame are left unconsumed; call
    /// again with `&input[consumed..]` to continue with the next frame.
    pub fn advance(&mut self, input: &[u8]) -> Result<Advance<'_>, DecodeError> {
        let mut consumed = 0;
        loop {
            let rest = &input[consumed..];
            match self.state {
                State::Header => {
                    if rest.is_empty() {
                        return Ok(Advance { consumed, frame: None });
                    }
                    consumed += fill(&mut self.header_buf, &mut self.pos, rest);
                    if self.pos < HEADER_LEN {
                        return Ok(Advance { consumed, frame: None });
                    }
                    let header = FrameHeader::parse(&self.header_buf, &self.limits)?;
                    self.begin_frame(header);
                }
                State::FilePath => {
                    let target = self.header.padded_file_path_len() as usize;
                    consumed += fill(&mut self.path_buf[..target], &mut self.pos, rest);
                    if self.pos < target {
                        return Ok(Advance { consumed, frame: None });
                    }
                    let raw = self.header.file_path_len as usize;
                    self.file_path = String::from_utf8_lossy(&self.path_buf[..raw]).into_owned();
                    self.transition(State::SerialNumber);
                }
                State::SerialNumber => {
                    let target = self.header.padded_serial_len() as usize;
                    consumed += fill(&mut self.serial_buf[..target], &mut self.pos, rest);
                    if self.pos < target {
                        return Ok(Advance { consumed, frame: None });
                    }
                    let raw = self.header.serial_len as usize;
                    let serial = String::from_utf8_lossy(&self.serial_buf[..raw]).into_owned();
                    if !self.serial_number.is_empty() && serial != self.serial_number {
                        warn!(
                            "Serial number changed from {} to {}",
                            self.serial_number, serial
                        );
                    }
                    self.serial_number = serial;
                    self.transition(State::Data);
                }
                State::Data => {
                    let target = self.header.data_len as usize;
                    let buf = match self.dedicated_data.as_mut() {
                        Some(buf) => buf.as_mut_slice(),
                        None => &mut self.shared_data[..target],
                    };
                    consumed += fill(buf, &mut self.pos, rest);
                    if self.pos < target {
                        return Ok(Advance { consumed, frame: None });
                    }
                    self.transition(State::Header);
                    return Ok(Advance {
                        consumed,
                        frame: Some(self.completed_frame()),
                    });
                }
            }
        }
    }

    fn begin_frame(&mut self, header: FrameHeader) {
        self.header = header;
        self.dedicated_data = if header.data_len > self.limits.expected_data_len {
            Some(vec![0; header.data_len as usize])
        } else {
            None
        };
        self.transition(State::FilePath);
    }

    fn transition(&mut self, state: State) {
        self.state = state;
        self.pos = 0;
    }

    fn completed_frame(&self) -> Frame<'_> {
        let len = self.header.data_len as usize;
        let (data, dedicated_buffer) = match &self.dedicated_data {
            Some(buf) => (buf.as_slice(), true),
            None => (&self.shared_data[..len], false),
        };
        Frame {
            send_id: self.header.send_id,
            file_path: &self.file_path,
            serial_number: &self.serial_number,
            data,
            dedicated_buffer,
        }
    }
}

/// Copy as much of `src` as fits into `dst[*pos..]`, advancing `pos`.
fn fill(dst: &mut [u8], pos: &mut usize, src: &[u8]) -> usize {
    let n = (dst.len() - *pos).min(src.len());
    dst[*pos..*pos + n].copy_from_slice(&src[..n]);
    *pos += n;
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_frame, Field, MAX_DATA_LEN};

    #[derive(Debug, PartialEq, Eq)]
    struct Decoded {
        send_id: [u8; 4],
        file_path: String,
        serial_number: String,
        data: Vec<u8>,
        dedicated_buffer: bool,
    }

    fn small_limits() -> FrameLimits {
        FrameLimits {
            expected_data_len: 16,
            ..FrameLimits::default()
        }
    }

    /// Feed `chunks` in order and collect every completed frame.
    fn decode_chunks(decoder: &mut FrameDecoder, chunks: &[&[u8]]) -> Vec<Decoded> {
        let mut out = Vec::new();
        for chunk in chunks {
            let mut offset = 0;
            while offset < chunk.len() {
                let step = decoder.advance(&chunk[offset..]).unwrap();
                offset += step.consumed;
                if let Some(f) = step.frame {
                    out.push(Decoded {
                        send_id: f.send_id,
                        file_path: f.file_path.to_string(),
                        serial_number: f.serial_number.to_string(),
                        data: f.data.to_vec(),
                        dedicated_buffer: f.dedicated_buffer,
                    });
                }
            }
        }
        out
    }

    fn expected(send_id: u32, fp: &str, sn: &str, data: &[u8], dedicated: bool) -> Decoded {
        Decoded {
            send_id: send_id.to_le_bytes(),
            file_path: fp.to_string(),
            serial_number: sn.to_string(),
            data: data.to_vec(),
            dedicated_buffer: dedicated,
        }
    }

    #[test]
    fn test_single_chunk() {
        let wire = encode_frame(7, "a/b.x", "P01", &[1, 2, 3, 4, 5, 6]);
        let mut d = FrameDecoder::new(small_limits());
        let frames = decode_chunks(&mut d, &[&wire]);
        assert_eq!(frames, vec![expected(7, "a/b.x", "P01", &[1, 2, 3, 4, 5, 6], false)]);
        assert!(d.is_idle());
    }

    #[test]
    fn test_every_split_point() {
        let wire = encode_frame(0xDEAD_BEEF, "/data/2024/file.dat", "P12345", b"abcdefghijk");
        let want = expected(0xDEAD_BEEF, "/data/2024/file.dat", "P12345", b"abcdefghijk", false);
        for split in 0..=wire.len() {
            let mut d = FrameDecoder::new(small_limits());
            let (a, b) = wire.split_at(split);
            let frames = decode_chunks(&mut d, &[a, b]);
            assert_eq!(frames.len(), 1, "split at {split}");
            assert_eq!(frames[0], want, "split at {split}");
        }
    }

    #[test]
    fn test_every_pair_of_split_points() {
        let wire = encode_frame(3, "xyz", "P7", &[9; 10]);
        for i in 0..=wire.len() {
            for j in i..=wire.len() {
                let mut d = FrameDecoder::new(small_limits());
                let frames = decode_chunks(&mut d, &[&wire[..i], &wire[i..j], &wire[j..]]);
                assert_eq!(frames, vec![expected(3, "xyz", "P7", &[9; 10], false)]);
            }
        }
    }

    #[test]
    fn test_one_byte_at_a_time() {
        let data: Vec<u8> = (0..40).collect();
        let wire = encode_frame(11, "one/byte.dat", "P0001", &data);
        let chunks: Vec<&[u8]> = wire.chunks(1).collect();
        let mut d = FrameDecoder::new(small_limits());
        let frames = decode_chunks(&mut d, &chunks);
        assert_eq!(frames, vec![expected(11, "one/byte.dat", "P0001", &data, true)]);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut wire = encode_frame(1, "f1", "P01", &[1, 1]);
        wire.extend(encode_frame(2, "f2", "P01", &[2, 2, 2]));
        wire.extend(encode_frame(3, "f3", "P01", &[]));
        let mut d = FrameDecoder::new(small_limits());

        let step = d.advance(&wire).unwrap();
        let first_len = step.consumed;
        assert_eq!(step.frame.unwrap().data, &[1, 1]);
        assert!(first_len < wire.len());

        let frames = decode_chunks(&mut d, &[&wire[first_len..]]);
        assert_eq!(
            frames,
            vec![
                expected(2, "f2", "P01", &[2, 2, 2], false),
                expected(3, "f3", "P01", &[], false),
            ]
        );
    }

    #[test]
    fn test_frames_straddling_chunks() {
        let mut wire = Vec::new();
        for i in 0..5u32 {
            wire.extend(encode_frame(i, &format!("file{i}.dat"), "P9", &vec![i as u8; i as usize * 3]));
        }
        for size in [1, 3, 7, 13, 64] {
            let chunks: Vec<&[u8]> = wire.chunks(size).collect();
            let mut d = FrameDecoder::new(small_limits());
            let frames = decode_chunks(&mut d, &chunks);
            assert_eq!(frames.len(), 5, "chunk size {size}");
            for (i, f) in frames.iter().enumerate() {
                assert_eq!(f.send_id, (i as u32).to_le_bytes());
                assert_eq!(f.data.len(), i * 3);
            }
        }
    }

    #[test]
    fn test_empty_fields() {
        let wire = encode_frame(5, "", "", &[]);
        assert_eq!(wire.len(), HEADER_LEN);
        let mut d = FrameDecoder::new(small_limits());
        let step = d.advance(&wire).unwrap();
        assert_eq!(step.consumed, HEADER_LEN);
        let frame = step.frame.unwrap();
        assert_eq!(frame.file_path, "");
        assert_eq!(frame.serial_number, "");
        assert!(frame.data.is_empty());
        assert!(d.is_idle());
    }

    #[test]
    fn test_padding_is_discarded() {
        let mut wire = encode_frame(1, "abcde", "P1", &[7]);
        // Padding bytes are not required to be zero.
        wire[16 + 5..16 + 8].copy_from_slice(b"###");
        wire[24 + 2..24 + 4].copy_from_slice(b"##");
        let mut d = FrameDecoder::new(small_limits());
        let frames = decode_chunks(&mut d, &[&wire]);
        assert_eq!(frames, vec![expected(1, "abcde", "P1", &[7], false)]);
    }

    #[test]
    fn test_shared_and_dedicated_buffers_yield_same_data() {
        let limits = small_limits();
        let small: Vec<u8> = (0..16).collect();
        let large: Vec<u8> = (0..17).collect();
        let mut d = FrameDecoder::new(limits);

        let frames = decode_chunks(&mut d, &[&encode_frame(1, "s", "P1", &small)]);
        assert!(!frames[0].dedicated_buffer);
        assert_eq!(frames[0].data, small);

        let wire = encode_frame(2, "l", "P1", &large);
        let frames = decode_chunks(&mut d, &[&wire]);
        assert!(frames[0].dedicated_buffer);
        assert_eq!(frames[0].data, large);
        assert_eq!(d.dedicated_data.as_ref().map(Vec::len), Some(17));

        // The next ordinary frame goes back to the shared buffer.
        let frames = decode_chunks(&mut d, &[&encode_frame(3, "s", "P1", &small[..4])]);
        assert!(!frames[0].dedicated_buffer);
        assert!(d.dedicated_data.is_none());
    }

    #[test]
    fn test_default_limits_use_shared_buffer_at_expected_size() {
        let mut d = FrameDecoder::new(FrameLimits::default());
        assert_eq!(d.shared_data.len(), 757_440);
        let data = vec![0xAB; 757_440];
        let frames = decode_chunks(&mut d, &[&encode_frame(1, "f", "P1", &data)]);
        assert!(!frames[0].dedicated_buffer);
        assert_eq!(frames[0].data.len(), 757_440);
    }

    #[test]
    fn test_rejects_oversized_data() {
        let mut header = encode_frame(1, "f", "P1", &[]);
        header[12..16].copy_from_slice(&(MAX_DATA_LEN + 1).to_le_bytes());
        let mut d = FrameDecoder::new(small_limits());
        let err = d.advance(&header).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::LengthOutOfBounds { field: Field::Data, .. }
        ));
    }

    #[test]
    fn test_rejects_oversized_path_split_header() {
        let mut header = encode_frame(1, "", "", &[]);
        header[4..8].copy_from_slice(&600u32.to_le_bytes());
        let mut d = FrameDecoder::new(small_limits());
        assert!(d.advance(&header[..10]).unwrap().frame.is_none());
        assert!(d.advance(&header[10..]).is_err());
    }

    #[test]
    fn test_serial_change_is_not_fatal() {
        let mut wire = encode_frame(1, "f", "P1", &[1]);
        wire.extend(encode_frame(2, "f", "P2", &[2]));
        let mut d = FrameDecoder::new(small_limits());
        let frames = decode_chunks(&mut d, &[&wire]);
        assert_eq!(frames[0].serial_number, "P1");
        assert_eq!(frames[1].serial_number, "P2");
        assert!(d.is_idle());
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let mut wire = encode_frame(1, "ab", "P1", &[]);
        wire[16] = 0xFF;
        let mut d = FrameDecoder::new(small_limits());
        let frames = decode_chunks(&mut d, &[&wire]);
        assert_eq!(frames[0].file_path, "\u{FFFD}b");
    }

    #[test]
    fn test_not_idle_mid_frame() {
        let wire = encode_frame(1, "path", "P1", &[1, 2, 3]);
        let mut d = FrameDecoder::new(small_limits());
        assert!(d.is_idle());
        d.advance(&wire[..3]).unwrap();
        assert!(!d.is_idle());
        d.advance(&wire[3..wire.len() - 1]).unwrap();
        assert!(!d.is_idle());
        assert!(d.advance(&wire[wire.len() - 1..]).unwrap().frame.is_some());
        assert!(d.is_idle());
    }
}
