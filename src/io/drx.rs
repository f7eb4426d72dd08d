//! Reader for the DRX raw beamformer voltage format.
//!
//! A DRX recording is a stream of fixed 4128-octet frames: a 16-byte header
//! (sync word, frame id, seconds count, decimation, time offset), a 16-byte
//! payload preamble (time tag, tuning word, flags) and 4096 complex samples
//! packed as 4-bit I / 4-bit Q pairs. All integer fields are big-endian on
//! the wire. Frames from one beam arrive in groups of four, one per
//! (tuning, polarization) pair.

use anyhow::{Context, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rustfft::num_complex::Complex;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Total size of one frame on disk, in octets.
pub const FRAME_SIZE: usize = 4128;

/// Complex time samples carried by one frame.
pub const SAMPLES_PER_FRAME: usize = 4096;

/// Frames per beam per time slot: two tunings times two polarizations.
pub const FRAMES_PER_BEAM: usize = 4;

/// Marker starting every well-formed frame.
pub const SYNC_WORD: u32 = 0xDEC0_DE5C;

/// Digitizer base clock in Hz; the per-recording sample rate is this divided
/// by the decimation field of the header.
pub const BASE_CLOCK: f64 = 196.0e6;

/// One decoded DRX frame.
pub struct Frame {
    pub beam: u8,
    /// Tuning index, 0 or 1.
    pub tune: u8,
    /// Polarization index, 0 or 1.
    pub pol: u8,
    pub frame_count: u32,
    pub seconds_count: u32,
    pub decimation: u16,
    pub time_offset: u16,
    pub time_tag: u64,
    pub tuning_word: u32,
    pub flags: u32,
    pub iq: Vec<Complex<f32>>,
}

impl Frame {
    /// Sample rate of the recording in Hz.
    pub fn sample_rate(&self) -> f64 {
        BASE_CLOCK / self.decimation as f64
    }

    /// Center frequency of this frame's tuning in Hz.
    pub fn central_freq(&self) -> f64 {
        BASE_CLOCK * self.tuning_word as f64 / 2f64.powi(32)
    }
}

/// Identity and timing fields for synthesizing frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameParams {
    pub beam: u8,
    /// Tuning index, 0 or 1 (encoded 1-based on the wire).
    pub tune: u8,
    pub pol: u8,
    pub decimation: u16,
    pub time_tag: u64,
    pub tuning_word: u32,
}

/// Encode one frame in the DRX wire format. `iq` supplies up to
/// [`SAMPLES_PER_FRAME`] (I, Q) pairs, each clamped to the signed 4-bit
/// range; missing samples are zero-filled. Used to synthesize recordings
/// for end-to-end verification.
pub fn encode_frame<W: Write>(out: &mut W, params: &FrameParams, iq: &[(i8, i8)]) -> Result<()> {
    let id = (params.beam & 0x07) | (((params.tune + 1) & 0x07) << 3) | ((params.pol & 0x01) << 7);
    out.write_u32::<BigEndian>(SYNC_WORD)?;
    out.write_u32::<BigEndian>((id as u32) << 24)?;
    out.write_u32::<BigEndian>(0)?; // seconds count
    out.write_u16::<BigEndian>(params.decimation)?;
    out.write_u16::<BigEndian>(0)?; // time offset
    out.write_u64::<BigEndian>(params.time_tag)?;
    out.write_u32::<BigEndian>(params.tuning_word)?;
    out.write_u32::<BigEndian>(0)?; // flags
    let mut payload = [0u8; SAMPLES_PER_FRAME];
    for (slot, &(i, q)) in payload.iter_mut().zip(iq.iter()) {
        let i = i.clamp(-8, 7) as u8 & 0x0F;
        let q = q.clamp(-8, 7) as u8 & 0x0F;
        *slot = (i << 4) | q;
    }
    out.write_all(&payload)?;
    Ok(())
}

/// Forward-only DRX frame reader with one-byte resynchronization.
pub struct DrxReader<R> {
    inner: R,
}

impl DrxReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("DRX file {} not found or could not be opened", path.display()))?;
        Ok(DrxReader {
            inner: BufReader::new(file),
        })
    }
}

impl<R: Read + Seek> DrxReader<R> {
    pub fn new(inner: R) -> Self {
        DrxReader { inner }
    }

    /// Seek to an absolute byte offset in the stream.
    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    /// Read the next frame. Returns `Ok(None)` at end of stream (including a
    /// trailing partial frame). On a sync mismatch the reader rewinds all but
    /// one byte and scans forward until the sync pattern lines up again.
    pub fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            let sync = match self.inner.read_u32::<BigEndian>() {
                Ok(word) => word,
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
                Err(err) => return Err(err.into()),
            };
            if sync != SYNC_WORD {
                self.inner.seek(SeekFrom::Current(-3))?;
                continue;
            }
            return match self.read_frame_body() {
                Ok(frame) => Ok(Some(frame)),
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(None),
                Err(err) => Err(err.into()),
            };
        }
    }

    fn read_frame_body(&mut self) -> std::io::Result<Frame> {
        let frame_count_word = self.inner.read_u32::<BigEndian>()?;
        let seconds_count = self.inner.read_u32::<BigEndian>()?;
        let decimation = self.inner.read_u16::<BigEndian>()?;
        let time_offset = self.inner.read_u16::<BigEndian>()?;
        let time_tag = self.inner.read_u64::<BigEndian>()?;
        let tuning_word = self.inner.read_u32::<BigEndian>()?;
        let flags = self.inner.read_u32::<BigEndian>()?;

        let id = (frame_count_word >> 24) as u8;
        let beam = id & 0x07;
        let tune = ((id >> 3) & 0x07).saturating_sub(1);
        let pol = (id >> 7) & 0x01;

        let mut payload = vec![0u8; SAMPLES_PER_FRAME];
        self.inner.read_exact(&mut payload)?;
        let iq = payload.iter().map(|&b| decode_sample(b)).collect();

        Ok(Frame {
            beam,
            tune,
            pol,
            frame_count: frame_count_word & 0x00FF_FFFF,
            seconds_count,
            decimation,
            time_offset,
            time_tag,
            tuning_word,
            flags,
            iq,
        })
    }
}

/// Unpack one 4-bit I / 4-bit Q two's-complement sample.
fn decode_sample(byte: u8) -> Complex<f32> {
    let mut i = ((byte >> 4) & 0x0F) as i8;
    let mut q = (byte & 0x0F) as i8;
    if i >= 8 {
        i -= 16;
    }
    if q >= 8 {
        q -= 16;
    }
    Complex::new(i as f32, q as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn params(tune: u8, pol: u8) -> FrameParams {
        FrameParams {
            beam: 2,
            tune,
            pol,
            decimation: 10,
            time_tag: 196_000_000,
            tuning_word: 1_643_482_384, // ~75 MHz
        }
    }

    #[test]
    fn frame_round_trip() {
        let mut bytes = Vec::new();
        let iq: Vec<(i8, i8)> = (0..SAMPLES_PER_FRAME)
            .map(|n| ((n % 15) as i8 - 7, -((n % 13) as i8 - 6)))
            .collect();
        encode_frame(&mut bytes, &params(1, 0), &iq).unwrap();
        assert_eq!(bytes.len(), FRAME_SIZE);

        let mut reader = DrxReader::new(Cursor::new(bytes));
        let frame = reader.read_frame().unwrap().unwrap();
        assert_eq!(frame.beam, 2);
        assert_eq!(frame.tune, 1);
        assert_eq!(frame.pol, 0);
        assert!((frame.sample_rate() - 19.6e6).abs() < 1.0);
        for (sample, &(i, q)) in frame.iq.iter().zip(iq.iter()) {
            assert_eq!(sample.re, i as f32);
            assert_eq!(sample.im, q as f32);
        }
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn central_freq_follows_tuning_word() {
        let mut bytes = Vec::new();
        encode_frame(&mut bytes, &params(0, 0), &[]).unwrap();
        let frame = DrxReader::new(Cursor::new(bytes)).read_frame().unwrap().unwrap();
        let expected = BASE_CLOCK * 1_643_482_384f64 / 2f64.powi(32);
        assert!((frame.central_freq() - expected).abs() < 1.0);
    }

    #[test]
    fn resync_advances_one_byte_at_a_time() {
        let mut bytes = vec![0xAAu8; 7]; // junk before the first frame
        encode_frame(&mut bytes, &params(0, 1), &[(3, -4)]).unwrap();
        let mut reader = DrxReader::new(Cursor::new(bytes));
        let frame = reader.read_frame().unwrap().unwrap();
        assert_eq!(frame.pol, 1);
        assert_eq!(frame.iq[0], Complex::new(3.0, -4.0));
    }

    #[test]
    fn truncated_tail_reads_as_eof() {
        let mut bytes = Vec::new();
        encode_frame(&mut bytes, &params(0, 0), &[]).unwrap();
        bytes.truncate(FRAME_SIZE - 100);
        let mut reader = DrxReader::new(Cursor::new(bytes));
        assert!(reader.read_frame().unwrap().is_none());
    }
}
