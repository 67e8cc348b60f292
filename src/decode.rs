use crate::wire::POINTS_PER_MESSAGE;
use thiserror::Error;

/// Logical channels per device: three voltage phasors, three current
/// phasors (magnitude + angle each) and the GPS lock state.
pub const NUM_STREAMS: usize = 13;

/// Stream-target argument order; index-aligned with [`CHANNEL_EXTRACTORS`].
pub const CHANNEL_ORDER: [&str; NUM_STREAMS] = [
    "L1 Magnitude",
    "L1 Angle",
    "L2 Magnitude",
    "L2 Angle",
    "L3 Magnitude",
    "L3 Angle",
    "C1 Magnitude",
    "C1 Angle",
    "C2 Magnitude",
    "C2 Angle",
    "C3 Magnitude",
    "C3 Angle",
    "Lock State",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CivilTime {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

#[derive(Debug, Clone)]
pub struct PhasorSeries {
    pub magnitude: [f64; POINTS_PER_MESSAGE],
    pub angle: [f64; POINTS_PER_MESSAGE],
}

/// One second of decoded capture: a civil timestamp plus a dense sub-point
/// series for each logical channel.
#[derive(Debug, Clone)]
pub struct DecodedSample {
    pub time: CivilTime,
    pub l1: PhasorSeries,
    pub l2: PhasorSeries,
    pub l3: PhasorSeries,
    pub c1: PhasorSeries,
    pub c2: PhasorSeries,
    pub c3: PhasorSeries,
    pub lock_state: [f64; POINTS_PER_MESSAGE],
}

pub type ChannelExtractor = fn(&DecodedSample, usize) -> f64;

pub const CHANNEL_EXTRACTORS: [ChannelExtractor; NUM_STREAMS] = [
    |s, i| s.l1.magnitude[i],
    |s, i| s.l1.angle[i],
    |s, i| s.l2.magnitude[i],
    |s, i| s.l2.angle[i],
    |s, i| s.l3.magnitude[i],
    |s, i| s.l3.angle[i],
    |s, i| s.c1.magnitude[i],
    |s, i| s.c1.angle[i],
    |s, i| s.c2.magnitude[i],
    |s, i| s.c2.angle[i],
    |s, i| s.c3.magnitude[i],
    |s, i| s.c3.angle[i],
    |s, i| s.lock_state[i],
];

/// Bytes per capture frame: six i32 civil-time components followed by the 13
/// channel series, 120 little-endian f64 values each.
pub const FRAME_LEN: usize = 6 * 4 + NUM_STREAMS * POINTS_PER_MESSAGE * 8;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload length {0} is not a whole number of {FRAME_LEN}-byte frames")]
    TruncatedPayload(usize),
}

pub trait PayloadDecoder: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<Vec<DecodedSample>, DecodeError>;
}

/// Production decoder for the capture pipeline's fixed frame layout.
pub struct FrameDecoder;

impl PayloadDecoder for FrameDecoder {
    fn decode(&self, payload: &[u8]) -> Result<Vec<DecodedSample>, DecodeError> {
        if payload.len() % FRAME_LEN != 0 {
            return Err(DecodeError::TruncatedPayload(payload.len()));
        }
        Ok(payload.chunks_exact(FRAME_LEN).map(decode_frame).collect())
    }
}

fn decode_frame(frame: &[u8]) -> DecodedSample {
    let mut cursor = frame;
    let time = CivilTime {
        year: read_i32(&mut cursor),
        month: read_i32(&mut cursor) as u32,
        day: read_i32(&mut cursor) as u32,
        hour: read_i32(&mut cursor) as u32,
        minute: read_i32(&mut cursor) as u32,
        second: read_i32(&mut cursor) as u32,
    };
    let l1 = read_phasor(&mut cursor);
    let l2 = read_phasor(&mut cursor);
    let l3 = read_phasor(&mut cursor);
    let c1 = read_phasor(&mut cursor);
    let c2 = read_phasor(&mut cursor);
    let c3 = read_phasor(&mut cursor);
    let lock_state = read_series(&mut cursor);
    DecodedSample {
        time,
        l1,
        l2,
        l3,
        c1,
        c2,
        c3,
        lock_state,
    }
}

fn read_i32(cursor: &mut &[u8]) -> i32 {
    let (chunk, rest) = cursor.split_at(4);
    *cursor = rest;
    i32::from_le_bytes(chunk.try_into().unwrap())
}

fn read_phasor(cursor: &mut &[u8]) -> PhasorSeries {
    PhasorSeries {
        magnitude: read_series(cursor),
        angle: read_series(cursor),
    }
}

fn read_series(cursor: &mut &[u8]) -> [f64; POINTS_PER_MESSAGE] {
    let mut out = [0.0; POINTS_PER_MESSAGE];
    for slot in out.iter_mut() {
        let (chunk, rest) = cursor.split_at(8);
        *cursor = rest;
        *slot = f64::from_le_bytes(chunk.try_into().unwrap());
    }
    out
}

#[cfg(test)]
pub(crate) fn encode_frame(sample: &DecodedSample) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_LEN);
    for component in [
        sample.time.year,
        sample.time.month as i32,
        sample.time.day as i32,
        sample.time.hour as i32,
        sample.time.minute as i32,
        sample.time.second as i32,
    ] {
        out.extend_from_slice(&component.to_le_bytes());
    }
    for channel in 0..NUM_STREAMS {
        for i in 0..POINTS_PER_MESSAGE {
            out.extend_from_slice(&CHANNEL_EXTRACTORS[channel](sample, i).to_le_bytes());
        }
    }
    out
}

#[cfg(test)]
pub(crate) fn sample_at(time: CivilTime) -> DecodedSample {
    let series = |offset: f64| {
        let mut out = [0.0; POINTS_PER_MESSAGE];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = offset + i as f64;
        }
        out
    };
    let phasor = |offset: f64| PhasorSeries {
        magnitude: series(offset),
        angle: series(offset + 500.0),
    };
    DecodedSample {
        time,
        l1: phasor(1_000.0),
        l2: phasor(2_000.0),
        l3: phasor(3_000.0),
        c1: phasor(4_000.0),
        c2: phasor(5_000.0),
        c3: phasor(6_000.0),
        lock_state: series(7_000.0),
    }
}
