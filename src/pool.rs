use crate::wire::{InsertRequest, InsertValues, Point, POINTS_PER_MESSAGE};
use bytes::BytesMut;
use prost::Message;
use std::sync::Mutex;
use uuid::Uuid;

/// Reusable envelope builder. The caller owns it between `acquire` and
/// `release`, must set the echo tag, target and every point before encoding,
/// and must not touch it after release. Prior contents are not cleared.
pub struct EnvelopeBuilder {
    request: InsertRequest,
    scratch: BytesMut,
}

impl EnvelopeBuilder {
    fn with_capacity() -> Self {
        Self {
            request: InsertRequest {
                echo_tag: 0,
                insert: Some(InsertValues {
                    stream_uuid: vec![0u8; 16],
                    sync: false,
                    points: vec![Point::default(); POINTS_PER_MESSAGE],
                }),
            },
            scratch: BytesMut::with_capacity(4096),
        }
    }

    pub fn begin(&mut self, echo_tag: u64, target: &Uuid) {
        self.request.echo_tag = echo_tag;
        let insert = self.request.insert.get_or_insert_with(InsertValues::default);
        insert.stream_uuid.clear();
        insert.stream_uuid.extend_from_slice(target.as_bytes());
        insert.sync = false;
        insert.points.resize(POINTS_PER_MESSAGE, Point::default());
    }

    pub fn points_mut(&mut self) -> &mut [Point] {
        match self.request.insert.as_mut() {
            Some(insert) => &mut insert.points,
            None => &mut [],
        }
    }

    /// Encodes the length-delimited frame into the builder's scratch buffer.
    pub fn encode(&mut self) -> Result<&[u8], prost::EncodeError> {
        self.scratch.clear();
        self.request.encode_length_delimited(&mut self.scratch)?;
        Ok(&self.scratch)
    }
}

/// Free-list of envelope builders, amortizing allocation under fan-out: a
/// batch may need up to 13 x samples envelopes.
pub struct EnvelopePool {
    free: Mutex<Vec<EnvelopeBuilder>>,
}

impl EnvelopePool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn acquire(&self) -> EnvelopeBuilder {
        let recycled = self.free.lock().ok().and_then(|mut free| free.pop());
        recycled.unwrap_or_else(EnvelopeBuilder::with_capacity)
    }

    pub fn release(&self, builder: EnvelopeBuilder) {
        if let Ok(mut free) = self.free.lock() {
            free.push(builder);
        }
    }
}
