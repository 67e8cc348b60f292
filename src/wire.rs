use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Points carried by one insert envelope: one second of capture at 120 Hz.
pub const POINTS_PER_MESSAGE: usize = 120;

const MAX_FRAME_LEN: u64 = 1024 * 1024;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InsertRequest {
    #[prost(uint64, tag = "1")]
    pub echo_tag: u64,
    #[prost(message, optional, tag = "2")]
    pub insert: Option<InsertValues>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InsertValues {
    /// 16-byte stream target identifier.
    #[prost(bytes = "vec", tag = "1")]
    pub stream_uuid: Vec<u8>,
    /// Durable-write flag; always false here (fire-and-forget at the destination).
    #[prost(bool, tag = "2")]
    pub sync: bool,
    #[prost(message, repeated, tag = "3")]
    pub points: Vec<Point>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Point {
    #[prost(int64, tag = "1")]
    pub time_nanos: i64,
    #[prost(double, tag = "2")]
    pub value: f64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InsertResponse {
    #[prost(uint64, tag = "1")]
    pub echo_tag: u64,
    #[prost(enumeration = "StatusCode", tag = "2")]
    pub status: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    InternalError = 1,
    InvalidStream = 2,
    InvalidTimeRange = 3,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("transport read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("frame length {0} exceeds limit")]
    FrameTooLarge(u64),
}

/// Reads one length-delimited message. `Ok(None)` means the peer closed the
/// stream cleanly before a new frame started.
pub async fn read_message<M, R>(reader: &mut R) -> Result<Option<M>, WireError>
where
    M: Message + Default,
    R: AsyncRead + Unpin,
{
    let len = match read_varint(reader).await? {
        Some(len) => len,
        None => return Ok(None),
    };
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(M::decode(payload.as_slice())?))
}

async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<u64>, WireError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof && shift == 0 => {
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
        if shift >= 64 {
            return Err(WireError::Decode(prost::DecodeError::new(
                "length varint overflows u64",
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[tokio::test]
    async fn frames_larger_than_one_varint_byte_round_trip() {
        let request = InsertRequest {
            echo_tag: 42,
            insert: Some(InsertValues {
                stream_uuid: vec![7u8; 16],
                sync: false,
                points: (0..POINTS_PER_MESSAGE)
                    .map(|i| Point {
                        time_nanos: 1_000_000 * i as i64,
                        value: i as f64 * 0.5,
                    })
                    .collect(),
            }),
        };
        let mut buf = BytesMut::new();
        request.encode_length_delimited(&mut buf).unwrap();
        // The payload is well past 127 bytes, so the length prefix spans
        // multiple varint bytes.
        assert!(buf.len() > 128);

        let mut reader = buf.as_ref();
        let decoded: InsertRequest = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded, request);
        assert!(read_message::<InsertRequest, _>(&mut reader)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn clean_eof_reads_as_none() {
        let mut reader: &[u8] = &[];
        let got = read_message::<InsertResponse, _>(&mut reader).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected_before_reading() {
        let len = MAX_FRAME_LEN + 1;
        let mut buf = BytesMut::new();
        prost::encode_length_delimiter(len as usize, &mut buf).unwrap();
        // No payload follows; the guard must fire on the prefix alone.
        let mut reader = buf.as_ref();
        let err = read_message::<InsertRequest, _>(&mut reader)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge(got) if got == len));
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let response = InsertResponse {
            echo_tag: 9,
            status: StatusCode::Ok as i32,
        };
        let mut buf = BytesMut::new();
        response.encode_length_delimited(&mut buf).unwrap();
        let mut reader = &buf.as_ref()[..buf.len() - 1];
        assert!(read_message::<InsertResponse, _>(&mut reader).await.is_err());
    }
}
