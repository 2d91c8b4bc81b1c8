//! HTTP forwarding over broker sub-connections.
//!
//! A proxied request uses up to two streams besides the call itself: the
//! response stream, on which the plugin sends [`ResponseOp`]s, and an optional
//! body stream carrying the raw request body until EOF.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, TryStreamExt};
use http::{HeaderName, HeaderValue, Response, StatusCode};
use http_body::{Body as HttpBody, Frame};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full, StreamBody};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::{
    codec::{Decoder, Encoder, FramedRead, FramedWrite, LengthDelimitedCodec},
    io::ReaderStream,
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type used on both sides of the bridge.
pub type Body = UnsyncBoxBody<Bytes, BoxError>;

const TAG_SET_HEADER: u8 = 1;
const TAG_WRITE_STATUS: u8 = 2;
const TAG_BODY: u8 = 3;

/// Largest payload carried by one `Body` op.
pub const MAX_BODY_CHUNK: usize = 64 * 1024;

pub fn empty() -> Body {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn full(bytes: impl Into<Bytes>) -> Body {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Streams everything read from `reader` as a request or response body.
pub fn body_from_reader<R>(reader: R) -> Body
where
    R: AsyncRead + Send + 'static,
{
    let frames = ReaderStream::new(reader)
        .map_ok(Frame::data)
        .map_err(|err| Box::new(err) as BoxError);
    BodyExt::boxed_unsync(StreamBody::new(frames))
}

/// Writes every data frame of `body` to `writer`, then shuts the writer down.
/// Returns the number of body bytes copied.
pub async fn copy_body<B, W>(mut body: B, writer: &mut W) -> Result<u64, BoxError>
where
    B: HttpBody<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(Into::<BoxError>::into)?;
        if let Ok(data) = frame.into_data() {
            writer.write_all(&data).await?;
            copied += data.len() as u64;
        }
    }
    writer.shutdown().await?;
    Ok(copied)
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("empty response op")]
    Empty,
    #[error("unknown response op tag {0}")]
    UnknownTag(u8),
    #[error("truncated response op")]
    Truncated,
    #[error("invalid header: {0}")]
    InvalidHeader(String),
}

/// One instruction on the response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOp {
    /// The value is carried as raw bytes; it need not be UTF-8.
    SetHeader { name: String, value: Bytes },
    WriteStatus(u16),
    Body(Bytes),
}

/// Length-delimited framing for [`ResponseOp`]s.
#[derive(Debug, Default)]
pub struct ResponseOpCodec {
    frames: LengthDelimitedCodec,
}

impl ResponseOpCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for ResponseOpCodec {
    type Item = ResponseOp;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(mut frame) = self.frames.decode(src)? else {
            return Ok(None);
        };
        if frame.is_empty() {
            return Err(CodecError::Empty);
        }
        let op = match frame.get_u8() {
            TAG_SET_HEADER => {
                if frame.len() < 2 {
                    return Err(CodecError::Truncated);
                }
                let name_len = frame.get_u16() as usize;
                if frame.len() < name_len {
                    return Err(CodecError::Truncated);
                }
                let name = frame.split_to(name_len);
                ResponseOp::SetHeader {
                    name: utf8(&name)?,
                    value: frame.freeze(),
                }
            }
            TAG_WRITE_STATUS => {
                if frame.len() < 2 {
                    return Err(CodecError::Truncated);
                }
                ResponseOp::WriteStatus(frame.get_u16())
            }
            TAG_BODY => ResponseOp::Body(frame.freeze()),
            other => return Err(CodecError::UnknownTag(other)),
        };
        Ok(Some(op))
    }
}

fn utf8(raw: &[u8]) -> Result<String, CodecError> {
    std::str::from_utf8(raw)
        .map(str::to_string)
        .map_err(|err| CodecError::InvalidHeader(err.to_string()))
}

impl Encoder<ResponseOp> for ResponseOpCodec {
    type Error = CodecError;

    fn encode(&mut self, op: ResponseOp, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        match op {
            ResponseOp::SetHeader { name, value } => {
                let name_len = u16::try_from(name.len())
                    .map_err(|_| CodecError::InvalidHeader(format!("header name too long: {}", name.len())))?;
                payload.reserve(3 + name.len() + value.len());
                payload.put_u8(TAG_SET_HEADER);
                payload.put_u16(name_len);
                payload.put_slice(name.as_bytes());
                payload.put_slice(&value);
            }
            ResponseOp::WriteStatus(code) => {
                payload.put_u8(TAG_WRITE_STATUS);
                payload.put_u16(code);
            }
            ResponseOp::Body(chunk) => {
                payload.reserve(1 + chunk.len());
                payload.put_u8(TAG_BODY);
                payload.put_slice(&chunk);
            }
        }
        self.frames.encode(payload.freeze(), dst)?;
        Ok(())
    }
}

/// Decodes the ops a plugin sends on a response stream.
pub fn response_ops<T: AsyncRead>(io: T) -> FramedRead<T, ResponseOpCodec> {
    FramedRead::new(io, ResponseOpCodec::new())
}

/// Plugin-side handle for the response stream of one `ServeHTTP` call.
pub struct ResponseWriter<T> {
    frames: FramedWrite<T, ResponseOpCodec>,
    status: Option<StatusCode>,
}

impl<T: AsyncWrite + Unpin> ResponseWriter<T> {
    pub fn new(io: T) -> Self {
        Self {
            frames: FramedWrite::new(io, ResponseOpCodec::new()),
            status: None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Headers set after the status are dropped by the host.
    pub async fn set_header(&mut self, name: &HeaderName, value: &HeaderValue) -> Result<(), CodecError> {
        self.frames
            .send(ResponseOp::SetHeader {
                name: name.as_str().to_string(),
                value: Bytes::copy_from_slice(value.as_bytes()),
            })
            .await
    }

    pub async fn write_status(&mut self, status: StatusCode) -> Result<(), CodecError> {
        if let Some(sent) = self.status {
            tracing::debug!(%sent, ignored = %status, "status already written");
            return Ok(());
        }
        self.status = Some(status);
        self.frames.send(ResponseOp::WriteStatus(status.as_u16())).await
    }

    /// The first body write without a status implies `200 OK`.
    pub async fn write_body(&mut self, mut chunk: Bytes) -> Result<(), CodecError> {
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        while !chunk.is_empty() {
            let part = chunk.split_to(chunk.len().min(MAX_BODY_CHUNK));
            self.frames.feed(ResponseOp::Body(part)).await?;
        }
        self.frames.flush().await
    }

    /// Sends headers, status and every body frame of `response`.
    pub async fn send<B>(&mut self, response: Response<B>) -> Result<(), BoxError>
    where
        B: HttpBody<Data = Bytes> + Unpin,
        B::Error: Into<BoxError>,
    {
        let (parts, mut body) = response.into_parts();
        for (name, value) in &parts.headers {
            self.set_header(name, value).await?;
        }
        self.write_status(parts.status).await?;
        while let Some(frame) = body.frame().await {
            if let Ok(data) = frame.map_err(Into::<BoxError>::into)?.into_data() {
                self.write_body(data).await?;
            }
        }
        Ok(())
    }

    /// Gives back the stream, dropping anything not yet flushed.
    pub fn into_inner(self) -> T {
        self.frames.into_inner()
    }

    /// Flushes and closes the stream; the host sees end of response.
    pub async fn close(mut self) -> Result<(), CodecError> {
        self.frames.close().await
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio::io::{duplex, AsyncReadExt};

    use super::*;

    #[tokio::test]
    async fn ops_arrive_in_order() {
        let (plugin, host) = duplex(1024);
        let mut writer = ResponseWriter::new(plugin);
        let mut ops = response_ops(host);

        writer
            .set_header(&HeaderName::from_static("x-one"), &HeaderValue::from_static("1"))
            .await
            .unwrap();
        writer.write_status(StatusCode::CREATED).await.unwrap();
        writer.write_body(Bytes::from_static(b"hi")).await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(
            ops.next().await.unwrap().unwrap(),
            ResponseOp::SetHeader {
                name: "x-one".into(),
                value: Bytes::from_static(b"1")
            }
        );
        assert_eq!(ops.next().await.unwrap().unwrap(), ResponseOp::WriteStatus(201));
        assert_eq!(
            ops.next().await.unwrap().unwrap(),
            ResponseOp::Body(Bytes::from_static(b"hi"))
        );
        assert!(ops.next().await.is_none());
    }

    #[tokio::test]
    async fn second_status_is_not_sent() {
        let (plugin, host) = duplex(1024);
        let mut writer = ResponseWriter::new(plugin);
        writer.write_status(StatusCode::ACCEPTED).await.unwrap();
        writer.write_status(StatusCode::NOT_FOUND).await.unwrap();
        assert_eq!(writer.status(), Some(StatusCode::ACCEPTED));
        writer.close().await.unwrap();

        let ops: Vec<_> = response_ops(host).collect().await;
        assert_eq!(ops.len(), 1);
    }

    #[tokio::test]
    async fn large_bodies_are_split() {
        let (plugin, host) = duplex(256 * 1024);
        let reader = tokio::spawn(async move {
            let mut sizes = Vec::new();
            let mut ops = response_ops(host);
            while let Some(op) = ops.next().await {
                if let ResponseOp::Body(chunk) = op.unwrap() {
                    sizes.push(chunk.len());
                }
            }
            sizes
        });
        let mut writer = ResponseWriter::new(plugin);
        writer
            .write_body(Bytes::from(vec![7u8; MAX_BODY_CHUNK * 2 + 10]))
            .await
            .unwrap();
        assert_eq!(writer.status(), Some(StatusCode::OK));
        writer.close().await.unwrap();
        assert_eq!(reader.await.unwrap(), vec![MAX_BODY_CHUNK, MAX_BODY_CHUNK, 10]);
    }

    #[test]
    fn malformed_ops_are_rejected() {
        let mut codec = ResponseOpCodec::new();
        let mut buf = BytesMut::new();
        LengthDelimitedCodec::new()
            .encode(Bytes::from_static(&[9, 0]), &mut buf)
            .unwrap();
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::UnknownTag(9))));

        let mut buf = BytesMut::new();
        LengthDelimitedCodec::new()
            .encode(Bytes::from_static(&[TAG_SET_HEADER, 0, 10, b'a']), &mut buf)
            .unwrap();
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::Truncated)));
    }

    #[tokio::test]
    async fn body_copies_through_reader() {
        let (mut tx, rx) = duplex(64);
        let copier = tokio::spawn(async move {
            copy_body(full(Bytes::from(vec![1u8; 1000])), &mut tx).await.unwrap()
        });
        let body = body_from_reader(rx);
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(copier.await.unwrap(), 1000);
        assert_eq!(collected.len(), 1000);
    }

    #[tokio::test]
    async fn empty_body_shuts_writer() {
        let (mut tx, mut rx) = duplex(64);
        assert_eq!(copy_body(empty(), &mut tx).await.unwrap(), 0);
        let mut buf = Vec::new();
        assert_eq!(rx.read_to_end(&mut buf).await.unwrap(), 0);
    }
}
