//! RESP2 encoder.
//!
//! Encodes reply frames and — via [`encode_command`] — the request framing
//! every store command uses: `*<argc>\r\n` followed by one
//! `$<len>\r\n<bytes>\r\n` per argument. The same framing doubles as the
//! bulk-load format accepted by `redis-cli --pipe`.

use bytes::{BufMut, BytesMut};

use super::Frame;

/// Encode a frame into the buffer.
pub fn encode_frame(frame: &Frame, buf: &mut BytesMut) {
    match frame {
        Frame::Simple(s) => {
            buf.put_u8(b'+');
            buf.put_slice(s);
            buf.put_slice(b"\r\n");
        }
        Frame::Error(s) => {
            buf.put_u8(b'-');
            buf.put_slice(s);
            buf.put_slice(b"\r\n");
        }
        Frame::Integer(n) => {
            buf.put_u8(b':');
            buf.put_slice(n.to_string().as_bytes());
            buf.put_slice(b"\r\n");
        }
        Frame::Bulk(None) => {
            buf.put_slice(b"$-1\r\n");
        }
        Frame::Bulk(Some(data)) => {
            buf.put_u8(b'$');
            buf.put_slice(data.len().to_string().as_bytes());
            buf.put_slice(b"\r\n");
            buf.put_slice(data);
            buf.put_slice(b"\r\n");
        }
        Frame::Array(None) => {
            buf.put_slice(b"*-1\r\n");
        }
        Frame::Array(Some(frames)) => {
            buf.put_u8(b'*');
            buf.put_slice(frames.len().to_string().as_bytes());
            buf.put_slice(b"\r\n");
            for frame in frames {
                encode_frame(frame, buf);
            }
        }
    }
}

/// Encode a command as an array of bulk strings into the buffer.
///
/// Arguments are taken as raw bytes; no escaping or interpretation happens
/// at this layer.
pub fn encode_command<A>(args: &[A], buf: &mut BytesMut)
where
    A: AsRef<[u8]>,
{
    buf.put_u8(b'*');
    buf.put_slice(args.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    for arg in args {
        let bytes = arg.as_ref();
        buf.put_u8(b'$');
        buf.put_slice(bytes.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(bytes);
        buf.put_slice(b"\r\n");
    }
}

/// Convenience function to encode a frame to a new BytesMut.
pub fn encode_to_bytes(frame: &Frame) -> BytesMut {
    let mut buf = BytesMut::new();
    encode_frame(frame, &mut buf);
    buf
}
