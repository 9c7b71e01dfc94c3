//! Simulated brick on the far end of an in-memory duplex stream

#![allow(dead_code)]

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const STATUS_OK: u8 = 0x02;
pub const STATUS_ERROR: u8 = 0x04;

/// A request as the brick sees it
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub counter: u16,
    pub expects_reply: bool,
    pub global_size: usize,
    /// Encoded parameters following the allocation word
    pub params: Vec<u8>,
    /// The raw bytes as written
    pub raw: Vec<u8>,
}

/// Read one request, or `None` once the host closed its side
pub async fn read_request(stream: &mut DuplexStream) -> Option<Request> {
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await.ok()?;
    let len = u16::from_le_bytes(len) as usize;

    let mut rest = vec![0u8; len];
    stream.read_exact(&mut rest).await.ok()?;

    let counter = u16::from_le_bytes([rest[0], rest[1]]);
    let alloc = u16::from_le_bytes([rest[3], rest[4]]);

    let mut raw = (len as u16).to_le_bytes().to_vec();
    raw.extend_from_slice(&rest);

    Some(Request {
        counter,
        expects_reply: rest[2] == 0x00,
        global_size: (alloc & 0x3FF) as usize,
        params: rest[5..].to_vec(),
        raw,
    })
}

/// Encode a reply frame
pub fn reply(counter: u16, status: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = ((payload.len() + 3) as u16).to_le_bytes().to_vec();
    out.extend_from_slice(&counter.to_le_bytes());
    out.push(status);
    out.extend_from_slice(payload);
    out
}

/// Zero-padded string field of `width` bytes
pub fn string_field(text: &str, width: usize) -> Vec<u8> {
    let mut out = text.as_bytes().to_vec();
    out.resize(width, 0);
    out
}

/// Answer every request with `handler` until the host hangs up
///
/// The handler returns the status and payload; requests sent without a
/// reply flag are still passed to it but never answered.
pub async fn serve<F>(mut stream: DuplexStream, mut handler: F) -> Vec<Request>
where
    F: FnMut(&Request) -> (u8, Vec<u8>),
{
    let mut seen = Vec::new();
    while let Some(request) = read_request(&mut stream).await {
        let (status, payload) = handler(&request);
        if request.expects_reply {
            let frame = reply(request.counter, status, &payload);
            if stream.write_all(&frame).await.is_err() {
                break;
            }
        }
        seen.push(request);
    }
    seen
}
