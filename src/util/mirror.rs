//! Header-mirroring stream wrapper for early routing decisions.

use std::{
    pin::Pin,
    task::{Context, Poll, ready},
};

use bytes::BytesMut;
use tokio::io::{self, AsyncRead, AsyncWrite, ReadBuf};

/// Cap on the mirrored prefix. Enough for a TLS ClientHello or an HTTP
/// request line plus headers; bounded so hostile input cannot grow it.
const MIRROR_CAP: usize = 1500;

/// Duplicates the first [`MIRROR_CAP`] bytes read from a connection into a
/// side buffer, so that SNI-style routing decisions can be made after the
/// bytes have already been consumed by a TLS or HTTP layer above.
pub(crate) struct MirrorConn<S> {
    inner: S,
    header: BytesMut,
}

impl<S> MirrorConn<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self {
            inner,
            header: BytesMut::with_capacity(MIRROR_CAP),
        }
    }

    /// The mirrored initial bytes captured so far.
    pub(crate) fn header(&self) -> &[u8] {
        &self.header
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MirrorConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = out.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, out))?;
        let fresh = &out.filled()[before..];
        if !fresh.is_empty() && this.header.len() < MIRROR_CAP {
            let room = MIRROR_CAP - this.header.len();
            this.header.extend_from_slice(&fresh[..fresh.len().min(room)]);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MirrorConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Extracts the SNI host name from a mirrored TLS ClientHello, if the
/// captured bytes begin with one.
pub(crate) fn sniff_client_hello_sni(buf: &[u8]) -> Option<String> {
    // record header: type 0x16 (handshake), version, length
    if buf.len() < 5 || buf[0] != 0x16 {
        return None;
    }
    let record = buf.get(5..5 + u16::from_be_bytes([buf[3], buf[4]]) as usize)?;
    // handshake header: type 0x01 (client hello), u24 length
    if record.len() < 4 || record[0] != 0x01 {
        return None;
    }
    let mut cursor = Cursor(record.get(4..)?);

    cursor.take(2)?; // client version
    cursor.take(32)?; // random
    let session_len = cursor.take(1)?[0] as usize;
    cursor.take(session_len)?;
    let ciphers_len = cursor.take_u16()? as usize;
    cursor.take(ciphers_len)?;
    let compression_len = cursor.take(1)?[0] as usize;
    cursor.take(compression_len)?;
    let extensions_len = cursor.take_u16()? as usize;
    let mut extensions = cursor.take(extensions_len)?;

    while extensions.len() >= 4 {
        let ext_type = u16::from_be_bytes([extensions[0], extensions[1]]);
        let ext_len = u16::from_be_bytes([extensions[2], extensions[3]]) as usize;
        let body = extensions.get(4..4 + ext_len)?;
        if ext_type == 0 {
            // server_name list: u16 list length, entry type 0 (host_name),
            // u16 name length, name
            if body.len() < 5 || body[2] != 0 {
                return None;
            }
            let name_len = u16::from_be_bytes([body[3], body[4]]) as usize;
            let name = body.get(5..5 + name_len)?;
            return String::from_utf8(name.to_vec()).ok();
        }
        extensions = extensions.get(4 + ext_len..)?;
    }
    None
}

struct Cursor<'a>(&'a [u8]);

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let head = self.0.get(..n)?;
        self.0 = &self.0[n..];
        Some(head)
    }

    fn take_u16(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::AsyncReadExt;

    use super::*;

    /// Builds a minimal ClientHello record carrying one SNI entry.
    fn client_hello_with_sni(name: &str) -> Vec<u8> {
        let mut ext = Vec::new();
        let sni_entry = {
            let mut e = Vec::new();
            e.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
            e.push(0); // host_name
            e.extend_from_slice(&(name.len() as u16).to_be_bytes());
            e.extend_from_slice(name.as_bytes());
            e
        };
        ext.extend_from_slice(&0u16.to_be_bytes()); // extension type 0
        ext.extend_from_slice(&(sni_entry.len() as u16).to_be_bytes());
        ext.extend_from_slice(&sni_entry);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&[0x13, 0x01]); // one cipher suite
        body.push(1);
        body.push(0); // null compression
        body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        body.extend_from_slice(&ext);

        let mut handshake = vec![0x01];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn sniffs_sni_from_client_hello() {
        let record = client_hello_with_sni("db.internal.test");
        assert_eq!(
            sniff_client_hello_sni(&record).as_deref(),
            Some("db.internal.test")
        );
        assert_eq!(sniff_client_hello_sni(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(sniff_client_hello_sni(&record[..10]), None);
    }

    #[tokio::test]
    async fn captures_initial_bytes() {
        let mut conn = MirrorConn::new(Cursor::new(b"abcdef".to_vec()));
        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcdef");
        assert_eq!(conn.header(), b"abcdef");
    }

    #[tokio::test]
    async fn capture_is_capped() {
        let data = vec![9u8; MIRROR_CAP * 3];
        let mut conn = MirrorConn::new(Cursor::new(data.clone()));
        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), data.len());
        assert_eq!(conn.header().len(), MIRROR_CAP);
    }
}
