use std::io::{self, Read, Write};

/// Mirrors every byte read from `inner` into `sink` before handing it on.
///
/// A failed sink write fails the read. The original sink error is kept so the
/// caller can tell a capture failure apart from a source failure once the
/// consumer has given up.
pub struct TeeReader<R, W> {
    inner: R,
    sink: W,
    copied: u64,
    sink_error: Option<io::Error>,
}

impl<R: Read, W: Write> TeeReader<R, W> {
    pub fn new(inner: R, sink: W) -> Self {
        Self {
            inner,
            sink,
            copied: 0,
            sink_error: None,
        }
    }

    /// Bytes mirrored to the sink so far.
    pub fn copied(&self) -> u64 {
        self.copied
    }

    pub fn take_sink_error(&mut self) -> Option<io::Error> {
        self.sink_error.take()
    }

    pub fn into_parts(self) -> (R, W) {
        (self.inner, self.sink)
    }
}

impl<R: Read, W: Write> Read for TeeReader<R, W> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            return Ok(0);
        }
        if let Err(err) = self.sink.write_all(&buf[..n]) {
            let kind = err.kind();
            let message = format!("mirroring {n} bytes to capture sink: {err}");
            self.sink_error = Some(err);
            return Err(io::Error::new(kind, message));
        }
        self.copied += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    impl Write for FailingSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only capture"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn reads_are_mirrored_to_sink() {
        let mut tee = TeeReader::new(&b"{\"a\":1}"[..], Vec::new());
        let mut out = String::new();
        tee.read_to_string(&mut out).unwrap();
        assert_eq!(out, "{\"a\":1}");
        assert_eq!(tee.copied(), 7);
        let (_, sink) = tee.into_parts();
        assert_eq!(sink, b"{\"a\":1}");
    }

    #[test]
    fn sink_failure_surfaces_as_read_failure() {
        let mut tee = TeeReader::new(&b"payload"[..], FailingSink);
        let mut out = Vec::new();
        let err = tee.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert!(tee.take_sink_error().is_some());
        assert_eq!(tee.copied(), 0);
    }

    #[test]
    fn decoder_failure_keeps_partial_capture() {
        let mut tee = TeeReader::new(&b"{\"signature\":{\"version\":"[..], Vec::new());
        let result: Result<serde_json::Value, _> = serde_json::from_reader(&mut tee);
        assert!(result.is_err());
        assert!(tee.take_sink_error().is_none());
        let (_, sink) = tee.into_parts();
        assert_eq!(sink, b"{\"signature\":{\"version\":");
    }
}
