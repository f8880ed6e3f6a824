use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use otaru_types::error::{OtaruError, Result};

/// Shared cancellation flag handed to background tasks.
#[derive(Clone, Default, Debug)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once [`CancelToken::cancel`] has been called.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(OtaruError::Cancelled);
        }
        Ok(())
    }
}

/// A reader that fails with `Cancelled` once its token fires.
///
/// The token is polled before every underlying read, so cancellation is
/// observed at the granularity of the caller's read size.
pub struct CancellableReader<R: Read> {
    inner: R,
    token: CancelToken,
}

impl<R: Read> CancellableReader<R> {
    pub fn new(inner: R, token: CancelToken) -> Self {
        Self { inner, token }
    }
}

impl<R: Read> Read for CancellableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.token.check().map_err(OtaruError::into_io)?;
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_until_cancelled() {
        let token = CancelToken::new();
        let data = vec![7u8; 64];
        let mut r = CancellableReader::new(data.as_slice(), token.clone());

        let mut buf = [0u8; 16];
        assert_eq!(r.read(&mut buf).unwrap(), 16);

        token.cancel();
        let err = OtaruError::from_io(r.read(&mut buf).unwrap_err());
        assert!(matches!(err, OtaruError::Cancelled));
    }

    #[test]
    fn check_reports_state() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.clone().cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check().unwrap_err(), OtaruError::Cancelled));
    }
}
