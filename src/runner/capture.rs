//! Bounded capture of a child's output stream

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;

const CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    overflowed: bool,
}

/// Output of one stream, shared between the reader task and the runner so a
/// stream held open by an escaped process still yields what was read
#[derive(Debug, Clone, Default)]
pub(crate) struct Capture {
    inner: Arc<Mutex<Captured>>,
}

impl Capture {
    /// Read `reader` to EOF, keeping the first `limit` bytes
    ///
    /// Excess bytes are drained and dropped so the writer never blocks on a
    /// full pipe; `overflow` is notified once when the limit is first crossed.
    pub(crate) async fn read_from<R>(&self, mut reader: R, limit: usize, overflow: Arc<Notify>)
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };

            let newly_overflowed = {
                let mut captured = self.lock();
                let room = limit.saturating_sub(captured.bytes.len());
                captured.bytes.extend_from_slice(&chunk[..n.min(room)]);
                if n > room && !captured.overflowed {
                    captured.overflowed = true;
                    true
                } else {
                    false
                }
            };
            if newly_overflowed {
                overflow.notify_one();
            }
        }
    }

    pub(crate) fn overflowed(&self) -> bool {
        self.lock().overflowed
    }

    pub(crate) fn take(&self) -> Vec<u8> {
        std::mem::take(&mut self.lock().bytes)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Captured> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
