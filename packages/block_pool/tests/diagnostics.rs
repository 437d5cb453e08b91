//! Verifies the `tracing` events a pool emits depending on its diagnostics setting.
#![allow(missing_docs, reason = "No need for API documentation in test code")]

use std::io;
use std::num::NonZero;
use std::sync::{Arc, Mutex, PoisonError};

use block_pool::{BlockPool, Diagnostics};
use tracing::Level;

/// Collects formatted log output in memory.
#[derive(Clone, Debug, Default)]
struct CapturedOutput {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedOutput {
    fn contents(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl io::Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn nz(value: usize) -> NonZero<usize> {
    NonZero::new(value).unwrap()
}

/// Runs a short allocate/deallocate session against a pool with the given setting and returns
/// everything that was logged.
fn capture_session(diagnostics: Diagnostics) -> String {
    let output = CapturedOutput::default();
    let writer = output.clone();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::TRACE)
        .with_writer(move || writer.clone())
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let mut pool = BlockPool::<u64>::builder()
            .chunks_per_block(nz(2))
            .max_blocks(nz(1))
            .diagnostics(diagnostics)
            .build();

        let a = pool.allocate(1).unwrap();
        let b = pool.allocate(2).unwrap();
        assert!(pool.allocate(3).is_err());

        pool.deallocate(b);
        pool.deallocate(a);
    });

    output.contents()
}

#[test]
fn verbose_pool_traces_its_lifecycle() {
    let log = capture_session(Diagnostics::Verbose);

    assert!(log.contains("reserved block registry"), "{log}");
    assert!(log.contains("allocated block"), "{log}");
    assert!(log.contains("allocated chunk"), "{log}");
    assert!(log.contains("pool exhausted"), "{log}");
    assert!(log.contains("deallocated chunk"), "{log}");
    assert!(log.contains("released block"), "{log}");

    assert_eq!(log.matches(": allocated chunk").count(), 2, "{log}");
    assert_eq!(log.matches(": deallocated chunk").count(), 2, "{log}");
}

#[test]
fn silent_pool_emits_nothing() {
    let log = capture_session(Diagnostics::Silent);

    assert!(log.is_empty(), "{log}");
}
