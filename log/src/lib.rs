//! Tracing setup. Log lines are handed to a writer thread over a
//! bounded channel so the hot media paths never block on stderr.

use std::io::Write;
use std::thread;

use crossbeam_channel::{self, RecvError, Sender};
use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

const LOG_CHANNEL_CAPACITY: usize = 1000;

#[derive(Clone)]
pub struct LogWriter {
    sender: Sender<Vec<u8>>,
}

impl Default for LogWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl LogWriter {
    pub fn new() -> Self {
        let (sender, receiver) =
            crossbeam_channel::bounded(LOG_CHANNEL_CAPACITY);
        thread::spawn(move || -> Result<(), RecvError> {
            let mut stderr = std::io::stderr();
            loop {
                let data: Vec<u8> = receiver.recv()?;
                let _ = stderr.write_all(&data);
            }
        });
        Self { sender }
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // drop the line rather than stall the caller on a full channel
        let _ = self.sender.try_send(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Install the global subscriber. `RUST_LOG` filters as usual and
/// defaults to `info`.
pub fn init() {
    let writer = LogWriter::new();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(move || writer.clone()),
        )
        .init();
}
