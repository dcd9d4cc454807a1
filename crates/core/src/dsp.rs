//! Optional DSP subprocess sidecar (§4.5).
//!
//! Spawned once at startup when `use_dsp_command` is set. Two tasks run for
//! the life of the child: one drains a bounded input queue into its stdin,
//! the other reads its stdout in 1024-byte chunks and hands each one to
//! [`Engine::broadcast`] directly — while DSP is active it is the *only*
//! producer into `broadcast`, per §4.5.

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::engine::{Chunk, Engine, OUTBOUND_QUEUE_CAPACITY};

/// Size of each chunk read from the child's stdout (§4.5 "Reader").
const DSP_READ_CHUNK: usize = 1024;

/// The handle the Upstream Link writes raw samples into when DSP is
/// enabled.
pub struct DspHandle {
    pub input_tx: mpsc::Sender<Chunk>,
}

/// Forks the configured DSP command and wires its stdin/stdout to the
/// fan-out engine. `dsp_command` is tokenized by whitespace (§6).
pub fn spawn(engine: Arc<Engine>) -> io::Result<DspHandle> {
    let mut argv = engine.config.dsp_command.split_whitespace();
    let program = argv
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "dsp_command is empty"))?;

    let mut child = Command::new(program)
        .args(argv)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;

    let mut stdin = child.stdin.take().expect("stdin was piped");
    let mut stdout = child.stdout.take().expect("stdout was piped");

    let (input_tx, mut input_rx) = mpsc::channel::<Chunk>(OUTBOUND_QUEUE_CAPACITY);

    let original_data_count = Arc::new(AtomicU64::new(0));
    let dsp_data_count = Arc::new(AtomicU64::new(0));

    tokio::spawn({
        let original_data_count = Arc::clone(&original_data_count);
        async move {
            while let Some(chunk) = input_rx.recv().await {
                if stdin.write_all(&chunk).await.is_err() {
                    tracing::error!("dsp stdin write failed, stopping writer");
                    return;
                }
                if stdin.flush().await.is_err() {
                    tracing::error!("dsp stdin flush failed, stopping writer");
                    return;
                }
                original_data_count.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
        }
    });

    tokio::spawn({
        let dsp_data_count = Arc::clone(&dsp_data_count);
        async move {
            let mut buf = [0u8; DSP_READ_CHUNK];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => {
                        tracing::warn!("dsp stdout closed");
                        return;
                    }
                    Ok(n) => {
                        dsp_data_count.fetch_add(n as u64, Ordering::Relaxed);
                        engine.broadcast(Chunk::from(buf[..n].to_vec()));
                    }
                    Err(err) => {
                        tracing::error!(%err, "dsp stdout read error");
                        return;
                    }
                }
            }
        }
    });

    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => tracing::warn!(%status, "dsp subprocess exited"),
            Err(err) => tracing::error!(%err, "failed to wait on dsp subprocess"),
        }
    });

    if engine.config.debug_dsp_command {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                tracing::debug!(
                    original_bytes = original_data_count.swap(0, Ordering::Relaxed),
                    dsp_bytes = dsp_data_count.swap(0, Ordering::Relaxed),
                    "dsp throughput"
                );
            }
        });
    }

    Ok(DspHandle { input_tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::base_config;
    use crate::ip_filter::IpAccessFilter;

    #[test]
    fn empty_dsp_command_is_rejected() {
        let mut config = base_config();
        config.dsp_command = String::new();
        let ip_filter = IpAccessFilter::from_config(&config).unwrap();
        let engine = Engine::new(config, ip_filter);
        let err = spawn(engine).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
