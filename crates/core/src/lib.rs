//! Fan-out and arbitration engine for a single `rtl_tcp` dongle.
//!
//! §9 blesses a task-per-connection runtime as equivalent to the original's
//! single readiness loop, provided per-session queues stay bounded and
//! `broadcast` fans out under one lock. [`run`] is the resulting event loop:
//! it owns no sockets itself, only the tasks that do.

pub mod command;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod ip_filter;
pub mod listener;
pub mod privilege;
pub mod session;
pub mod upstream;
pub mod watchdog;

use std::sync::Arc;

use config::Config;
use engine::Engine;
use ip_filter::IpAccessFilter;
use upstream::SampleSink;

/// Boots every long-lived task (listener, upstream link, optional DSP
/// sidecar, optional watchdog) and runs until the listener fails or the
/// process is killed (§4.7).
pub async fn run(config: Config) -> std::io::Result<()> {
    privilege::drop_if_configured(config.setuid_on_start, config.uid)?;

    let ip_filter = IpAccessFilter::from_config(&config)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
    let use_dsp = config.use_dsp_command;
    let watchdog_interval = config.watchdog_interval;
    let engine = Engine::new(config, ip_filter);

    let sample_sink = if use_dsp {
        let dsp = dsp::spawn(Arc::clone(&engine))?;
        SampleSink::Dsp(dsp.input_tx)
    } else {
        SampleSink::Broadcast(Arc::clone(&engine))
    };

    tokio::spawn(upstream::run(Arc::clone(&engine), sample_sink));

    if watchdog_interval != 0 {
        tokio::spawn(watchdog::run(Arc::clone(&engine)));
    }

    listener::serve(engine).await
}
