//! SIGINT stops the proxy and the scheduler the same way `trawl` does.
//!
//! Kept in its own test binary: a signal handler can be installed only once
//! per process.

#![cfg(unix)]

use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use trawl_core::pipeline::spawn;
use trawl_core::{
    CaptureSettings, DocumentArchive, HtmlDistiller, MemoryIndex, Pipeline, ProxyContext,
    ProxyServer, QueueDirectory, SchedulerSettings, SequenceCounter, Shutdown,
};

#[test]
fn interrupt_stops_proxy_and_scheduler() {
    let dir = TempDir::new().unwrap();
    let counter = Arc::new(SequenceCounter::new(
        QueueDirectory::open(dir.path().join("logs")).unwrap(),
    ));
    let archive = DocumentArchive::open(dir.path().join("archive")).unwrap();

    let shutdown = Shutdown::new();
    shutdown.trigger_on_signal().unwrap();
    assert!(shutdown.trigger_on_signal().is_err());

    let pipeline = Pipeline::new(
        counter.clone(),
        Box::new(HtmlDistiller::default()),
        Box::new(MemoryIndex::new()),
        archive,
        SchedulerSettings {
            poll: Duration::from_secs(3600),
            ..SchedulerSettings::default()
        },
    );
    let scheduler = spawn(pipeline, shutdown.clone()).unwrap();
    let capture = CaptureSettings {
        max_request_bytes: 64 * 1024,
        max_body_bytes: 1024 * 1024,
        debug_mlog: false,
    };
    let server = ProxyServer::bind("127.0.0.1:0", ProxyContext::new(counter, capture), 2, shutdown.clone())
        .unwrap()
        .spawn()
        .unwrap();

    let status = Command::new("kill")
        .args(["-INT", &std::process::id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    let deadline = Instant::now() + Duration::from_secs(10);
    while !shutdown.is_triggered() {
        assert!(Instant::now() < deadline, "signal never reached the handler");
        thread::sleep(Duration::from_millis(10));
    }

    server.join().unwrap().unwrap();
    scheduler.join().unwrap();
}
