// File: race_integration_tests.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2023-2025
// - Volker Schwaberow <volker@schwaberow.de>

mod common;

use common::FixtureServer;
use rrace::config::RaceConfig;
use rrace::driver::Driver;
use rrace::error::RaceErrorKind;
use rrace::request::RaceRequest;
use rrace::worker::WorkItem;
use serial_test::serial;
use std::time::Duration;

fn fast_config() -> RaceConfig {
    RaceConfig {
        release_delay: Duration::from_millis(10),
        ..RaceConfig::default()
    }
}

#[tokio::test]
#[serial]
async fn test_basic_race_three_workers() {
    let server = FixtureServer::start().await;

    let config = RaceConfig {
        tail_bytes: 1,
        ..fast_config()
    };
    let driver = Driver::new(config).unwrap();
    let request = RaceRequest::get(&server.url("/")).unwrap();

    let result = driver.process(request, 3).await.unwrap();

    assert!(result.is_ok());
    assert_eq!(result.workers.len(), 3);
    for worker in &result.workers {
        let responses: Vec<_> = worker.responses().collect();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status, 200);
        assert_eq!(responses[0].body, b"hello");
    }

    let logs = server.logs();
    assert_eq!(logs.len(), 3);
    for log in &logs {
        assert!(log.request_text().starts_with("GET / HTTP/1.1\r\n"));
    }
    // All three frames must complete nearly simultaneously on loopback.
    assert!(
        server.completion_spread() < Duration::from_millis(500),
        "arrival spread too wide: {:?}",
        server.completion_spread()
    );
}

#[tokio::test]
#[serial]
async fn test_eval_substitution_per_worker() {
    let server = FixtureServer::start().await;

    let config = RaceConfig {
        do_eval: true,
        ..fast_config()
    };
    let driver = Driver::new(config).unwrap();
    let request = RaceRequest::post(
        &server.url("/echo"),
        "{\"t\": \"<<<self.thread_num>>>\"}",
    )
    .unwrap();

    let result = driver.process(request, 4).await.unwrap();

    assert!(result.is_ok());
    for worker in &result.workers {
        let responses: Vec<_> = worker.responses().collect();
        assert_eq!(responses.len(), 1);
        let expected = format!("{{\"t\": \"{}\"}}", worker.thread_num);
        assert_eq!(responses[0].body_text(), expected);
    }
}

#[tokio::test]
#[serial]
async fn test_callback_appends_work() {
    let server = FixtureServer::start().await;

    let driver = Driver::new(fast_config()).unwrap();
    let url = server.url("/");
    let work = vec![WorkItem::callback(move |worker| {
        let request = RaceRequest::get(&url)?;
        worker.work_queue.push_back(WorkItem::Request(request));
        Ok(())
    })];

    let result = driver.process(work, 2).await.unwrap();

    assert!(result.is_ok());
    for worker in &result.workers {
        let responses: Vec<_> = worker.responses().collect();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status, 200);
    }
    assert_eq!(server.logs().len(), 2);
}

#[tokio::test]
#[serial]
async fn test_cookie_persistence_across_positions() {
    let server = FixtureServer::start().await;

    let driver = Driver::new(fast_config()).unwrap();
    let work = vec![
        WorkItem::Request(RaceRequest::get(&server.url("/set-cookie?k=1")).unwrap()),
        WorkItem::Request(RaceRequest::get(&server.url("/echo-cookie")).unwrap()),
    ];

    let result = driver.process(work, 3).await.unwrap();

    assert!(result.is_ok());
    for worker in &result.workers {
        let responses: Vec<_> = worker.responses().collect();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[1].body_text(), "k=1");
    }
}

#[tokio::test]
#[serial]
async fn test_barrier_timeout_aborts_run() {
    let server = FixtureServer::start_hanging_first().await;

    let config = RaceConfig {
        barrier_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_secs(30),
        ..fast_config()
    };
    let driver = Driver::new(config).unwrap();
    let request = RaceRequest::get(&server.url("/hang")).unwrap();

    let result = driver.process(request, 2).await.unwrap();

    let error = result.error.expect("run should report a global error");
    assert_eq!(error.kind, RaceErrorKind::BarrierTimeout);
    assert_eq!(result.workers.len(), 2);
}

#[tokio::test]
#[serial]
async fn test_single_worker_runs_are_deterministic() {
    let server = FixtureServer::start().await;

    let driver = Driver::new(fast_config()).unwrap();
    let request = RaceRequest::post(&server.url("/echo"), "payload=1").unwrap();
    let single_shot = request.serialize(false).unwrap();

    let first = driver.process(request.clone(), 1).await.unwrap();
    assert!(first.is_ok());
    let second = driver.process(request, 1).await.unwrap();
    assert!(second.is_ok());

    let logs = server.logs();
    assert_eq!(logs.len(), 2);
    // Withholding must not change the bytes on the wire, and two sequential
    // single-worker runs must be byte-identical.
    assert_eq!(logs[0].request, single_shot);
    assert_eq!(logs[1].request, single_shot);
}

#[tokio::test]
#[serial]
async fn test_failed_connect_is_per_worker() {
    // Nothing listens on this port; every worker records a transport
    // failure and the run itself still completes.
    let driver = Driver::new(fast_config()).unwrap();
    let request = RaceRequest::get("http://127.0.0.1:9/").unwrap();

    let result = driver.process(request, 2).await.unwrap();

    assert!(result.is_ok());
    for worker in &result.workers {
        let failures: Vec<_> = worker.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, RaceErrorKind::TransportFailure);
    }
}
