//! Integration tests for chunk delivery, cancellation and the async stream

mod helpers;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use futures::StreamExt;
use helpers::{dongle, generate_sine_wave_cu8, numbered_buffers, open_session};
use rtlsdr_session::{Error, Operation, SessionState, StreamChunk, StreamConfig};

#[test]
fn test_chunks_concatenate_in_driver_order() {
    let buffers = numbered_buffers(8, 256);
    let expected: Vec<u8> = buffers.concat();
    let (_driver, session) = open_session(dongle("1").with_buffers(buffers));

    let mut received = Vec::new();
    let mut sequences = Vec::new();
    session
        .start(|chunk: StreamChunk| {
            sequences.push(chunk.sequence());
            received.extend_from_slice(chunk.as_bytes());
        })
        .unwrap();

    assert_eq!(received, expected);
    assert_eq!(sequences, (0..8).collect::<Vec<u64>>());
}

#[test]
fn test_one_chunk_per_driver_buffer() {
    let (_driver, session) = open_session(dongle("1").with_buffers(vec![
        vec![1; 16384],
        vec![2; 512],
        vec![3; 16384],
    ]));

    let mut lengths = Vec::new();
    session
        .start(|chunk: StreamChunk| lengths.push(chunk.len()))
        .unwrap();
    assert_eq!(lengths, vec![16384, 512, 16384]);
}

#[test]
fn test_stop_after_third_chunk_delivers_exactly_three() {
    let (_driver, session) = open_session(dongle("1").with_buffers(numbered_buffers(5, 16384)));
    let stopper = session.stopper();

    let mut received: Vec<StreamChunk> = Vec::new();
    session
        .start(|chunk: StreamChunk| {
            received.push(chunk);
            if received.len() == 3 {
                stopper.stop();
            }
        })
        .unwrap();

    assert_eq!(received.len(), 3);
    for (n, chunk) in received.iter().enumerate() {
        assert_eq!(chunk.len(), 16384);
        assert!(chunk.as_bytes().iter().all(|&b| b == n as u8));
    }
    assert_eq!(session.state(), SessionState::Open);
}

#[test]
fn test_no_chunks_after_stop() {
    let (_driver, session) = open_session(dongle("1").with_buffers(numbered_buffers(10, 64)));
    let session = Arc::new(session);
    let inner = Arc::clone(&session);

    let log = Mutex::new(Vec::new());
    session
        .start(|chunk: StreamChunk| {
            log.lock().unwrap().push(chunk.sequence());
            if chunk.sequence() == 4 {
                inner.stop().unwrap();
            }
        })
        .unwrap();

    assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_restart_after_stop_numbers_from_zero() {
    let (driver, session) = open_session(dongle("1").with_buffers(numbered_buffers(3, 32)));

    for _ in 0..2 {
        let mut sequences = Vec::new();
        session
            .start(|chunk: StreamChunk| sequences.push(chunk.sequence()))
            .unwrap();
        assert_eq!(sequences, vec![0, 1, 2]);
    }
    assert_eq!(driver.resets(), 2);
}

#[test]
fn test_chunk_iq_samples_from_sine() {
    let (_driver, session) = open_session(
        dongle("1").with_buffers(vec![generate_sine_wave_cu8(1000.0, 96000, 64)]),
    );

    let mut samples = Vec::new();
    session
        .start(|chunk: StreamChunk| samples.extend(chunk.iq_samples()))
        .unwrap();

    assert_eq!(samples.len(), 64);
    for s in &samples {
        assert!(s.norm() < 1.5, "Sample magnitude out of range: {}", s.norm());
    }
}

#[test]
fn test_stream_delivers_all_chunks_in_order() {
    let (_driver, session) = open_session(dongle("1").with_buffers(numbered_buffers(6, 128)));
    let mut stream = session.stream(&StreamConfig::new(2, 128)).unwrap();

    let mut payload = Vec::new();
    while let Some(item) = stream.next_blocking() {
        payload.push(item.unwrap().into_bytes()[0]);
    }
    assert_eq!(payload, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(session.state(), SessionState::Open);
}

#[test]
fn test_stream_reports_read_failure_as_last_item() {
    let (_driver, session) = open_session(
        dongle("1")
            .with_buffers(numbered_buffers(2, 32))
            .fail_read(-1),
    );
    let mut stream = session.stream(&StreamConfig::default()).unwrap();

    assert!(stream.next_blocking().unwrap().is_ok());
    assert!(stream.next_blocking().unwrap().is_ok());
    assert_eq!(
        stream.next_blocking().unwrap().unwrap_err(),
        Error::Driver {
            operation: Operation::ReadAsync,
            device: Some(0),
            code: -1
        }
    );
    assert!(stream.next_blocking().is_none());
}

#[test]
fn test_dropping_stream_cancels_read_loop() {
    let (driver, session) = open_session(dongle("1").with_buffers(numbered_buffers(50, 64)));
    let mut stream = session.stream(&StreamConfig::new(1, 64)).unwrap();

    let first = stream.next_blocking().unwrap().unwrap();
    assert_eq!(first.sequence(), 0);
    drop(stream);

    // The worker notices the closed channel at its next delivery.
    while session.state() == SessionState::Streaming {
        std::thread::yield_now();
    }
    assert_eq!(session.state(), SessionState::Open);
    assert!(driver.cancels() >= 1);

    // the device can stream again
    let mut count = 0;
    session.start(|_: StreamChunk| count += 1).unwrap();
    assert_eq!(count, 50);
}

#[tokio::test]
async fn test_stream_as_async_stream() {
    let (_driver, session) = open_session(dongle("1").with_buffers(numbered_buffers(4, 1024)));
    let stream = session.stream(&StreamConfig::new(4, 1024)).unwrap();

    let chunks: Vec<StreamChunk> = stream
        .map(|item| item.expect("Stream should not fail"))
        .collect()
        .await;

    assert_eq!(chunks.len(), 4);
    for (n, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.sequence(), n as u64);
        assert_eq!(chunk.as_bytes()[0], n as u8);
    }
}

#[tokio::test]
async fn test_async_consumer_can_stop() {
    let (_driver, session) = open_session(dongle("1").stream_until_cancelled().with_buffers(
        numbered_buffers(3, 64),
    ));
    let mut stream = session.stream(&StreamConfig::new(8, 64)).unwrap();

    let mut received = 0;
    while let Some(item) = stream.next().await {
        item.unwrap();
        received += 1;
        if received == 3 {
            session.stop().unwrap();
        }
    }
    assert_eq!(received, 3);
}

#[test]
fn test_stop_drops_chunks_queued_in_stream() {
    let (_driver, session) = open_session(
        dongle("1")
            .with_buffers(numbered_buffers(20, 64))
            .stream_until_cancelled(),
    );
    let mut stream = session.stream(&StreamConfig::new(8, 64)).unwrap();

    for n in 0..3 {
        let chunk = stream.next_blocking().unwrap().unwrap();
        assert_eq!(chunk.sequence(), n);
    }
    // Let the worker fill the channel and block on the next send.
    thread::sleep(Duration::from_millis(50));
    session.stop().unwrap();

    assert!(stream.next_blocking().is_none());
    assert_eq!(session.state(), SessionState::Open);
}

#[tokio::test]
async fn test_async_stop_drops_queued_chunks() {
    let (_driver, session) = open_session(
        dongle("1")
            .with_buffers(numbered_buffers(20, 64))
            .stream_until_cancelled(),
    );
    let mut stream = session.stream(&StreamConfig::new(4, 64)).unwrap();

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.sequence(), 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.stop().unwrap();

    assert!(stream.next().await.is_none());
}

#[test]
fn test_zero_length_buffers_are_rejected() {
    let (driver, session) = open_session(dongle("1").with_buffers(numbered_buffers(2, 16)));

    let mut received = 0;
    let err = session
        .start_with(|_: StreamChunk| received += 1, &StreamConfig::new(4, 0))
        .unwrap_err();
    assert_eq!(
        err,
        Error::Driver {
            operation: Operation::ReadAsync,
            device: Some(0),
            code: -2
        }
    );
    assert_eq!(received, 0);
    assert_eq!(session.state(), SessionState::Open);
    assert_eq!(driver.closes(), 0);
}
