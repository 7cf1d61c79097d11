//! Streaming engine tests against the scripted transport

mod helpers;

use std::thread;
use std::time::{Duration, Instant};

use helpers::{blocks, mock_sdr, MockTransport, Scripted};
use rs_miri::convert::{convert, AddressTracker};
use rs_miri::transport::TransferStatus;
use rs_miri::{AsyncStatus, CancelOutcome, Error, SampleFormat, TransferKind};

const START: u8 = 0x43;
const STOP: u8 = 0x45;

fn wait_for(status: AsyncStatus, handle: &rs_miri::StreamHandle) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.status() != status {
        assert!(Instant::now() < deadline, "timed out waiting for {:?}", status);
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_bulk_session_delivers_every_transfer() {
    let script = (0..4).map(|n| Scripted::Bulk(blocks(n * 504, 1, 504)));
    let mut sdr = mock_sdr(MockTransport::with_script(script));
    let handle = sdr.handle();

    let mut chunks: Vec<Vec<u8>> = Vec::new();
    sdr.start_session(SampleFormat::S16_504, 4, 0, |data| {
        chunks.push(data.to_vec());
        if chunks.len() == 4 {
            handle.cancel().unwrap();
        }
    })
    .unwrap();

    assert_eq!(chunks.len(), 4);
    assert!(chunks.iter().all(|chunk| chunk.len() == 2016));

    // Payload byte 1 widened into the high byte.
    assert_eq!(i16::from_ne_bytes([chunks[0][2], chunks[0][3]]), 256);

    assert_eq!(sdr.expected_address(), 2016);
    assert_eq!(sdr.stats().loss_events, 0);
    assert_eq!(sdr.status(), AsyncStatus::Inactive);

    let transport = sdr.transport();
    assert_eq!(transport.control_requests, vec![START, STOP]);
    assert_eq!(transport.alt_settings, vec![3]);
    assert_eq!(transport.allocated, 4);
    assert_eq!(transport.freed, 4);
}

#[test]
fn test_short_transfer_is_not_delivered() {
    let script = [
        Scripted::Bulk(vec![0u8; 512]),
        Scripted::Bulk(Vec::new()),
        Scripted::Bulk(blocks(0, 1, 504)),
    ];
    let mut sdr = mock_sdr(MockTransport::with_script(script));
    let handle = sdr.handle();

    let mut sizes = Vec::new();
    sdr.start_session(SampleFormat::S16_504, 1, 0, |data| {
        sizes.push(data.len());
        handle.cancel().unwrap();
    })
    .unwrap();

    assert_eq!(sizes, vec![2016]);
    assert_eq!(sdr.stats().loss_events, 0);
}

#[test]
fn test_isochronous_session_skips_empty_packets() {
    let packets = vec![blocks(0, 1, 504), Vec::new(), blocks(504, 3, 504)];
    let mut sdr = mock_sdr(MockTransport::with_script([Scripted::Iso(packets)]));
    sdr.set_transfer_kind(TransferKind::Isochronous).unwrap();
    let handle = sdr.handle();

    let mut sizes = Vec::new();
    sdr.start_session(SampleFormat::S16_504, 1, 0, |data| {
        sizes.push(data.len());
        handle.cancel().unwrap();
    })
    .unwrap();

    assert_eq!(sizes, vec![4 * 2016]);
    assert_eq!(sdr.expected_address(), 2016);
    assert_eq!(sdr.stats().loss_events, 0);

    let transport = sdr.transport();
    assert_eq!(transport.alt_settings, vec![1]);
    assert_eq!(transport.submitted_lengths, vec![24576]);
}

#[test]
fn test_fixed_frames_span_transfers() {
    let raw: Vec<Vec<u8>> = vec![blocks(0, 2, 504), blocks(1008, 2, 504), blocks(2016, 2, 504)];

    let mut tracker = AddressTracker::new();
    let joined = raw.concat();
    let mut expected = vec![0u8; SampleFormat::S16_504.decoded_len(joined.len())];
    convert(SampleFormat::S16_504, &mut tracker, &joined, &mut expected);

    let mut sdr = mock_sdr(MockTransport::with_script(raw.into_iter().map(Scripted::Bulk)));
    let handle = sdr.handle();

    let mut frames: Vec<Vec<u8>> = Vec::new();
    sdr.start_session(SampleFormat::S16_504, 1, 4096, |frame| {
        frames.push(frame.to_vec());
        if frames.len() == 2 {
            handle.cancel().unwrap();
        }
    })
    .unwrap();

    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|frame| frame.len() == 4096));
    assert_eq!(frames.concat(), expected[..8192]);
}

#[test]
fn test_bulk_sync_loss_shortens_next_transfer() {
    let script = [1000, 5000, 9000, 9504].map(|address| Scripted::Bulk(blocks(address, 1, 504)));
    let mut sdr = mock_sdr(MockTransport::with_script(script));
    let handle = sdr.handle();

    let mut callbacks = 0;
    sdr.start_session(SampleFormat::S16_504, 2, 0, |_| {
        callbacks += 1;
        if callbacks == 4 {
            handle.cancel().unwrap();
        }
    })
    .unwrap();

    let stats = sdr.stats();
    assert_eq!(stats.loss_events, 3);
    assert_eq!(stats.lost_samples, 1000 + 3496 + 3496);

    let lengths = &sdr.transport().submitted_lengths;
    assert_eq!(lengths, &vec![16384, 16384, 16384, 16384, 16384 - 512]);
}

#[test]
fn test_cancel_twice_frees_once() {
    let mut sdr = mock_sdr(MockTransport::with_script([Scripted::Bulk(blocks(0, 1, 504))]));
    let handle = sdr.handle();

    let mut outcomes = Vec::new();
    sdr.start_session(SampleFormat::S8_504, 1, 0, |_| {
        outcomes.push(handle.cancel().unwrap());
        outcomes.push(handle.cancel().unwrap());
    })
    .unwrap();

    assert_eq!(outcomes, vec![CancelOutcome::Canceling, CancelOutcome::AlreadyCanceled]);
    assert_eq!(handle.cancel().unwrap(), CancelOutcome::AlreadyCanceled);
    assert!(handle.cancel_and_wait().is_ok());

    let transport = sdr.transport();
    assert_eq!(transport.allocated, 1);
    assert_eq!(transport.freed, 1);
    sdr.close();
}

#[test]
fn test_transfer_error_fails_session() {
    let script = [Scripted::Status(TransferStatus::Error)];
    let mut sdr = mock_sdr(MockTransport::with_script(script));
    let handle = sdr.handle();

    let mut delivered = 0;
    let result = sdr.start_session(SampleFormat::S16_504, 2, 0, |_| delivered += 1);

    assert!(matches!(result, Err(Error::DeviceFailed)));
    assert_eq!(delivered, 0);
    assert_eq!(sdr.status(), AsyncStatus::Failed);
    assert_eq!(sdr.transport().freed, 2);
    assert!(sdr.transport().in_flight.is_empty());

    assert!(matches!(handle.cancel(), Err(Error::DeviceFailed)));
    assert!(matches!(
        sdr.start_session(SampleFormat::S16_504, 2, 0, |_| {}),
        Err(Error::DeviceFailed)
    ));
}

#[test]
fn test_resubmit_failure_fails_session() {
    let mut transport = MockTransport::with_script([Scripted::Bulk(blocks(0, 1, 504))]);
    transport.fail_submission = Some(1);
    let mut sdr = mock_sdr(transport);

    let mut delivered = 0;
    let result = sdr.start_session(SampleFormat::S16_504, 1, 0, |_| delivered += 1);

    assert!(matches!(result, Err(Error::DeviceFailed)));
    assert_eq!(delivered, 1);
    assert_eq!(sdr.transport().freed, 1);
}

#[test]
fn test_initial_submit_failure_releases_pool() {
    let mut transport = MockTransport::default();
    transport.fail_submission = Some(1);
    let mut sdr = mock_sdr(transport);

    let result = sdr.start_session(SampleFormat::S16_504, 3, 0, |_| {});

    assert!(matches!(result, Err(Error::Transport(rusb::Error::Io))));
    assert_eq!(sdr.status(), AsyncStatus::Inactive);

    let transport = sdr.transport();
    assert_eq!(transport.freed, 3);
    assert!(transport.in_flight.is_empty());
    assert!(transport.control_requests.is_empty());
}

#[test]
fn test_zero_buffer_count_uses_default() {
    let mut transport = MockTransport::default();
    transport.fail_submission = Some(0);
    let mut sdr = mock_sdr(transport);

    assert!(sdr.start_session(SampleFormat::S16_504, 0, 0, |_| {}).is_err());
    assert_eq!(sdr.transport().allocated, rs_miri::DEFAULT_BUFFER_COUNT);
    assert_eq!(sdr.transport().freed, rs_miri::DEFAULT_BUFFER_COUNT);
}

#[test]
fn test_event_error_fails_session() {
    let mut transport = MockTransport::default();
    transport.event_errors = [rusb::Error::Interrupted, rusb::Error::Io].into_iter().collect();
    let mut sdr = mock_sdr(transport);

    let result = sdr.start_session(SampleFormat::S16_504, 2, 0, |_| {});

    assert!(matches!(result, Err(Error::Transport(rusb::Error::Io))));
    assert_eq!(sdr.status(), AsyncStatus::Failed);

    let transport = sdr.transport();
    assert_eq!(transport.cancels, 2);
    assert_eq!(transport.freed, 2);
}

#[test]
fn test_pause_resume_from_another_thread() {
    let mut sdr = mock_sdr(MockTransport::default());
    let handle = sdr.handle();

    let session = thread::spawn(move || {
        let result = sdr.start_session(SampleFormat::S16_384, 2, 0, |_| {});
        (sdr, result)
    });

    wait_for(AsyncStatus::Running, &handle);
    handle.pause().unwrap();
    assert_eq!(handle.status(), AsyncStatus::Paused);
    assert!(matches!(handle.pause(), Err(Error::InvalidState(AsyncStatus::Paused))));

    handle.resume().unwrap();
    assert_eq!(handle.status(), AsyncStatus::Running);

    handle.cancel_and_wait().unwrap();
    assert_eq!(handle.status(), AsyncStatus::Inactive);

    let (sdr, result) = session.join().unwrap();
    result.unwrap();

    let transport = sdr.transport();
    assert_eq!(transport.control_requests, vec![START, STOP, START, STOP]);
    assert_eq!(transport.submitted_lengths.len(), 4);
    assert_eq!(transport.freed, 2);
}

#[test]
fn test_reset_buffer_restarts_streaming() {
    let mut sdr = mock_sdr(MockTransport::default());
    let handle = sdr.handle();

    let session = thread::spawn(move || {
        let result = sdr.start_session(SampleFormat::S8_504, 1, 512, |_| {});
        (sdr, result)
    });

    wait_for(AsyncStatus::Running, &handle);
    handle.reset_buffer().unwrap();
    handle.cancel_and_wait().unwrap();

    let (sdr, result) = session.join().unwrap();
    result.unwrap();
    assert_eq!(sdr.transport().control_requests, vec![START, STOP, START, STOP]);
}

#[test]
fn test_cancel_while_paused_ends_session() {
    let mut sdr = mock_sdr(MockTransport::default());
    let handle = sdr.handle();

    let session = thread::spawn(move || {
        let result = sdr.start_session(SampleFormat::S16_252, 2, 0, |_| {});
        (sdr, result)
    });

    wait_for(AsyncStatus::Running, &handle);
    handle.pause().unwrap();
    handle.cancel_and_wait().unwrap();

    let (sdr, result) = session.join().unwrap();
    result.unwrap();
    assert_eq!(sdr.status(), AsyncStatus::Inactive);
    assert_eq!(sdr.transport().freed, 2);
}
