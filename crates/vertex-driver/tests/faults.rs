// SPDX-License-Identifier: AGPL-3.0-only

//! Failure paths: firmware errors, silent and stalled firmware, stop with
//! work in flight

use std::time::{Duration, Instant};
use vertex_driver::chip::{status, ChannelId};
use vertex_driver::format::codes;
use vertex_driver::prelude::*;
use vertex_driver::{MailboxConfig, PollConfig};

fn spec() -> FormatSpec {
    FormatSpec {
        target: 0,
        format: codes::S16,
        planes: 1,
        width: 16,
        height: 8,
    }
}

fn bundle(index: u32, handle: i32) -> BundleSubmit {
    BundleSubmit {
        id: index,
        index,
        containers: vec![ContainerDesc {
            target: 0,
            buffers: vec![BufferDesc {
                handle: MemHandle(handle),
                roi: Roi::default(),
            }],
        }],
    }
}

fn streaming(device: &VertexDevice) -> VertexContext {
    let ctx = device.open_context().expect("context");
    ctx.set_format(Direction::Input, &[spec()]).expect("input format");
    ctx.set_format(Direction::Output, &[spec()]).expect("output format");
    ctx.streamon().expect("streamon");
    ctx
}

fn submit_pair(ctx: &VertexContext, index: u32) {
    ctx.qbuf(Direction::Input, bundle(index, 10 + index as i32))
        .expect("qbuf input");
    ctx.qbuf(Direction::Output, bundle(index, 40 + index as i32))
        .expect("qbuf output");
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn is_invalid(bundle: &DequeuedBundle) -> bool {
    bundle.flags & bundle_flags::INVALID != 0
}

#[test]
fn firmware_error_invalidates_only_that_bundle() {
    let device = VertexDevice::open(
        VertexConfig::default(),
        &FirmwareConfig::default().with_invoke_failures(1, status::INTERNAL),
    )
    .expect("device open");
    let ctx = streaming(&device);

    submit_pair(&ctx, 0);
    submit_pair(&ctx, 1);
    let first = ctx.dqbuf(Direction::Output).expect("first");
    let second = ctx.dqbuf(Direction::Output).expect("second");
    assert!(is_invalid(&first));
    assert!(!is_invalid(&second));

    let stats = ctx.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.done, 1);
}

#[test]
fn silent_firmware_is_bounded_by_invoke_timeout() {
    let config = VertexConfig::default()
        .with_invoke_timeout(Duration::from_millis(150))
        .with_command_timeout(Duration::from_millis(500));
    let device = VertexDevice::open(config, &FirmwareConfig::default()).expect("device open");
    let ctx = streaming(&device);

    device.firmware().set_silent(true);
    let started = Instant::now();
    submit_pair(&ctx, 0);
    let out = ctx.dqbuf(Direction::Output).expect("dqbuf");
    let waited = started.elapsed();

    assert!(is_invalid(&out));
    assert!(waited >= Duration::from_millis(150), "completed early: {waited:?}");
    assert!(waited < Duration::from_secs(3), "watchdog too slow: {waited:?}");
    assert_eq!(device.interface().stats().timeouts, 1);
    assert_eq!(device.interface().outstanding_invokes(), 0);
    let dump = device.interface().last_diagnostics().expect("dump taken");
    assert!(dump.reason.contains("timed out"));
    assert_eq!(ctx.stats().failed, 1);

    device.firmware().set_silent(false);
}

#[test]
fn silent_firmware_times_out_control_commands() {
    let config = VertexConfig::default().with_command_timeout(Duration::from_millis(100));
    let device = VertexDevice::open(config, &FirmwareConfig::default()).expect("device open");
    device.firmware().set_silent(true);

    let started = Instant::now();
    let err = device.open_context().expect_err("CREATE_GRAPH unanswered");
    assert!(matches!(err, VertexError::Timeout { .. }), "{err}");
    assert!(started.elapsed() < Duration::from_secs(2));

    assert!(device.interface().last_diagnostics().is_some());
    assert_eq!(device.graph_manager().stats().dispatched, 0);
    device.firmware().set_silent(false);
}

#[test]
fn stalled_firmware_fills_the_ring() {
    let config = VertexConfig::default()
        .with_mailbox(MailboxConfig {
            normal_capacity: 2,
            ..MailboxConfig::default()
        })
        .with_mailbox_poll(PollConfig::new(3, Duration::from_millis(1)));
    let device = VertexDevice::open(config, &FirmwareConfig::default()).expect("device open");
    let ctx = streaming(&device);

    device.firmware().set_stalled(true);
    submit_pair(&ctx, 0);
    submit_pair(&ctx, 1);
    let ring = device.interface().mailbox().channel(ChannelId::H2fNormal);
    wait_for("both invokes on the ring", || ring.is_full());
    assert_eq!(device.interface().outstanding_invokes(), 2);

    let err = device.open_context().expect_err("ring is full");
    assert!(matches!(err, VertexError::MailboxFull { .. }), "{err}");
    assert!(err.is_retryable());

    device.firmware().set_stalled(false);
    for _ in 0..2 {
        let out = ctx.dqbuf(Direction::Output).expect("dqbuf");
        assert!(!is_invalid(&out));
    }
    device.open_context().expect("ring drained");
}

#[test]
fn streamoff_waits_out_dispatched_work() {
    let device = VertexDevice::open(
        VertexConfig::default(),
        &FirmwareConfig::default().with_invoke_latency(Duration::from_millis(20)),
    )
    .expect("device open");
    let ctx = streaming(&device);
    for index in 0..5 {
        submit_pair(&ctx, index);
    }

    assert!(matches!(ctx.streamoff(), Err(VertexError::Busy { .. })));
    let stats = ctx.stats();
    assert_eq!(stats.tasks.in_flight(), 0);
    assert_eq!(stats.input, 5);
    assert_eq!(stats.done + stats.cancel + stats.failed, 5);

    for _ in 0..5 {
        ctx.dqbuf(Direction::Input).expect("input");
        ctx.dqbuf(Direction::Output).expect("output");
    }
    ctx.streamoff().expect("streamoff after draining");

    // the graph can stream again
    ctx.streamon().expect("streamon");
    submit_pair(&ctx, 0);
    assert!(!is_invalid(&ctx.dqbuf(Direction::Output).expect("dqbuf")));
}

#[test]
fn queue_refuses_work_when_stopped() {
    let device = VertexDevice::open(VertexConfig::default(), &FirmwareConfig::default())
        .expect("device open");
    let ctx = device.open_context().expect("context");
    ctx.set_format(Direction::Input, &[spec()]).expect("format");
    ctx.set_format(Direction::Output, &[spec()]).expect("format");
    assert!(matches!(
        ctx.qbuf(Direction::Input, bundle(0, 1)),
        Err(VertexError::InvalidState { .. })
    ));
}

#[test]
fn mismatched_bundle_rejected() {
    let device = VertexDevice::open(VertexConfig::default(), &FirmwareConfig::default())
        .expect("device open");
    let ctx = streaming(&device);
    let mut submit = bundle(0, 1);
    submit.containers[0].buffers.push(BufferDesc {
        handle: MemHandle(2),
        roi: Roi::default(),
    });
    assert!(matches!(
        ctx.qbuf(Direction::Input, submit),
        Err(VertexError::InvalidArgument { .. })
    ));

    let mut outside = bundle(0, 1);
    outside.containers[0].buffers[0].roi = Roi {
        x: 8,
        y: 0,
        width: 16,
        height: 8,
    };
    assert!(ctx.qbuf(Direction::Input, outside).is_err());
    assert_eq!(ctx.queue_counts().active(), 0);
}

#[test]
fn odd_ring_capacity_refused_at_open() {
    let config = VertexConfig::default().with_mailbox(MailboxConfig {
        normal_capacity: 3,
        ..MailboxConfig::default()
    });
    let err = VertexDevice::open(config, &FirmwareConfig::default()).expect_err("capacity 3");
    assert!(matches!(err, VertexError::InvalidArgument { .. }), "{err}");
}
