//! End-to-end bridge tests: a real client context and a real server
//! runtime over the same session, each side driven from its own thread
//! exactly as the two processes would drive them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pontoon_client::BridgeContext;
use pontoon_core::{BridgeOptions, Command, CommandHeader, Flags, ProcessState, Result};
use pontoon_server::{Dispatcher, ServerRuntime, ServerServices};

/// Echo: double the token, mirror the blob.
const CMD_ECHO: Command = Command::Api(0x300);
/// Present: release one present slot.
const CMD_PRESENT: Command = Command::Api(0x310);
/// Buffer unlock with heap-resident payload.
const CMD_UNLOCK: Command = Command::Api(0x320);

fn small_options() -> BridgeOptions {
    BridgeOptions {
        module_client_cmd_queue_size: 8,
        module_client_data_queue_size: 16 << 10,
        client_cmd_queue_size: 64,
        client_data_queue_size: 64 << 10,
        server_cmd_queue_size: 64,
        server_data_queue_size: 64 << 10,
        command_timeout_ms: 100,
        startup_timeout_ms: 100,
        ack_timeout_ms: 50,
        command_retries: 40,
        ..BridgeOptions::default()
    }
}

fn session(options: &BridgeOptions) -> (Arc<BridgeContext>, ServerRuntime) {
    let ctx = BridgeContext::new(options.clone()).unwrap();
    let runtime = ServerRuntime::attach(ctx.guid(), options.clone()).unwrap();
    (ctx, runtime)
}

/// Run both handshake halves to completion.
fn handshake(ctx: &Arc<BridgeContext>, runtime: &ServerRuntime) {
    std::thread::scope(|scope| {
        let server = scope.spawn(|| runtime.handshake());
        ctx.handshake().unwrap();
        server.join().unwrap().unwrap();
    });
}

#[derive(Default)]
struct TestDispatcher {
    heap_payloads: Arc<Mutex<Vec<Vec<u8>>>>,
    presents: Arc<AtomicU32>,
}

impl Dispatcher for TestDispatcher {
    fn dispatch(
        &mut self,
        services: &mut ServerServices<'_>,
        header: CommandHeader,
        uid: u32,
    ) -> Result<()> {
        match header.command {
            CMD_ECHO => {
                let value = services.data().pull_token();
                let bytes = services.data().pull_bytes();
                let mut reply = services.reply(uid);
                reply.send_token(value.wrapping_mul(2));
                reply.send_bytes(&bytes);
            }
            CMD_PRESENT => {
                self.presents.fetch_add(1, Ordering::Relaxed);
                services.finish_present();
            }
            CMD_UNLOCK => {
                let offset = services.data().pull_token();
                let size = services.data().pull_token();
                assert!(header.flags.contains(Flags::DATA_IN_HEAP));
                let bytes =
                    services.heap_bytes(header.handle, offset as usize, size as usize)?;
                self.heap_payloads.lock().push(bytes);
            }
            other => panic!("unexpected command {other:?}"),
        }
        Ok(())
    }
}

#[test]
fn minimal_handshake_reaches_running() {
    let options = small_options();
    let (ctx, runtime) = session(&options);
    handshake(&ctx, &runtime);

    assert!(ctx.is_enabled());
    assert_eq!(runtime.client_pid(), std::process::id());
    let device = ctx.device_channel();
    assert_eq!(device.client_state(), ProcessState::Running);
    assert_eq!(device.server_state(), ProcessState::Running);
}

#[test]
fn version_mismatch_refuses_to_attach() {
    let guid = pontoon_core::SessionGuid::generate().to_string();
    let err = ServerRuntime::connect(&guid, "pontoon-9.9.9", small_options()).unwrap_err();
    assert!(matches!(err, pontoon_core::BridgeError::Handshake { .. }));
}

#[test]
fn missing_server_times_out_and_disables_bridge() {
    // Nobody ever answers the Syn: the client must give up within its
    // startup budget and turn the bridge off (device-lost-class failure).
    let options = BridgeOptions {
        startup_timeout_ms: 20,
        command_retries: 3,
        ..small_options()
    };
    let ctx = BridgeContext::new(options).unwrap();
    assert!(ctx.handshake().is_err());
    assert!(!ctx.is_enabled());
}

#[test]
fn commands_round_trip_with_correlated_responses() {
    let options = small_options();
    let (ctx, runtime) = session(&options);
    handshake(&ctx, &runtime);

    std::thread::scope(|scope| {
        let server = scope.spawn(|| {
            let mut dispatcher = TestDispatcher::default();
            runtime.run(&mut dispatcher).unwrap();
        });

        for i in 0..10u32 {
            let payload = format!("frame {i} payload");
            let uid = {
                let mut cmd = ctx.command(CMD_ECHO, i, Flags::empty());
                cmd.send_token(i);
                cmd.send_bytes(payload.as_bytes());
                cmd.uid()
            };
            let mut response = ctx.wait_for_response(uid).unwrap();
            assert_eq!(response.pull_token(), i.wrapping_mul(2));
            assert_eq!(response.pull_bytes(), payload.as_bytes());
        }

        ctx.shutdown().unwrap();
        server.join().unwrap();
    });
    assert!(ctx.is_enabled());
}

#[test]
fn present_semaphore_bounds_frame_lead_without_server() {
    // Capacity 3, nobody releasing: three acquires pass, the fourth
    // starves and disables the bridge.
    let options = BridgeOptions {
        command_timeout_ms: 20,
        command_retries: 2,
        ..small_options()
    };
    let ctx = BridgeContext::new(options).unwrap();
    for _ in 0..3 {
        ctx.begin_present().unwrap();
    }
    assert!(ctx.begin_present().is_err());
    assert!(!ctx.is_enabled());
}

#[test]
fn present_semaphore_flows_with_server_releases() {
    let options = small_options();
    let (ctx, runtime) = session(&options);
    handshake(&ctx, &runtime);

    std::thread::scope(|scope| {
        let presents = Arc::new(AtomicU32::new(0));
        let server = {
            let presents = presents.clone();
            scope.spawn(move || {
                let mut dispatcher = TestDispatcher {
                    presents,
                    ..TestDispatcher::default()
                };
                runtime.run(&mut dispatcher).unwrap();
            })
        };

        // Far more frames than the 3-deep semaphore; the server's release
        // per present keeps the client from ever starving.
        for _ in 0..10 {
            ctx.begin_present().unwrap();
            let _cmd = ctx.command(CMD_PRESENT, 0, Flags::empty());
        }

        ctx.shutdown().unwrap();
        server.join().unwrap();
        assert_eq!(presents.load(Ordering::Relaxed), 10);
    });
}

#[test]
fn shared_heap_alloc_use_free() {
    let options = BridgeOptions {
        use_shared_heap: true,
        ..small_options()
    };
    let (ctx, runtime) = session(&options);
    handshake(&ctx, &runtime);

    let free_at_start = ctx.heap().unwrap().lock().free_chunks(0).unwrap();

    std::thread::scope(|scope| {
        let payloads = Arc::new(Mutex::new(Vec::new()));
        let server = {
            let payloads = payloads.clone();
            scope.spawn(move || {
                let mut dispatcher = TestDispatcher {
                    heap_payloads: payloads,
                    ..TestDispatcher::default()
                };
                runtime.run(&mut dispatcher).unwrap();
            })
        };

        // 10 KiB with 4 KiB chunks: exactly three chunks, first id is 1.
        let id = ctx.heap_allocate(10 << 10).unwrap();
        assert_eq!(id, 1);
        assert_eq!(
            ctx.heap().unwrap().lock().free_chunks(0).unwrap(),
            free_at_start - 3
        );

        let contents = vec![0xC7u8; 10 << 10];
        ctx.heap().unwrap().lock().write(id, 0, &contents).unwrap();

        // Unlock command: bulk bytes stay in the heap, only the id and the
        // lock window ride the queue.
        {
            let mut cmd = ctx.command(CMD_UNLOCK, id, Flags::DATA_IN_HEAP);
            cmd.send_many(&[0, contents.len() as u32]);
        }
        ctx.heap_deallocate(id);

        // An echo round trip fences: the server has processed everything
        // up to and including the dealloc.
        let uid = {
            let mut cmd = ctx.command(CMD_ECHO, 0, Flags::empty());
            cmd.send_token(1);
            cmd.send_bytes(b"fence");
            cmd.uid()
        };
        drop(ctx.wait_for_response(uid).unwrap());

        assert_eq!(*payloads.lock(), vec![contents.clone()]);
        assert_eq!(
            ctx.heap().unwrap().lock().free_chunks(0).unwrap(),
            free_at_start
        );

        ctx.shutdown().unwrap();
        server.join().unwrap();
    });
}

#[test]
fn terminate_is_acknowledged_and_states_drain() {
    let options = small_options();
    let (ctx, runtime) = session(&options);
    handshake(&ctx, &runtime);

    std::thread::scope(|scope| {
        let server = scope.spawn(|| {
            let mut dispatcher = TestDispatcher::default();
            runtime.run(&mut dispatcher).unwrap();
        });
        ctx.shutdown().unwrap();
        server.join().unwrap();
    });

    assert_eq!(ctx.device_channel().server_state(), ProcessState::Exited);
    assert_eq!(ctx.device_channel().client_state(), ProcessState::Exited);
}

#[test]
fn focus_loss_relays_infinite_retries_to_server() {
    let options = small_options();
    let (ctx, runtime) = session(&options);
    handshake(&ctx, &runtime);

    assert!(!runtime.retry_flags().infinite_retries());
    ctx.notify_focus(false);
    for _ in 0..200 {
        if runtime.retry_flags().infinite_retries() {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(runtime.retry_flags().infinite_retries());
    assert!(ctx.retry_flags().infinite_retries());

    ctx.notify_focus(true);
    for _ in 0..200 {
        if !runtime.retry_flags().infinite_retries() {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(!runtime.retry_flags().infinite_retries());
    assert!(!ctx.retry_flags().infinite_retries());
}

#[test]
fn sync_flags_cross_in_the_syn_payload() {
    let options = small_options();
    let ctx = BridgeContext::new(options.clone()).unwrap();
    ctx.retry_flags().set_infinite_retries(true);
    let runtime = ServerRuntime::attach(ctx.guid(), options).unwrap();

    std::thread::scope(|scope| {
        let server = scope.spawn(|| runtime.handshake());
        ctx.handshake().unwrap();
        server.join().unwrap().unwrap();
    });

    // The server adopted the client's retry policy during handshake.
    assert!(runtime.retry_flags().infinite_retries());
}
