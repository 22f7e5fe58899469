//! Out-of-band window-message relay.
//!
//! A low-volume bidirectional mailbox, separate from the command queues,
//! used for focus events (client → server) and renderer-UI events
//! (server → client). Messages are `{msg, wparam, lparam}` records in two
//! tiny SPSC rings inside one named mapping; each endpoint registers
//! handlers per message id and drains its inbound ring from a pump thread.
//!
//! The mailbox is created by the server; its `port` nonce travels back in
//! the handshake `Ack` so the client can verify it attached to the right
//! session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pontoon_core::session::{object_name, ObjectRole, SessionGuid};
use pontoon_core::{BridgeError, Result};

use crate::arena::Arena;
use crate::mmap_impl::ShmFile;

/// Focus gained. Value mirrors the Win32 message id.
pub const WM_SETFOCUS: u32 = 0x0007;
/// Focus lost. Value mirrors the Win32 message id.
pub const WM_KILLFOCUS: u32 = 0x0008;

const MAILBOX_MAGIC: [u8; 8] = *b"PONTOMB\x01";
const RING_CAPACITY: u32 = 64;
const RECORD_SIZE: usize = 16;
const RING_HEADER_SIZE: usize = 64;
const RING_BYTES: usize = RING_HEADER_SIZE + RING_CAPACITY as usize * RECORD_SIZE;
const MAILBOX_HEADER_SIZE: usize = 64;
const MAILBOX_SIZE: usize = 4096;

const RING_A_OFFSET: usize = MAILBOX_HEADER_SIZE;
const RING_B_OFFSET: usize = RING_A_OFFSET + RING_BYTES;

const _: () = assert!(RING_B_OFFSET + RING_BYTES <= MAILBOX_SIZE);

#[repr(C)]
struct MailboxHeader {
    magic: [u8; 8],
    port: u32,
    _pad: [u8; 52],
}

const _: () = assert!(core::mem::size_of::<MailboxHeader>() == MAILBOX_HEADER_SIZE);

#[repr(C)]
struct MsgRingHeader {
    head: AtomicU32,
    _pad0: [u8; 28],
    tail: AtomicU32,
    _pad1: [u8; 28],
}

const _: () = assert!(core::mem::size_of::<MsgRingHeader>() == RING_HEADER_SIZE);

/// One relayed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayMessage {
    pub msg: u32,
    pub wparam: u32,
    pub lparam: u32,
}

fn ring_header<'a>(arena: Arena<'a>, offset: usize) -> &'a MsgRingHeader {
    unsafe { arena.shared::<MsgRingHeader>(offset) }
}

fn record_ptr(arena: Arena<'_>, offset: usize, slot: usize) -> *mut [u32; 4] {
    arena.bytes(offset + RING_HEADER_SIZE + slot * RECORD_SIZE, RECORD_SIZE) as *mut [u32; 4]
}

fn try_push(arena: Arena<'_>, offset: usize, message: RelayMessage) -> bool {
    let header = ring_header(arena, offset);
    let head = header.head.load(Ordering::Relaxed);
    let tail = header.tail.load(Ordering::Acquire);
    if head.wrapping_sub(tail) >= RING_CAPACITY {
        return false;
    }
    let slot = (head % RING_CAPACITY) as usize;
    let record = [message.msg, message.wparam, message.lparam, 0u32];
    unsafe {
        std::ptr::write(record_ptr(arena, offset, slot), record);
    }
    header.head.store(head.wrapping_add(1), Ordering::Release);
    true
}

fn try_pop(arena: Arena<'_>, offset: usize) -> Option<RelayMessage> {
    let header = ring_header(arena, offset);
    let tail = header.tail.load(Ordering::Relaxed);
    let head = header.head.load(Ordering::Acquire);
    if tail == head {
        return None;
    }
    let slot = (tail % RING_CAPACITY) as usize;
    let record = unsafe { std::ptr::read(record_ptr(arena, offset, slot)) };
    header.tail.store(tail.wrapping_add(1), Ordering::Release);
    Some(RelayMessage {
        msg: record[0],
        wparam: record[1],
        lparam: record[2],
    })
}

/// Handler: returns true when the message was consumed.
type Handler = Box<dyn Fn(u32, u32) -> bool + Send + Sync>;

struct Inner {
    shm: ShmFile,
    send_offset: usize,
    recv_offset: usize,
    handlers: Mutex<HashMap<u32, Handler>>,
    stop: AtomicBool,
}

impl Inner {
    fn poll(&self) -> usize {
        let arena = self.shm.arena();
        let mut handled = 0;
        while let Some(message) = try_pop(arena, self.recv_offset) {
            handled += 1;
            let handlers = self.handlers.lock();
            match handlers.get(&message.msg) {
                Some(handler) => {
                    handler(message.wparam, message.lparam);
                }
                None => {
                    tracing::trace!(msg = message.msg, "relay message without handler");
                }
            }
        }
        handled
    }
}

/// One endpoint of the relay mailbox.
pub struct MessageEndpoint {
    inner: Arc<Inner>,
    pump: Option<std::thread::JoinHandle<()>>,
}

impl MessageEndpoint {
    /// Server side: create the mailbox and mint its port nonce.
    pub fn create(guid: SessionGuid) -> Result<Self> {
        let shm = ShmFile::create(&object_name(guid, ObjectRole::Data, "mailbox"), MAILBOX_SIZE)?;
        let port = {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos();
            // Port 0 is reserved for "not yet assigned".
            nanos | 1
        };
        let header = unsafe { shm.arena().init_at::<MailboxHeader>(0) };
        header.magic = MAILBOX_MAGIC;
        header.port = port;
        header._pad = [0; 52];

        Ok(Self {
            inner: Arc::new(Inner {
                shm,
                send_offset: RING_A_OFFSET,
                recv_offset: RING_B_OFFSET,
                handlers: Mutex::new(HashMap::new()),
                stop: AtomicBool::new(false),
            }),
            pump: None,
        })
    }

    /// Client side: attach to the mailbox, verifying the port received in
    /// the handshake `Ack`.
    pub fn open(guid: SessionGuid, expected_port: u32) -> Result<Self> {
        let shm = ShmFile::open(&object_name(guid, ObjectRole::Data, "mailbox"), MAILBOX_SIZE)?;
        let header = unsafe { shm.arena().shared::<MailboxHeader>(0) };
        if header.magic != MAILBOX_MAGIC {
            return Err(BridgeError::handshake("bad mailbox magic"));
        }
        if header.port != expected_port {
            return Err(BridgeError::handshake(format!(
                "mailbox port {} does not match handshake port {expected_port}",
                header.port
            )));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                shm,
                send_offset: RING_B_OFFSET,
                recv_offset: RING_A_OFFSET,
                handlers: Mutex::new(HashMap::new()),
                stop: AtomicBool::new(false),
            }),
            pump: None,
        })
    }

    /// The mailbox port nonce (sent to the client in the `Ack` handle).
    pub fn port(&self) -> u32 {
        unsafe { self.inner.shm.arena().shared::<MailboxHeader>(0) }.port
    }

    /// Register the handler for one message id. Replaces any previous one.
    pub fn register_handler(
        &self,
        msg: u32,
        handler: impl Fn(u32, u32) -> bool + Send + Sync + 'static,
    ) {
        self.inner.handlers.lock().insert(msg, Box::new(handler));
    }

    /// Send a message to the peer. Low volume: a full ring drops the
    /// message (the peer is already hopelessly behind) and returns false.
    pub fn send(&self, msg: u32, wparam: u32, lparam: u32) -> bool {
        let sent = try_push(
            self.inner.shm.arena(),
            self.inner.send_offset,
            RelayMessage { msg, wparam, lparam },
        );
        if !sent {
            tracing::warn!(msg, "relay mailbox full, dropping message");
        }
        sent
    }

    /// Drain inbound messages, dispatching handlers. Returns the count.
    pub fn poll(&self) -> usize {
        self.inner.poll()
    }

    /// Start a background pump draining the mailbox at `interval`.
    pub fn start_pump(&mut self, interval: Duration) {
        if self.pump.is_some() {
            return;
        }
        let inner = self.inner.clone();
        self.pump = Some(std::thread::spawn(move || {
            while !inner.stop.load(Ordering::Relaxed) {
                inner.poll();
                std::thread::sleep(interval);
            }
        }));
    }
}

impl Drop for MessageEndpoint {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::Relaxed);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_guid() -> SessionGuid {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        SessionGuid::parse(&format!("{:016x}-{:016x}", std::process::id() as u64 + 13, n))
            .unwrap()
    }

    fn endpoint_pair() -> (MessageEndpoint, MessageEndpoint) {
        let guid = test_guid();
        let server = MessageEndpoint::create(guid).unwrap();
        let client = MessageEndpoint::open(guid, server.port()).unwrap();
        (server, client)
    }

    #[test]
    fn port_mismatch_rejected() {
        let guid = test_guid();
        let server = MessageEndpoint::create(guid).unwrap();
        let bogus = server.port().wrapping_add(1);
        assert!(MessageEndpoint::open(guid, bogus).is_err());
    }

    #[test]
    fn messages_reach_registered_handler() {
        let (server, client) = endpoint_pair();
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            server.register_handler(WM_KILLFOCUS, move |wparam, _| {
                assert_eq!(wparam, 7);
                seen.fetch_add(1, Ordering::Relaxed);
                true
            });
        }
        assert!(client.send(WM_KILLFOCUS, 7, 0));
        assert_eq!(server.poll(), 1);
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn both_directions_are_independent() {
        let (server, client) = endpoint_pair();
        assert!(server.send(WM_SETFOCUS, 1, 2));
        assert!(client.send(WM_KILLFOCUS, 3, 4));
        // Each side only sees the peer's message.
        assert_eq!(server.poll(), 1);
        assert_eq!(client.poll(), 1);
        assert_eq!(server.poll(), 0);
    }

    #[test]
    fn unhandled_messages_are_drained() {
        let (server, client) = endpoint_pair();
        client.send(0x400, 0, 0);
        assert_eq!(server.poll(), 1);
        assert_eq!(server.poll(), 0);
    }

    #[test]
    fn full_ring_drops() {
        let (_server, client) = endpoint_pair();
        for _ in 0..RING_CAPACITY {
            assert!(client.send(WM_SETFOCUS, 0, 0));
        }
        assert!(!client.send(WM_SETFOCUS, 0, 0));
    }

    #[test]
    fn pump_thread_dispatches() {
        let (mut server, client) = endpoint_pair();
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            server.register_handler(WM_SETFOCUS, move |_, _| {
                seen.fetch_add(1, Ordering::Relaxed);
                true
            });
        }
        server.start_pump(Duration::from_millis(1));
        client.send(WM_SETFOCUS, 0, 0);
        for _ in 0..200 {
            if seen.load(Ordering::Relaxed) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }
}
