//! Server runtime: session attach, handshake, and the command pump.
//!
//! The client created every shared object before spawning us; the runtime
//! attaches by session GUID, answers the Syn/Ack/Continue handshake, and
//! then pumps commands: bridge-internal ones (terminate, shared-heap
//! bookkeeping, debug) inline, everything else through the [`Dispatcher`].
//!
//! After every command the consumer cursor is published to the sync block
//! and, when the producer is blocked on an overrun, the data semaphore is
//! signalled exactly once (see `IpcChannel::consumer_publish`). The
//! header's `data_offset` is the resync point: payload tokens the handler
//! did not consume are skipped, which keeps old servers compatible with
//! newer clients' extended payloads.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pontoon_core::session::{object_name, ObjectRole};
use pontoon_core::{
    BridgeError, BridgeOptions, Command, CommandHeader, ProcessState, Result, RetryFlags,
    SessionGuid, BRIDGE_VERSION,
};
use pontoon_shm::{
    AllocRun, ChannelGeometry, ChannelSide, IpcChannel, MessageEndpoint, NamedSemaphore,
    SharedHeap, WM_KILLFOCUS, WM_SETFOCUS,
};

use crate::dispatch::{Dispatcher, ReplyWriter, ServerServices};

pub struct ServerRuntime {
    options: BridgeOptions,
    guid: SessionGuid,
    retry: Arc<RetryFlags>,
    enabled: AtomicBool,

    /// Client → server, handshake and module commands.
    control: IpcChannel,
    /// Client → server, per-frame commands.
    device: IpcChannel,
    /// Server → client.
    response: IpcChannel,

    present: Option<NamedSemaphore>,
    heap: Option<Mutex<SharedHeap>>,
    mailbox: MessageEndpoint,

    uid_counter: AtomicU32,
    client_pid: AtomicU32,
    started: Instant,
}

impl std::fmt::Debug for ServerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRuntime").finish_non_exhaustive()
    }
}

impl ServerRuntime {
    /// Parse the command-line identity (`<guid> <version> …`), verify the
    /// version, and attach to the session. A version mismatch is fatal
    /// before any shared state is touched.
    pub fn connect(guid_arg: &str, version_arg: &str, options: BridgeOptions) -> Result<Self> {
        if version_arg != BRIDGE_VERSION {
            return Err(BridgeError::handshake(format!(
                "client ({version_arg}) and server ({BRIDGE_VERSION}) versions do not match; \
                 mixed-version execution is not supported"
            )));
        }
        let guid = SessionGuid::parse(guid_arg)
            .ok_or_else(|| BridgeError::handshake(format!("invalid session guid {guid_arg:?}")))?;
        Self::attach(guid, options)
    }

    /// Attach to an existing session's shared objects.
    pub fn attach(guid: SessionGuid, options: BridgeOptions) -> Result<Self> {
        let control = IpcChannel::open(
            guid,
            "control",
            ChannelGeometry::with_budget(
                options.module_client_cmd_queue_size,
                options.module_client_data_queue_size,
                options.module_client_channel_mem_size,
            ),
            ChannelSide::Consumer,
        )?;
        let device = IpcChannel::open(
            guid,
            "device",
            ChannelGeometry::with_budget(
                options.client_cmd_queue_size,
                options.client_data_queue_size,
                options.client_channel_mem_size,
            ),
            ChannelSide::Consumer,
        )?;
        let response = IpcChannel::open(
            guid,
            "response",
            ChannelGeometry::with_budget(
                options.server_cmd_queue_size,
                options.server_data_queue_size,
                options.server_channel_mem_size,
            ),
            ChannelSide::Producer,
        )?;

        let present = if options.present_semaphore_enabled {
            Some(NamedSemaphore::open(&object_name(
                guid,
                ObjectRole::Semaphore,
                "present",
            ))?)
        } else {
            None
        };

        let heap = options.use_shared_heap.then(|| {
            Mutex::new(SharedHeap::open(
                guid,
                options.shared_heap_chunk_size,
                options.shared_heap_default_segment_size,
            ))
        });

        let retry = RetryFlags::new();
        let mut mailbox = MessageEndpoint::create(guid)?;
        {
            let retry = retry.clone();
            mailbox.register_handler(WM_KILLFOCUS, move |_, _| {
                tracing::info!("client window inactive, disabling timeouts on the server");
                retry.set_infinite_retries(true);
                true
            });
        }
        {
            let retry = retry.clone();
            mailbox.register_handler(WM_SETFOCUS, move |_, _| {
                tracing::info!("client window active again, restoring timeouts on the server");
                retry.set_infinite_retries(false);
                true
            });
        }
        mailbox.start_pump(Duration::from_millis(5));

        control.set_server_state(ProcessState::Init);
        device.set_server_state(ProcessState::Init);

        tracing::info!(%guid, version = BRIDGE_VERSION, "server attached to session");
        Ok(Self {
            options,
            guid,
            retry,
            enabled: AtomicBool::new(true),
            control,
            device,
            response,
            present,
            heap,
            mailbox,
            uid_counter: AtomicU32::new(1),
            client_pid: AtomicU32::new(0),
            started: Instant::now(),
        })
    }

    pub fn guid(&self) -> SessionGuid {
        self.guid
    }

    pub fn client_pid(&self) -> u32 {
        self.client_pid.load(Ordering::Relaxed)
    }

    pub fn retry_flags(&self) -> &Arc<RetryFlags> {
        &self.retry
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Wait for a specific command at the head of `channel`, mirroring the
    /// client-side policy (foreign-header yield, infinite-retries relief).
    fn wait_for_command(
        &self,
        channel: &IpcChannel,
        wanted: Command,
        timeout: Duration,
    ) -> Result<CommandHeader> {
        let mut peek_timeout = self.retry.effective_timeout(timeout);
        let max_attempts = self.retry.effective_retries(self.options.command_retries);
        let mut infinite_mode = false;
        let mut attempts: u32 = 0;

        while attempts <= max_attempts && self.is_enabled() {
            match channel.ring().peek_wait(peek_timeout) {
                Some(header) if wanted == Command::Any || header.command == wanted => {
                    return Ok(header);
                }
                Some(header) => {
                    tracing::debug!(
                        got = header.command.name(),
                        wanted = wanted.name(),
                        "different command at queue head, yielding"
                    );
                    std::thread::sleep(peek_timeout.max(Duration::from_millis(1)));
                    attempts = attempts.saturating_add(1);
                }
                None => {
                    if self.retry.infinite_retries() {
                        peek_timeout = Duration::from_millis(1);
                        infinite_mode = true;
                        std::thread::sleep(Duration::from_millis(1));
                    } else if infinite_mode {
                        peek_timeout = self.retry.effective_timeout(timeout);
                        infinite_mode = false;
                    } else {
                        attempts = attempts.saturating_add(1);
                    }
                }
            }
        }
        Err(BridgeError::Timeout {
            what: "client command",
        })
    }

    /// Answer the Syn/Ack/Continue handshake. The Ack's handle carries the
    /// mailbox port so the client can attach its relay endpoint.
    pub fn handshake(&self) -> Result<()> {
        self.control.set_server_state(ProcessState::Handshaking);
        tracing::info!("waiting for connection from the client");

        let syn = self
            .wait_for_command(&self.control, Command::Syn, self.options.startup_timeout())
            .map_err(|_| {
                tracing::error!("no Syn from the client; was this process launched by one?");
                BridgeError::handshake("timed out waiting for Syn")
            })?;
        let _ = self.control.ring().try_pop();
        let _uid = self.control.data().pull_token();
        let sync_bits = self.control.data().pull_token();
        self.retry.apply_sync_bits(sync_bits);
        self.client_pid.store(syn.handle, Ordering::Relaxed);
        self.control.data().skip_to(syn.data_offset);
        self.control.consumer_publish();

        tracing::info!(client_pid = syn.handle, "Syn received, sending Ack");
        // The Ack payload is just the leading uid; the mailbox port rides
        // in the handle word.
        {
            let _ack = self.reply_writer(Command::Ack, self.mailbox.port());
        }

        let cont = self
            .wait_for_command(&self.control, Command::Continue, self.options.startup_timeout())
            .map_err(|_| {
                tracing::error!("client never sent the go-ahead Continue");
                BridgeError::handshake("timed out waiting for Continue")
            })?;
        let _ = self.control.ring().try_pop();
        let _uid = self.control.data().pull_token();
        self.control.data().skip_to(cont.data_offset);
        self.control.consumer_publish();

        self.control.set_server_state(ProcessState::Running);
        self.device.set_server_state(ProcessState::Running);
        tracing::info!("handshake complete, waiting for commands");
        Ok(())
    }

    fn reply_writer(&self, command: Command, handle: u32) -> ReplyWriter<'_> {
        self.services(&self.device).server_command(command, handle)
    }

    fn services<'a>(&'a self, channel: &'a IpcChannel) -> ServerServices<'a> {
        ServerServices {
            channel,
            response: &self.response,
            heap: self.heap.as_ref(),
            present: self.present.as_ref(),
            options: &self.options,
            retry: &self.retry,
            enabled: &self.enabled,
            uid_counter: &self.uid_counter,
        }
    }

    /// Pump commands until Terminate, client shutdown, or terminal
    /// failure. Device commands dominate; the control queue is drained
    /// opportunistically between them.
    pub fn run(&self, dispatcher: &mut dyn Dispatcher) -> Result<()> {
        let mut done = false;
        while !done && self.is_enabled() {
            // Module-scoped commands first; they are rare.
            while let Some(header) = self.control.ring().try_pop() {
                done |= self.process_command(&self.control, header, dispatcher)?;
            }
            if done {
                break;
            }

            match self.wait_for_command(&self.device, Command::Any, self.options.command_timeout())
            {
                Ok(header) => {
                    let _ = self.device.ring().try_pop();
                    done |= self.process_command(&self.device, header, dispatcher)?;
                }
                Err(_) => {
                    if self.control.client_state().is_shutting_down() {
                        tracing::info!("client is shutting down, leaving the command loop");
                    } else {
                        tracing::debug!(
                            "command loop exited without a Terminate; queue timed out"
                        );
                    }
                    break;
                }
            }
        }

        self.finish();
        Ok(())
    }

    /// Handle one popped command. Returns true for Terminate.
    fn process_command(
        &self,
        channel: &IpcChannel,
        header: CommandHeader,
        dispatcher: &mut dyn Dispatcher,
    ) -> Result<bool> {
        let uid = channel.data().pull_token();
        let mut terminate = false;

        match header.command {
            Command::Terminate => {
                tracing::info!("terminate received");
                terminate = true;
            }
            Command::SharedHeapAddSeg => {
                let size = channel.data().pull_token();
                match &self.heap {
                    Some(heap) => heap.lock().register_segment(size),
                    None => tracing::error!("AddSeg with the shared heap disabled"),
                }
            }
            Command::SharedHeapAlloc => {
                let segment = channel.data().pull_token();
                let first_chunk = channel.data().pull_token();
                let chunk_count = channel.data().pull_token();
                match &self.heap {
                    Some(heap) => heap.lock().apply_alloc(
                        header.handle,
                        AllocRun {
                            segment,
                            first_chunk,
                            chunk_count,
                        },
                    ),
                    None => tracing::error!("Alloc with the shared heap disabled"),
                }
            }
            Command::SharedHeapDealloc => {
                if let Some(heap) = &self.heap {
                    if let Err(err) = heap.lock().apply_dealloc(header.handle) {
                        tracing::error!(%err, "shared heap dealloc failed");
                        self.enabled.store(false, Ordering::Release);
                    }
                }
            }
            Command::DebugMessage => {
                let value = channel.data().pull_token();
                let text = channel.data().pull_bytes();
                tracing::debug!(value, text = %String::from_utf8_lossy(&text), "debug message");
            }
            Command::Invalid
            | Command::Syn
            | Command::Ack
            | Command::Continue
            | Command::Any
            | Command::Response => {
                tracing::warn!(
                    command = header.command.name(),
                    "unexpected command in steady state"
                );
            }
            Command::UnlinkResource | Command::Api(_) => {
                let mut services = self.services(channel);
                dispatcher.dispatch(&mut services, header, uid)?;
            }
        }

        // Resynchronize: whatever payload the handler left unread is
        // skipped so the next command starts aligned.
        if channel.data().pos() != header.data_offset {
            tracing::warn!(
                command = header.command.name(),
                pos = channel.data().pos(),
                expected = header.data_offset,
                "payload not fully consumed, fast-forwarding"
            );
            channel.data().skip_to(header.data_offset);
        }
        channel.consumer_publish();

        Ok(terminate)
    }

    /// Post-loop teardown: publish the draining states, acknowledge the
    /// client, and log uptime.
    fn finish(&self) {
        self.control.set_server_state(ProcessState::DoneProcessing);
        self.device.set_server_state(ProcessState::DoneProcessing);

        {
            let _ack = self.reply_writer(Command::Ack, 0);
        }

        self.control.set_server_state(ProcessState::Exited);
        self.device.set_server_state(ProcessState::Exited);
        tracing::info!(
            uptime_secs = self.started.elapsed().as_secs(),
            "server command processing finished"
        );
    }
}
