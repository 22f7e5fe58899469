//! The bridge context: one explicitly-constructed value owning every piece
//! of client-side bridge state, threaded through the system instead of
//! process globals.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pontoon_core::session::{object_name, ObjectRole, SessionGuid};
use pontoon_core::{
    BridgeError, BridgeOptions, Command, CommandHistory, Flags, ProcessState, Result, RetryFlags,
    BRIDGE_VERSION,
};
use pontoon_shm::{
    ChannelGeometry, ChannelSide, IpcChannel, MessageEndpoint, NamedSemaphore, SharedHeap,
    WM_KILLFOCUS, WM_SETFOCUS,
};

use crate::command::CommandWriter;
use crate::process::ServerProcess;

/// Client-side bridge state. One per session, alive for the process
/// duration.
pub struct BridgeContext {
    options: BridgeOptions,
    guid: SessionGuid,
    retry: Arc<RetryFlags>,
    enabled: AtomicBool,

    /// Client → server, handshake and module-scoped commands.
    control: IpcChannel,
    /// Client → server, per-frame commands.
    device: IpcChannel,
    /// Server → client, responses and asynchronous events.
    response: IpcChannel,

    present: Option<NamedSemaphore>,
    heap: Option<Mutex<SharedHeap>>,

    uid_counter: AtomicU32,
    history: Mutex<CommandHistory>,
    /// Single-instance guard for the scoped command transaction.
    pub(crate) command_active: AtomicBool,

    server: Mutex<Option<ServerProcess>>,
    mailbox: Mutex<Option<Arc<MessageEndpoint>>>,
}

impl BridgeContext {
    /// Create the session: all three arenas and the present semaphore come
    /// into existence here, before the server process is spawned.
    pub fn new(options: BridgeOptions) -> Result<Arc<Self>> {
        let guid = SessionGuid::generate();
        Self::with_guid(options, guid)
    }

    pub fn with_guid(options: BridgeOptions, guid: SessionGuid) -> Result<Arc<Self>> {
        let control = IpcChannel::create(
            guid,
            "control",
            ChannelGeometry::with_budget(
                options.module_client_cmd_queue_size,
                options.module_client_data_queue_size,
                options.module_client_channel_mem_size,
            ),
            ChannelSide::Producer,
        )?;
        let device = IpcChannel::create(
            guid,
            "device",
            ChannelGeometry::with_budget(
                options.client_cmd_queue_size,
                options.client_data_queue_size,
                options.client_channel_mem_size,
            ),
            ChannelSide::Producer,
        )?;
        let response = IpcChannel::create(
            guid,
            "response",
            ChannelGeometry::with_budget(
                options.server_cmd_queue_size,
                options.server_data_queue_size,
                options.server_channel_mem_size,
            ),
            ChannelSide::Consumer,
        )?;

        let present = if options.present_semaphore_enabled {
            Some(NamedSemaphore::create(
                &object_name(guid, ObjectRole::Semaphore, "present"),
                options.present_semaphore_max_frames,
                options.present_semaphore_max_frames,
            )?)
        } else {
            None
        };

        let heap = if options.use_shared_heap {
            Some(Mutex::new(SharedHeap::create(
                guid,
                options.shared_heap_chunk_size,
                options.shared_heap_default_segment_size,
            )?))
        } else {
            None
        };

        control.set_client_state(ProcessState::Init);
        device.set_client_state(ProcessState::Init);
        response.set_client_state(ProcessState::Init);

        tracing::info!(%guid, version = BRIDGE_VERSION, "bridge context created");
        Ok(Arc::new(Self {
            options,
            guid,
            retry: RetryFlags::new(),
            enabled: AtomicBool::new(true),
            control,
            device,
            response,
            present,
            heap,
            uid_counter: AtomicU32::new(1),
            history: Mutex::new(CommandHistory::new()),
            command_active: AtomicBool::new(false),
            server: Mutex::new(None),
            mailbox: Mutex::new(None),
        }))
    }

    pub fn guid(&self) -> SessionGuid {
        self.guid
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    pub fn retry_flags(&self) -> &Arc<RetryFlags> {
        &self.retry
    }

    pub fn device_channel(&self) -> &IpcChannel {
        &self.device
    }

    pub fn response_channel(&self) -> &IpcChannel {
        &self.response
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Terminal failure: stop emitting commands, dump the recent command
    /// history once, and let the host fall back to its own rendering.
    pub fn disable(&self, reason: &str) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            tracing::error!(reason, "disabling bridge");
            self.history.lock().dump();
        }
    }

    pub(crate) fn next_uid(&self) -> u32 {
        self.uid_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn record_command(&self, uid: u32, command: Command) {
        self.history.lock().record(uid, command);
    }

    /// Open a scoped command transaction on the device channel.
    pub fn command(&self, command: Command, handle: u32, flags: Flags) -> CommandWriter<'_> {
        CommandWriter::new(self, &self.device, command, handle, flags)
    }

    /// Open a scoped command transaction on the control channel.
    pub fn control_command(&self, command: Command, handle: u32, flags: Flags) -> CommandWriter<'_> {
        CommandWriter::new(self, &self.control, command, handle, flags)
    }

    /// Launch the server and run the Syn/Ack/Continue handshake. On any
    /// failure the bridge is disabled and a handshake error returned.
    pub fn start_server(self: &Arc<Self>, executable: &Path, game_args: &[String]) -> Result<()> {
        {
            let mut server = self.server.lock();
            if server.is_some() {
                return Ok(());
            }
            tracing::info!(guid = %self.guid, exe = %executable.display(), "launching bridge server");
            let ctx = Arc::downgrade(self);
            let process = ServerProcess::spawn(
                executable,
                self.guid,
                game_args,
                Box::new(move |status| {
                    if let Some(ctx) = ctx.upgrade() {
                        ctx.on_server_exited(status);
                    }
                }),
            )?;
            *server = Some(process);
        }
        self.handshake()
    }

    fn on_server_exited(&self, status: Option<i32>) {
        self.control.set_server_state(ProcessState::Exited);
        self.device.set_server_state(ProcessState::Exited);
        if self.control.client_state() != ProcessState::DoneProcessing {
            tracing::error!(
                exit_code = status,
                "the server process exited unexpectedly; shutting the bridge down until relaunch"
            );
        }
        self.disable("server process exited");
    }

    /// The Syn/Ack/Continue sequence. Normally run by `start_server` right
    /// after the spawn; callable directly when the server is hosted some
    /// other way (tests, embedding).
    pub fn handshake(self: &Arc<Self>) -> Result<()> {
        self.control.set_server_state(ProcessState::Init);
        self.control.set_client_state(ProcessState::Handshaking);

        tracing::info!("sending Syn, waiting for Ack from server");
        {
            let mut syn = self.control_command(Command::Syn, std::process::id(), Flags::empty());
            syn.send_token(self.retry.sync_bits());
        }

        let ack = match self.wait_for_command(
            &self.response,
            Command::Ack,
            self.options.startup_timeout(),
        ) {
            Ok(header) => header,
            Err(err) => {
                tracing::error!("no Ack from server; was it launched by this process?");
                self.control.set_server_state(ProcessState::DoneProcessing);
                self.disable("handshake ack missing");
                return Err(err);
            }
        };
        // Consume the Ack and its (uid-only) payload.
        self.discard_consumed(&self.response, ack);

        let mut mailbox = MessageEndpoint::open(self.guid, ack.handle)?;
        self.install_focus_relay(&mailbox);
        mailbox.start_pump(Duration::from_millis(5));
        *self.mailbox.lock() = Some(Arc::new(mailbox));

        self.control.set_server_state(ProcessState::Handshaking);
        tracing::info!("Ack received, sending Continue");
        {
            let _cont = self.control_command(Command::Continue, 0, Flags::empty());
        }

        self.control.set_client_state(ProcessState::Running);
        self.control.set_server_state(ProcessState::Running);
        self.device.set_client_state(ProcessState::Running);
        tracing::info!("handshake complete");
        Ok(())
    }

    fn install_focus_relay(&self, mailbox: &MessageEndpoint) {
        // Focus events flip the retry policy locally; the window-proc shim
        // calls notify_focus which also forwards them to the server.
        let retry = self.retry.clone();
        mailbox.register_handler(WM_KILLFOCUS, move |_, _| {
            retry.set_infinite_retries(true);
            true
        });
        let retry = self.retry.clone();
        mailbox.register_handler(WM_SETFOCUS, move |_, _| {
            retry.set_infinite_retries(false);
            true
        });
    }

    /// Focus change observed by the host window procedure. Adjusts the
    /// local retry policy and relays the event to the server.
    pub fn notify_focus(&self, focused: bool) {
        if focused {
            tracing::info!("window active again, restoring timeouts");
            self.retry.set_infinite_retries(false);
        } else {
            tracing::info!("window inactive, switching to infinite retries");
            self.retry.set_infinite_retries(true);
        }
        if let Some(mailbox) = self.mailbox.lock().as_ref() {
            let msg = if focused { WM_SETFOCUS } else { WM_KILLFOCUS };
            mailbox.send(msg, 0, 0);
        }
    }

    /// Wait for a specific command to appear at the head of `channel`,
    /// tolerating foreign headers by yielding to the peer. Honors the
    /// infinite-retries mode with a relieved 1ms poll.
    pub fn wait_for_command(
        &self,
        channel: &IpcChannel,
        wanted: Command,
        timeout: Duration,
    ) -> Result<pontoon_core::CommandHeader> {
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
                        // Peer may be alt-tabbed; relieve the spin and do
                        // not burn the attempt budget.
                        peek_timeout = Duration::from_millis(1);
                        infinite_mode = true;
                        std::thread::sleep(Duration::from_millis(1));
                    } else if infinite_mode {
                        // Mode revoked; restore the configured timeout.
                        peek_timeout = self.retry.effective_timeout(timeout);
                        infinite_mode = false;
                    } else {
                        attempts = attempts.saturating_add(1);
                    }
                }
            }
        }
        Err(BridgeError::Timeout {
            what: "peer command",
        })
    }

    /// Pop a header we already peeked and drop its payload, leaving the
    /// consumer cursor in sync.
    pub fn discard_consumed(&self, channel: &IpcChannel, header: pontoon_core::CommandHeader) {
        let popped = channel.ring().try_pop();
        debug_assert!(popped.is_some());
        channel.data().skip_to(header.data_offset);
        channel.consumer_publish();
    }

    /// Wait for the response correlated with `uid`. The returned guard
    /// exposes the payload and resynchronizes the response channel when
    /// dropped.
    pub fn wait_for_response(&self, uid: u32) -> Result<ResponseGuard<'_>> {
        let header =
            self.wait_for_command(&self.response, Command::Response, self.options.ack_timeout())?;
        let _ = self.response.ring().try_pop();
        let response_uid = self.response.data().pull_token();
        if response_uid != uid {
            // Out-of-order response is a broken correlation contract.
            self.response.data().skip_to(header.data_offset);
            self.response.consumer_publish();
            self.disable("response uid mismatch");
            return Err(BridgeError::protocol(format!(
                "response uid {response_uid} does not match request {uid}"
            )));
        }
        Ok(ResponseGuard {
            ctx: self,
            header,
            finished: false,
        })
    }

    /// Bounded wait for the consumer to drain a producer channel, used
    /// before teardown.
    pub fn ensure_queue_empty(&self, channel: &IpcChannel) -> Result<()> {
        if channel.ring().is_empty() {
            return Ok(());
        }
        let max_attempts = self.retry.effective_retries(self.options.command_retries);
        let mut attempts: u32 = 0;
        while attempts <= max_attempts && self.is_enabled() {
            if channel.ring().is_empty() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(8));
            attempts = attempts.saturating_add(1);
        }
        Err(BridgeError::Timeout {
            what: "queue drain",
        })
    }

    /// Acquire one present slot, bounding how many frames the client may
    /// run ahead of the server.
    pub fn begin_present(&self) -> Result<()> {
        let Some(present) = &self.present else {
            return Ok(());
        };
        if !self.is_enabled() {
            return Err(BridgeError::Disabled { what: "present" });
        }
        let timeout = self.retry.effective_timeout(self.options.default_command_patience());
        match present.wait(timeout) {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.disable("present semaphore starved");
                Err(BridgeError::Timeout {
                    what: "present semaphore",
                })
            }
            Err(err) => {
                self.disable("present semaphore failed");
                Err(BridgeError::Os(err))
            }
        }
    }

    /// The relay mailbox, once the handshake has attached it.
    pub fn mailbox(&self) -> Option<Arc<MessageEndpoint>> {
        self.mailbox.lock().clone()
    }

    /// Shared heap accessor; `None` when the heap is disabled by options.
    pub fn heap(&self) -> Option<&Mutex<SharedHeap>> {
        self.heap.as_ref()
    }

    /// Allocate from the shared heap, growing it (and emitting the AddSeg
    /// command) when no segment has room, then waiting for in-flight
    /// deallocations as a last resort.
    pub fn heap_allocate(&self, nbytes: u32) -> Result<pontoon_shm::AllocId> {
        let heap = self
            .heap
            .as_ref()
            .ok_or_else(|| BridgeError::protocol("shared heap disabled by configuration"))?;

        let mut heap = heap.lock();
        let found = heap.try_allocate(nbytes).or_else(|| {
            match heap.add_segment() {
                Ok((_, size)) => {
                    let mut cmd =
                        self.command(Command::SharedHeapAddSeg, 0, Flags::empty());
                    cmd.send_token(size);
                    drop(cmd);
                }
                Err(err) => {
                    tracing::error!(%err, "failed to grow the shared heap");
                }
            }
            heap.allocate_waiting(
                nbytes,
                Duration::from_secs(self.options.shared_heap_free_chunk_wait_timeout_secs as u64),
            )
        });

        let Some((id, run)) = found else {
            return Err(BridgeError::Timeout {
                what: "free shared heap chunks",
            });
        };

        let mut cmd = self.command(Command::SharedHeapAlloc, id, Flags::empty());
        cmd.send_many(&[run.segment, run.first_chunk, run.chunk_count]);
        drop(cmd);
        Ok(id)
    }

    /// Release a shared-heap allocation. The chunks return to the bitmap
    /// once the server processes the Dealloc command, after every prior
    /// use of the id.
    pub fn heap_deallocate(&self, id: pontoon_shm::AllocId) {
        let Some(heap) = self.heap.as_ref() else {
            return;
        };
        if heap.lock().release(id).is_none() {
            tracing::warn!(id, "deallocating unknown shared heap id");
            return;
        }
        let cmd = self.command(Command::SharedHeapDealloc, id, Flags::empty());
        drop(cmd);
    }

    /// Orderly teardown: Terminate → Ack → reap the server process.
    pub fn shutdown(&self) -> Result<()> {
        self.control.set_client_state(ProcessState::DoneProcessing);
        self.device.set_client_state(ProcessState::DoneProcessing);

        if self.is_enabled() {
            {
                let _term = self.command(Command::Terminate, 0, Flags::empty());
            }
            match self.wait_for_command(
                &self.response,
                Command::Ack,
                self.options.command_timeout(),
            ) {
                Ok(header) => self.discard_consumed(&self.response, header),
                Err(err) => tracing::warn!(%err, "no Ack for Terminate"),
            }
        }

        if let Some(server) = self.server.lock().take() {
            server.shutdown(self.options.command_timeout());
        }
        self.control.set_client_state(ProcessState::Exited);
        self.device.set_client_state(ProcessState::Exited);
        Ok(())
    }
}

/// Borrow of a correlated response's payload. Dropping it fast-forwards
/// the data queue to the response's end offset and publishes the consumer
/// position.
pub struct ResponseGuard<'a> {
    ctx: &'a BridgeContext,
    header: pontoon_core::CommandHeader,
    finished: bool,
}

impl ResponseGuard<'_> {
    /// The response's auxiliary handle word.
    pub fn handle(&self) -> u32 {
        self.header.handle
    }

    pub fn pull_token(&mut self) -> u32 {
        self.ctx.response.data().pull_token()
    }

    pub fn pull_bytes(&mut self) -> Vec<u8> {
        self.ctx.response.data().pull_bytes()
    }
}

impl Drop for ResponseGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.ctx.response.data().skip_to(self.header.data_offset);
            self.ctx.response.consumer_publish();
            self.finished = true;
        }
    }
}
