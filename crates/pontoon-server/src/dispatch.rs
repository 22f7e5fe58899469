//! The dispatcher seam and the server-side reply writer.
//!
//! The dispatcher is the large transported-API switch; it lives outside
//! this crate and sees commands through the [`Dispatcher`] trait. The
//! runtime hands it a [`ServerServices`] value with everything a handler
//! may need: the payload reader, reply construction, shared-heap access,
//! and the present-semaphore release.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use pontoon_core::{
    BridgeOptions, Command, CommandHeader, Flags, Result, RetryFlags,
};
use pontoon_shm::{IpcChannel, NamedSemaphore, PushOutcome, SharedHeap};

/// Commands the runtime does not handle internally are passed here.
pub trait Dispatcher {
    /// Handle one transported-API command. The payload is read through
    /// `services.data()`; any unread remainder is skipped by the runtime
    /// afterwards using the header's `data_offset`.
    fn dispatch(
        &mut self,
        services: &mut ServerServices<'_>,
        header: CommandHeader,
        uid: u32,
    ) -> Result<()>;
}

/// Runtime facilities exposed to the dispatcher for one command.
pub struct ServerServices<'a> {
    /// The channel the current command arrived on.
    pub(crate) channel: &'a IpcChannel,
    pub(crate) response: &'a IpcChannel,
    pub(crate) heap: Option<&'a Mutex<SharedHeap>>,
    pub(crate) present: Option<&'a NamedSemaphore>,
    pub(crate) options: &'a BridgeOptions,
    pub(crate) retry: &'a Arc<RetryFlags>,
    pub(crate) enabled: &'a AtomicBool,
    pub(crate) uid_counter: &'a AtomicU32,
}

impl<'a> ServerServices<'a> {
    /// Payload reader for the command being dispatched.
    pub fn data(&self) -> &pontoon_shm::DataQueue {
        self.channel.data()
    }

    /// Shared heap, when the session runs with one.
    pub fn heap(&self) -> Option<&Mutex<SharedHeap>> {
        self.heap
    }

    /// Copy a heap-resident payload referenced by `alloc_id`.
    pub fn heap_bytes(&self, alloc_id: u32, offset: usize, len: usize) -> Result<Vec<u8>> {
        let heap = self.heap.ok_or_else(|| {
            pontoon_core::BridgeError::protocol("heap payload but shared heap disabled")
        })?;
        heap.lock().read(alloc_id, offset, len)
    }

    /// Release one present slot; called after the renderer finished a
    /// present so the client may run another frame ahead.
    pub fn finish_present(&self) {
        if let Some(present) = self.present {
            if let Err(err) = present.release(1) {
                tracing::error!(%err, "present semaphore release failed");
            }
        }
    }

    /// Open a `Response` correlated with the request `uid`.
    pub fn reply(&self, uid: u32) -> ReplyWriter<'a> {
        ReplyWriter::new(
            self.response,
            self.options,
            self.retry,
            self.enabled,
            Command::Response,
            uid,
            0,
        )
    }

    /// Open an arbitrary server → client command (asynchronous events).
    pub fn server_command(&self, command: Command, handle: u32) -> ReplyWriter<'a> {
        let uid = self.uid_counter.fetch_add(1, Ordering::Relaxed);
        ReplyWriter::new(
            self.response,
            self.options,
            self.retry,
            self.enabled,
            command,
            uid,
            handle,
        )
    }
}

/// Server-side scoped command: the producer discipline of the client's
/// `CommandWriter`, applied to the response channel. On drop the batch is
/// closed and the header pushed under the retry policy; failures disable
/// the bridge (producer side).
pub struct ReplyWriter<'a> {
    channel: &'a IpcChannel,
    options: &'a BridgeOptions,
    retry: &'a Arc<RetryFlags>,
    enabled: &'a AtomicBool,
    command: Command,
    handle: u32,
    poisoned: bool,
}

impl<'a> ReplyWriter<'a> {
    fn new(
        channel: &'a IpcChannel,
        options: &'a BridgeOptions,
        retry: &'a Arc<RetryFlags>,
        enabled: &'a AtomicBool,
        command: Command,
        uid: u32,
        handle: u32,
    ) -> Self {
        let mut writer = Self {
            channel,
            options,
            retry,
            enabled,
            command,
            handle,
            poisoned: false,
        };
        if writer.enabled.load(Ordering::Acquire) {
            channel.data().begin_batch();
            writer.send_token(uid);
        }
        writer
    }

    /// Override the auxiliary handle word.
    pub fn set_handle(&mut self, handle: u32) {
        self.handle = handle;
    }

    fn sync(&mut self, words: u32, reset_on_wrap: bool) -> bool {
        let timeout = self.retry.effective_timeout(self.options.command_timeout());
        let retries = self.retry.effective_retries(self.options.command_retries);
        match self.channel.producer_sync(words, reset_on_wrap, timeout, retries) {
            pontoon_shm::SyncOutcome::Clear | pontoon_shm::SyncOutcome::Resolved => true,
            outcome => {
                tracing::error!(?outcome, "reply payload sync failed, disabling bridge");
                self.poisoned = true;
                self.enabled.store(false, Ordering::Release);
                false
            }
        }
    }

    pub fn send_token(&mut self, value: u32) {
        if self.enabled.load(Ordering::Acquire) && !self.poisoned && self.sync(1, false) {
            self.channel.data().push_token(value);
        }
    }

    pub fn send_many(&mut self, values: &[u32]) {
        if !self.enabled.load(Ordering::Acquire) || self.poisoned || values.is_empty() {
            return;
        }
        if self.sync(values.len() as u32, false) {
            for &value in values {
                self.channel.data().push_token(value);
            }
        }
    }

    pub fn send_bytes(&mut self, bytes: &[u8]) {
        if !self.enabled.load(Ordering::Acquire) || self.poisoned {
            return;
        }
        let words = self.channel.data().blob_words(bytes.len() as u32);
        if self.sync(words, true) {
            if let Err(err) = self.channel.data().push_bytes(bytes) {
                tracing::error!(%err, "reply blob rejected by data queue");
                self.poisoned = true;
                self.enabled.store(false, Ordering::Release);
            }
        }
    }
}

impl Drop for ReplyWriter<'_> {
    fn drop(&mut self) {
        if !self.enabled.load(Ordering::Acquire) || self.poisoned {
            self.channel.data().abandon_batch();
            return;
        }
        let data_offset = self.channel.data().end_batch();
        let header = CommandHeader::new(self.command, Flags::empty(), data_offset, self.handle);

        let timeout = self.retry.effective_timeout(self.options.command_timeout());
        let retries = self.retry.effective_retries(self.options.command_retries);
        let mut attempts: u32 = 0;
        loop {
            match self.channel.ring().push_wait(header, timeout) {
                PushOutcome::Pushed => break,
                PushOutcome::TimedOut => {
                    attempts = attempts.saturating_add(1);
                    if attempts > retries || !self.enabled.load(Ordering::Acquire) {
                        tracing::error!(
                            command = self.command.name(),
                            "response could not be pushed, disabling bridge"
                        );
                        self.enabled.store(false, Ordering::Release);
                        break;
                    }
                }
            }
        }
    }
}
