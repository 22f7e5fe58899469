//! The scoped command transaction.
//!
//! A `CommandWriter` is one in-flight command on a producer channel. On
//! construction it opens a data-queue batch and stamps the per-command
//! UID; `send_*` calls write payload tokens, each preceded by the
//! overrun-avoidance sync; dropping it closes the batch and pushes the
//! finalized header into the command ring under the retry policy.
//!
//! Exactly one writer may be alive per producer. Overlapping writers would
//! interleave their payloads and corrupt the framing, so the constructor
//! panics on nesting; that is a bug in the caller, not a runtime
//! condition.
//!
//! If the bridge is disabled while the writer is open (server death is
//! asynchronous), the partial batch is abandoned and no header is pushed.

use std::sync::atomic::Ordering;
use std::time::Duration;

use pontoon_core::{Command, CommandHeader, Flags};
use pontoon_shm::{IpcChannel, PushOutcome, SyncOutcome};

use crate::context::BridgeContext;
use crate::nesting::CallScope;

pub struct CommandWriter<'a> {
    ctx: &'a BridgeContext,
    channel: &'a IpcChannel,
    command: Command,
    flags: Flags,
    handle: u32,
    uid: u32,
    /// Set when a send hit a fatal sync outcome; suppresses the header.
    poisoned: bool,
    _scope: CallScope,
}

impl<'a> CommandWriter<'a> {
    pub(crate) fn new(
        ctx: &'a BridgeContext,
        channel: &'a IpcChannel,
        command: Command,
        handle: u32,
        flags: Flags,
    ) -> Self {
        if ctx.command_active.swap(true, Ordering::AcqRel) {
            // See module docs: nesting corrupts payload framing.
            panic!("overlapping CommandWriter scopes on one producer");
        }

        let uid = ctx.next_uid();
        ctx.record_command(uid, command);

        let mut writer = Self {
            ctx,
            channel,
            command,
            flags,
            handle,
            uid,
            poisoned: false,
            _scope: CallScope::enter(),
        };
        if ctx.is_enabled() {
            channel.data().begin_batch();
            writer.push_synced_token(uid);
        }
        writer
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    fn sync_timeout(&self) -> Duration {
        self.ctx
            .retry_flags()
            .effective_timeout(self.ctx.options().command_timeout())
    }

    fn sync_retries(&self) -> u32 {
        self.ctx
            .retry_flags()
            .effective_retries(self.ctx.options().command_retries)
    }

    /// Run the producer sync for `words` and report whether the write may
    /// proceed.
    fn sync(&mut self, words: u32, reset_on_wrap: bool) -> bool {
        match self
            .channel
            .producer_sync(words, reset_on_wrap, self.sync_timeout(), self.sync_retries())
        {
            SyncOutcome::Clear | SyncOutcome::Resolved => true,
            SyncOutcome::TimedOut => {
                self.poisoned = true;
                self.ctx.disable("consumer never freed data queue space");
                false
            }
            SyncOutcome::BatchTooLarge => {
                self.poisoned = true;
                self.ctx.disable("command payload larger than the data queue");
                false
            }
        }
    }

    fn push_synced_token(&mut self, value: u32) {
        if self.sync(1, false) {
            self.channel.data().push_token(value);
        }
    }

    /// Append one payload token.
    pub fn send_token(&mut self, value: u32) {
        if self.ctx.is_enabled() && !self.poisoned {
            self.push_synced_token(value);
        }
    }

    /// Append several tokens as one synced unit.
    pub fn send_many(&mut self, values: &[u32]) {
        if !self.ctx.is_enabled() || self.poisoned || values.is_empty() {
            return;
        }
        if self.sync(values.len() as u32, false) {
            for &value in values {
                self.channel.data().push_token(value);
            }
        }
    }

    /// Append a length-framed byte blob.
    pub fn send_bytes(&mut self, bytes: &[u8]) {
        if !self.ctx.is_enabled() || self.poisoned {
            return;
        }
        let words = self.channel.data().blob_words(bytes.len() as u32);
        if self.sync(words, true) {
            if let Err(err) = self.channel.data().push_bytes(bytes) {
                tracing::error!(%err, "blob rejected by data queue");
                self.poisoned = true;
                self.ctx.disable("oversized payload blob");
            }
        }
    }
}

impl Drop for CommandWriter<'_> {
    fn drop(&mut self) {
        // Runs on every exit path from the command scope; the bridge
        // disable cases abandon the batch instead of publishing a header.
        let commit = self.ctx.is_enabled() && !self.poisoned;
        if !commit {
            self.channel.data().abandon_batch();
            self.ctx.command_active.store(false, Ordering::Release);
            return;
        }

        let data_offset = self.channel.data().end_batch();
        let header = CommandHeader::new(self.command, self.flags, data_offset, self.handle);

        let timeout = self.sync_timeout();
        let retries = self.sync_retries();
        let mut attempts: u32 = 0;
        loop {
            // The server may shut down or die while we retry.
            if self.channel.server_state().is_shutting_down() {
                tracing::warn!(
                    command = self.command.name(),
                    "server is shutting down, dropping command and disabling the bridge"
                );
                self.ctx.disable("server reached shutdown before command");
                break;
            }
            if !self.ctx.is_enabled() {
                break;
            }
            match self.channel.ring().push_wait(header, timeout) {
                PushOutcome::Pushed => {
                    if attempts > 0 {
                        tracing::debug!(
                            command = self.command.name(),
                            attempts,
                            "command pushed after retries"
                        );
                    }
                    break;
                }
                PushOutcome::TimedOut => {
                    attempts = attempts.saturating_add(1);
                    if attempts > retries {
                        tracing::error!(
                            command = self.command.name(),
                            "command could not be sent, disabling bridge and falling back \
                             to client rendering"
                        );
                        self.ctx.disable("command push retries exhausted");
                        break;
                    }
                }
            }
        }

        self.ctx.command_active.store(false, Ordering::Release);
    }
}
