//! Bridge configuration.
//!
//! Options are read once from a `key = value` config file (when present)
//! and cached; everything is defaulted so the bridge runs with no file at
//! all. The two runtime-mutable knobs (timeouts-disabled and
//! infinite-retries) live in [`RetryFlags`] because focus events flip
//! them while the bridge is running.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared-heap routing policy bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedHeapPolicy(pub u32);

impl SharedHeapPolicy {
    pub const TEXTURES: SharedHeapPolicy = SharedHeapPolicy(1 << 0);
    pub const DYNAMIC_BUFFERS: SharedHeapPolicy = SharedHeapPolicy(1 << 1);
    pub const STATIC_BUFFERS: SharedHeapPolicy = SharedHeapPolicy(1 << 2);
    pub const NONE: SharedHeapPolicy = SharedHeapPolicy(0);
    pub const ALL: SharedHeapPolicy = SharedHeapPolicy(0b111);

    pub const fn contains(self, other: SharedHeapPolicy) -> bool {
        self.0 & other.0 == other.0
    }
}

/// The full option surface, all defaulted.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    // Control (module) channel geometry.
    pub module_client_channel_mem_size: u32,
    pub module_client_cmd_queue_size: u32,
    pub module_client_data_queue_size: u32,
    pub module_server_channel_mem_size: u32,
    pub module_server_cmd_queue_size: u32,
    pub module_server_data_queue_size: u32,

    // Device channel geometry.
    pub client_channel_mem_size: u32,
    pub client_cmd_queue_size: u32,
    pub client_data_queue_size: u32,
    pub server_channel_mem_size: u32,
    pub server_cmd_queue_size: u32,
    pub server_data_queue_size: u32,

    // Blocking budgets, in milliseconds.
    pub command_timeout_ms: u32,
    pub startup_timeout_ms: u32,
    pub ack_timeout_ms: u32,
    pub command_retries: u32,

    // Response policy.
    pub send_read_only_calls: bool,
    pub send_all_server_responses: bool,
    pub send_create_function_server_responses: bool,

    // Present semaphore.
    pub present_semaphore_max_frames: u32,
    pub present_semaphore_enabled: bool,

    // Shared heap.
    pub use_shared_heap: bool,
    pub shared_heap_policy: SharedHeapPolicy,
    pub shared_heap_default_segment_size: u32,
    pub shared_heap_chunk_size: u32,
    pub shared_heap_free_chunk_wait_timeout_secs: u32,
    pub always_copy_entire_static_buffer: bool,

    pub log_level: tracing::Level,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            module_client_channel_mem_size: 4 << 20,
            module_client_cmd_queue_size: 8,
            module_client_data_queue_size: 64 << 10,
            module_server_channel_mem_size: 4 << 20,
            module_server_cmd_queue_size: 8,
            module_server_data_queue_size: 64 << 10,

            client_channel_mem_size: 96 << 20,
            client_cmd_queue_size: 4 << 10,
            client_data_queue_size: 64 << 20,
            server_channel_mem_size: 32 << 20,
            server_cmd_queue_size: 16,
            server_data_queue_size: 1 << 20,

            command_timeout_ms: 1_000,
            startup_timeout_ms: 100,
            ack_timeout_ms: 10,
            command_retries: 300,

            send_read_only_calls: false,
            send_all_server_responses: false,
            send_create_function_server_responses: true,

            present_semaphore_max_frames: 3,
            present_semaphore_enabled: true,

            use_shared_heap: false,
            shared_heap_policy: SharedHeapPolicy::ALL,
            shared_heap_default_segment_size: 128 << 20,
            shared_heap_chunk_size: 4 << 10,
            shared_heap_free_chunk_wait_timeout_secs: 10,
            always_copy_entire_static_buffer: false,

            log_level: tracing::Level::INFO,
        }
    }
}

impl BridgeOptions {
    /// Load options from a `key = value` file, falling back to defaults for
    /// anything absent or malformed. A missing file yields pure defaults.
    pub fn load(path: &Path) -> Self {
        let mut options = Self::default();
        let Ok(text) = std::fs::read_to_string(path) else {
            tracing::debug!(path = %path.display(), "no bridge config file, using defaults");
            return options;
        };

        let mut values = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                values.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        fn get<T: FromStr>(values: &HashMap<String, String>, key: &str, default: T) -> T {
            match values.get(key) {
                Some(raw) => raw.parse().unwrap_or_else(|_| {
                    tracing::warn!(key, raw = raw.as_str(), "unparsable option, using default");
                    default
                }),
                None => default,
            }
        }

        options.module_client_channel_mem_size = get(
            &values,
            "moduleClientChannelMemSize",
            options.module_client_channel_mem_size,
        );
        options.module_client_cmd_queue_size = get(
            &values,
            "moduleClientCmdQueueSize",
            options.module_client_cmd_queue_size,
        );
        options.module_client_data_queue_size = get(
            &values,
            "moduleClientDataQueueSize",
            options.module_client_data_queue_size,
        );
        options.module_server_channel_mem_size = get(
            &values,
            "moduleServerChannelMemSize",
            options.module_server_channel_mem_size,
        );
        options.module_server_cmd_queue_size = get(
            &values,
            "moduleServerCmdQueueSize",
            options.module_server_cmd_queue_size,
        );
        options.module_server_data_queue_size = get(
            &values,
            "moduleServerDataQueueSize",
            options.module_server_data_queue_size,
        );
        options.client_channel_mem_size =
            get(&values, "clientChannelMemSize", options.client_channel_mem_size);
        options.client_cmd_queue_size =
            get(&values, "clientCmdQueueSize", options.client_cmd_queue_size);
        options.client_data_queue_size =
            get(&values, "clientDataQueueSize", options.client_data_queue_size);
        options.server_channel_mem_size =
            get(&values, "serverChannelMemSize", options.server_channel_mem_size);
        options.server_cmd_queue_size =
            get(&values, "serverCmdQueueSize", options.server_cmd_queue_size);
        options.server_data_queue_size =
            get(&values, "serverDataQueueSize", options.server_data_queue_size);
        options.command_timeout_ms = get(&values, "commandTimeout", options.command_timeout_ms);
        options.startup_timeout_ms = get(&values, "startupTimeout", options.startup_timeout_ms);
        options.ack_timeout_ms = get(&values, "ackTimeout", options.ack_timeout_ms);
        options.command_retries = get(&values, "commandRetries", options.command_retries);
        options.send_read_only_calls =
            get(&values, "sendReadOnlyCalls", options.send_read_only_calls);
        options.send_all_server_responses = get(
            &values,
            "sendAllServerResponses",
            options.send_all_server_responses,
        );
        options.send_create_function_server_responses = get(
            &values,
            "sendCreateFunctionServerResponses",
            options.send_create_function_server_responses,
        );
        options.present_semaphore_max_frames = get(
            &values,
            "presentSemaphoreMaxFrames",
            options.present_semaphore_max_frames,
        );
        options.present_semaphore_enabled = get(
            &values,
            "presentSemaphoreEnabled",
            options.present_semaphore_enabled,
        );
        options.use_shared_heap = get(&values, "useSharedHeap", options.use_shared_heap);
        if let Some(policy) = values.get("sharedHeapPolicy") {
            options.shared_heap_policy = match policy.to_ascii_lowercase().as_str() {
                "none" => SharedHeapPolicy::NONE,
                "all" => SharedHeapPolicy::ALL,
                "textures" => SharedHeapPolicy::TEXTURES,
                "buffersonly" => SharedHeapPolicy(
                    SharedHeapPolicy::DYNAMIC_BUFFERS.0 | SharedHeapPolicy::STATIC_BUFFERS.0,
                ),
                other => {
                    tracing::warn!(policy = other, "unknown sharedHeapPolicy, keeping default");
                    options.shared_heap_policy
                }
            };
        }
        options.shared_heap_default_segment_size = get(
            &values,
            "sharedHeapDefaultSegmentSize",
            options.shared_heap_default_segment_size,
        );
        options.shared_heap_chunk_size =
            get(&values, "sharedHeapChunkSize", options.shared_heap_chunk_size);
        options.shared_heap_free_chunk_wait_timeout_secs = get(
            &values,
            "sharedHeapFreeChunkWaitTimeout",
            options.shared_heap_free_chunk_wait_timeout_secs,
        );
        options.always_copy_entire_static_buffer = get(
            &values,
            "alwaysCopyEntireStaticBuffer",
            options.always_copy_entire_static_buffer,
        );

        if let Some(level) = values.get("logLevel") {
            options.log_level = match level.to_ascii_lowercase().as_str() {
                "trace" => tracing::Level::TRACE,
                "debug" => tracing::Level::DEBUG,
                "info" => tracing::Level::INFO,
                "warn" => tracing::Level::WARN,
                "error" => tracing::Level::ERROR,
                other => {
                    tracing::warn!(level = other, "unknown logLevel, keeping default");
                    options.log_level
                }
            };
        }

        if let Some(raw) = values.get("infiniteRetries") {
            // Applied by the caller onto its RetryFlags; stored here only
            // long enough to hand over.
            if raw.parse().unwrap_or(false) {
                options.command_retries = u32::MAX;
            }
        }

        options
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms as u64)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms as u64)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms as u64)
    }

    /// Total patience for one command push: timeout x retries, saturating.
    pub fn default_command_patience(&self) -> Duration {
        self.command_timeout()
            .checked_mul(self.command_retries.min(1 << 20))
            .unwrap_or(Duration::MAX)
    }
}

/// Runtime-mutable retry policy, shared between the channels, the command
/// writer and the message-channel focus handlers.
#[derive(Debug, Default)]
pub struct RetryFlags {
    timeouts_disabled: AtomicBool,
    infinite_retries: AtomicBool,
}

impl RetryFlags {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn timeouts_disabled(&self) -> bool {
        self.timeouts_disabled.load(Ordering::Relaxed)
    }

    pub fn set_timeouts_disabled(&self, disabled: bool) {
        self.timeouts_disabled.store(disabled, Ordering::Relaxed);
    }

    pub fn infinite_retries(&self) -> bool {
        self.infinite_retries.load(Ordering::Relaxed)
    }

    pub fn set_infinite_retries(&self, infinite: bool) {
        self.infinite_retries.store(infinite, Ordering::Relaxed);
    }

    /// Effective retry budget given the configured count.
    pub fn effective_retries(&self, configured: u32) -> u32 {
        if self.infinite_retries() {
            u32::MAX
        } else {
            configured
        }
    }

    /// Effective timeout given the configured one; `Duration::ZERO` means
    /// "wait forever" to the blocking primitives.
    pub fn effective_timeout(&self, configured: Duration) -> Duration {
        if self.timeouts_disabled() {
            Duration::ZERO
        } else {
            configured
        }
    }

    /// Serialize the flags for the peer. Bit order is part of the protocol:
    /// bit 0 = timeouts disabled, bit 1 = infinite retries.
    pub fn sync_bits(&self) -> u32 {
        let mut bits = 0;
        if self.timeouts_disabled() {
            bits |= 1;
        }
        if self.infinite_retries() {
            bits |= 2;
        }
        bits
    }

    /// Apply flags received from the peer, same bit order as `sync_bits`.
    pub fn apply_sync_bits(&self, bits: u32) {
        self.set_timeouts_disabled(bits & 1 != 0);
        self.set_infinite_retries(bits & 2 != 0);
        tracing::debug!(bits, "applied peer retry flags");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let options = BridgeOptions::default();
        assert_eq!(options.command_timeout_ms, 1_000);
        assert_eq!(options.startup_timeout_ms, 100);
        assert_eq!(options.ack_timeout_ms, 10);
        assert_eq!(options.command_retries, 300);
        assert_eq!(options.present_semaphore_max_frames, 3);
        assert_eq!(options.shared_heap_chunk_size, 4 << 10);
        assert_eq!(options.shared_heap_default_segment_size, 128 << 20);
        assert!(!options.use_shared_heap);
    }

    #[test]
    fn load_overrides_and_ignores_junk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# bridge config").unwrap();
        writeln!(file, "commandTimeout = 50").unwrap();
        writeln!(file, "clientCmdQueueSize = 4").unwrap();
        writeln!(file, "useSharedHeap = true").unwrap();
        writeln!(file, "commandRetries = notanumber").unwrap();
        writeln!(file, "logLevel = debug").unwrap();
        file.flush().unwrap();

        let options = BridgeOptions::load(file.path());
        assert_eq!(options.command_timeout_ms, 50);
        assert_eq!(options.client_cmd_queue_size, 4);
        assert!(options.use_shared_heap);
        assert_eq!(options.command_retries, 300);
        assert_eq!(options.log_level, tracing::Level::DEBUG);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let options = BridgeOptions::load(Path::new("/definitely/not/here.conf"));
        assert_eq!(options.command_timeout_ms, 1_000);
    }

    #[test]
    fn retry_flags_sync_roundtrip() {
        let a = RetryFlags::new();
        a.set_infinite_retries(true);
        assert_eq!(a.sync_bits(), 2);

        let b = RetryFlags::new();
        b.apply_sync_bits(a.sync_bits());
        assert!(b.infinite_retries());
        assert!(!b.timeouts_disabled());

        a.set_timeouts_disabled(true);
        b.apply_sync_bits(a.sync_bits());
        assert!(b.timeouts_disabled());
    }

    #[test]
    fn effective_budget_honors_infinite() {
        let flags = RetryFlags::new();
        assert_eq!(flags.effective_retries(300), 300);
        flags.set_infinite_retries(true);
        assert_eq!(flags.effective_retries(300), u32::MAX);
    }
}
