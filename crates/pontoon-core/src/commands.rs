//! Command enumeration and the 16-byte wire header.
//!
//! The header layout is fixed and little-endian; both sides of the bridge
//! (one of which runs in a 32-bit process) must agree on it byte for byte,
//! so it is never read or written through a Rust struct in shared memory;
//! see `CommandHeader::{to_words, from_words}`.

/// Commands owned by the bridge itself. API-level commands belong to the
/// dispatcher and travel as [`Command::Api`] with an id at or above
/// [`API_COMMAND_BASE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Never valid on the wire; zeroed memory decodes to this.
    Invalid,
    /// Client -> server handshake opener. Payload: client process id.
    Syn,
    /// Server -> client handshake reply, and the generic acknowledgement.
    Ack,
    /// Client -> server go-ahead after consuming the Ack.
    Continue,
    /// Wildcard used only when waiting ("any command").
    Any,
    /// Server -> client reply to a specific command, correlated by UID.
    Response,
    /// Debug payload: one token plus a byte blob.
    DebugMessage,
    /// A new shared-heap segment was created; payload: segment size.
    SharedHeapAddSeg,
    /// A shared-heap allocation was made; payload: alloc id + run location.
    SharedHeapAlloc,
    /// A shared-heap allocation is no longer referenced.
    SharedHeapDealloc,
    /// Drop the server-side binding for a client handle without destroying
    /// the native object (prevents stale-handle collisions on reuse).
    UnlinkResource,
    /// Orderly shutdown request; answered with Ack.
    Terminate,
    /// Transported-API command; the id is owned by the dispatcher.
    Api(u32),
}

/// First id of the dispatcher-owned command range.
pub const API_COMMAND_BASE: u32 = 0x100;

impl Command {
    pub fn to_u32(self) -> u32 {
        match self {
            Command::Invalid => 0,
            Command::Syn => 1,
            Command::Ack => 2,
            Command::Continue => 3,
            Command::Any => 4,
            Command::Response => 5,
            Command::DebugMessage => 6,
            Command::SharedHeapAddSeg => 7,
            Command::SharedHeapAlloc => 8,
            Command::SharedHeapDealloc => 9,
            Command::UnlinkResource => 10,
            Command::Terminate => u32::MAX,
            Command::Api(id) => id,
        }
    }

    pub fn from_u32(value: u32) -> Command {
        match value {
            0 => Command::Invalid,
            1 => Command::Syn,
            2 => Command::Ack,
            3 => Command::Continue,
            4 => Command::Any,
            5 => Command::Response,
            6 => Command::DebugMessage,
            7 => Command::SharedHeapAddSeg,
            8 => Command::SharedHeapAlloc,
            9 => Command::SharedHeapDealloc,
            10 => Command::UnlinkResource,
            u32::MAX => Command::Terminate,
            id if id >= API_COMMAND_BASE => Command::Api(id),
            other => {
                // Reserved bridge range we don't know; surfaces as Invalid
                // rather than being misdispatched as an API call.
                tracing::warn!(id = other, "unknown bridge command id");
                Command::Invalid
            }
        }
    }

    /// Human-readable name for logs and the command history dump.
    pub fn name(self) -> &'static str {
        match self {
            Command::Invalid => "Invalid",
            Command::Syn => "Syn",
            Command::Ack => "Ack",
            Command::Continue => "Continue",
            Command::Any => "Any",
            Command::Response => "Response",
            Command::DebugMessage => "DebugMessage",
            Command::SharedHeapAddSeg => "SharedHeap_AddSeg",
            Command::SharedHeapAlloc => "SharedHeap_Alloc",
            Command::SharedHeapDealloc => "SharedHeap_Dealloc",
            Command::UnlinkResource => "UnlinkResource",
            Command::Terminate => "Terminate",
            Command::Api(_) => "Api",
        }
    }
}

/// Command flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(pub u32);

impl Flags {
    /// Payload lives in the shared heap; the data queue only carries the
    /// allocation id.
    pub const DATA_IN_HEAP: Flags = Flags(1 << 0);
    /// Payload bytes were reserved at a prior data-queue offset; only the
    /// offset travels with this command.
    pub const DATA_RESERVED: Flags = Flags(1 << 1);

    pub const fn empty() -> Flags {
        Flags(0)
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }
}

/// Size of the wire header in bytes.
pub const COMMAND_HEADER_SIZE: usize = 16;

/// One command descriptor as it travels through the command ring.
///
/// ```text
/// offset 0  : u32 command_id
/// offset 4  : u32 flags
/// offset 8  : u32 data_offset   (end-of-payload cursor in the data queue)
/// offset 12 : u32 handle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub command: Command,
    pub flags: Flags,
    /// Data-queue position at which this command's payload ends. The
    /// consumer fast-forwards to this position after dispatch, which makes
    /// unconsumed payload tokens forward-compatible.
    pub data_offset: u32,
    /// Client-minted resource identifier, or an auxiliary integer.
    pub handle: u32,
}

impl CommandHeader {
    pub fn new(command: Command, flags: Flags, data_offset: u32, handle: u32) -> Self {
        Self {
            command,
            flags,
            data_offset,
            handle,
        }
    }

    /// Encode to the four little-endian words stored in the ring.
    pub fn to_words(self) -> [u32; 4] {
        [
            self.command.to_u32(),
            self.flags.0,
            self.data_offset,
            self.handle,
        ]
    }

    pub fn from_words(words: [u32; 4]) -> Self {
        Self {
            command: Command::from_u32(words[0]),
            flags: Flags(words[1]),
            data_offset: words[2],
            handle: words[3],
        }
    }
}

impl Default for CommandHeader {
    fn default() -> Self {
        Self {
            command: Command::Invalid,
            flags: Flags::empty(),
            data_offset: 0,
            handle: 0,
        }
    }
}

const _: () = assert!(COMMAND_HEADER_SIZE == 4 * core::mem::size_of::<u32>());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_id_roundtrip() {
        let commands = [
            Command::Invalid,
            Command::Syn,
            Command::Ack,
            Command::Continue,
            Command::Any,
            Command::Response,
            Command::DebugMessage,
            Command::SharedHeapAddSeg,
            Command::SharedHeapAlloc,
            Command::SharedHeapDealloc,
            Command::UnlinkResource,
            Command::Terminate,
            Command::Api(0x100),
            Command::Api(0x1234),
        ];
        for &cmd in &commands {
            assert_eq!(Command::from_u32(cmd.to_u32()), cmd);
        }
    }

    #[test]
    fn unknown_reserved_id_is_invalid() {
        assert_eq!(Command::from_u32(99), Command::Invalid);
    }

    #[test]
    fn api_range_starts_at_base() {
        assert_eq!(Command::from_u32(API_COMMAND_BASE), Command::Api(0x100));
    }

    #[test]
    fn header_word_roundtrip() {
        let header = CommandHeader::new(
            Command::Api(0x208),
            Flags::DATA_IN_HEAP,
            0xDEAD,
            0x1234,
        );
        let words = header.to_words();
        assert_eq!(words, [0x208, 1, 0xDEAD, 0x1234]);
        assert_eq!(CommandHeader::from_words(words), header);
    }

    #[test]
    fn flag_queries() {
        let flags = Flags::DATA_IN_HEAP.union(Flags::DATA_RESERVED);
        assert!(flags.contains(Flags::DATA_IN_HEAP));
        assert!(flags.contains(Flags::DATA_RESERVED));
        assert!(!Flags::DATA_IN_HEAP.contains(Flags::DATA_RESERVED));
    }

    #[test]
    fn zeroed_header_is_invalid() {
        let header = CommandHeader::from_words([0; 4]);
        assert_eq!(header.command, Command::Invalid);
    }
}
