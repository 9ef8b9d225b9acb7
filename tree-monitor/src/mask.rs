//! Raw event mask bits.
//!
//! Bit values match the Linux inotify ABI so the inotify provider converts
//! masks without a lookup table.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Bitmask carried by a raw provider event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct EventMask: u32 {
        const ACCESS = 0x0000_0001;
        const MODIFY = 0x0000_0002;
        const ATTRIB = 0x0000_0004;
        const CLOSE_WRITE = 0x0000_0008;
        const CLOSE_NOWRITE = 0x0000_0010;
        const OPEN = 0x0000_0020;
        const MOVED_FROM = 0x0000_0040;
        const MOVED_TO = 0x0000_0080;
        const CREATE = 0x0000_0100;
        const DELETE = 0x0000_0200;
        const DELETE_SELF = 0x0000_0400;
        const MOVE_SELF = 0x0000_0800;
        const UNMOUNT = 0x0000_2000;
        const Q_OVERFLOW = 0x0000_4000;
        const IGNORED = 0x0000_8000;
        const ISDIR = 0x4000_0000;
    }
}

/// Mask every watch is installed with.
///
/// `ISDIR` is absent: it only ever appears on delivered events.
pub const WATCH_MASK: EventMask = EventMask::ACCESS
    .union(EventMask::OPEN)
    .union(EventMask::CLOSE_NOWRITE)
    .union(EventMask::CREATE)
    .union(EventMask::MODIFY)
    .union(EventMask::CLOSE_WRITE)
    .union(EventMask::ATTRIB)
    .union(EventMask::DELETE)
    .union(EventMask::DELETE_SELF)
    .union(EventMask::MOVED_FROM)
    .union(EventMask::MOVED_TO);

impl EventMask {
    /// Whether the event concerns a directory.
    pub fn is_dir(self) -> bool {
        self.contains(Self::ISDIR)
    }
}
