// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

use bstr::BStr;
use bytes::Bytes;
use std::fmt;

/// One step of a tree serialization.
///
/// The root node carries an empty `name`; entries inside a directory carry
/// their entry name. A `File` event announces the size and is followed by
/// [`NarEvent::FileData`] chunks whose lengths sum to exactly that size.
#[derive(Clone, PartialEq, Eq)]
pub enum NarEvent {
    File {
        name: Bytes,
        executable: bool,
        size: u64,
    },
    FileData(Bytes),
    Symlink {
        name: Bytes,
        target: Bytes,
    },
    StartDirectory {
        name: Bytes,
    },
    EndDirectory,
}

impl fmt::Debug for NarEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NarEvent::File {
                name,
                executable,
                size,
            } => f
                .debug_struct("File")
                .field("name", &BStr::new(name))
                .field("executable", executable)
                .field("size", size)
                .finish(),
            NarEvent::FileData(chunk) => write!(f, "FileData({} bytes)", chunk.len()),
            NarEvent::Symlink { name, target } => f
                .debug_struct("Symlink")
                .field("name", &BStr::new(name))
                .field("target", &BStr::new(target))
                .finish(),
            NarEvent::StartDirectory { name } => f
                .debug_struct("StartDirectory")
                .field("name", &BStr::new(name))
                .finish(),
            NarEvent::EndDirectory => f.write_str("EndDirectory"),
        }
    }
}
