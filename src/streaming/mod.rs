//! Push protocol over a single reliable byte stream.
//!
//! Two tasks per connection: the sender walks the tree and writes frames on the
//! outbound half, the control listener reads acknowledgements from the inbound
//! half.
//!
//! # Architecture
//!
//! ```text
//! Push (local -> remote):
//! +--------------+     +--------------+   FILE/DIRECTORY/STOP   +--------------+
//! |  Generator   | --> |    Sender    | ----------------------> |   Receiver   |
//! | (local walk) |     | (frames)     |                         | (remote write)|
//! +--------------+     +------^-------+                         +------+-------+
//!                             | AckSlot                                |
//!                      +------+-------+      FILE_ACK/KEEP_ALIVE       |
//!                      |   Listener   | <------------------------------+
//!                      +--------------+
//! ```
//!
//! # Wire format
//!
//! Every message starts with a one-byte type. Integers are big-endian, strings
//! are a u16 length followed by UTF-8. After a FILE frame the sender writes
//! nothing until the matching FILE_ACK arrives.

pub mod channel;
pub mod generator;
pub mod listener;
pub mod protocol;
pub mod receiver;
pub mod sender;

pub use channel::{
    status_channel, AckSlot, AckWait, Outcome, PushStats, StatusReport, StatusSink, TracingSink,
    DATA_CHUNK_SIZE,
};

pub use generator::{Generator, WalkEntry};
pub use listener::{spawn_listener, ListenerExit, ListenerStats};
pub use receiver::{ReceiveStats, Receiver, ReceiverConfig};
pub use sender::{Sender, SenderConfig};

pub use protocol::{
    checksum, read_message, read_message_type, write_control, write_frame, Compression,
    DirectoryHeader, FileFrame, FileHeader, Message, MessageType, VirtualPath, MAX_FILE_LENGTH,
};
