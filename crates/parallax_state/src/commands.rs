//! # Sync Command Lists
//!
//! The tick thread decides *what* each client should receive and
//! records those decisions as a list of commands; a worker thread later
//! runs the list against a fresh clone buffer, compressing and sending
//! as the buffer fills. Keeping serialization out of the tick keeps the
//! per-frame walk over the entity table cheap.

use std::sync::Arc;

use parallax_net::{
    flush_buffer, hash::MSG_PACKED_CLONES, maybe_flush_buffer, MessageBuffer,
};

use crate::client::Client;
use crate::CLONE_BUFFER_BYTES;

/// Execution state shared by the commands of one frame.
pub struct SyncCommandState {
    /// The frame's clone bit stream.
    pub clone_buffer: MessageBuffer,
    /// Frame the list was built for.
    pub frame_index: u64,
    /// Destination client.
    pub client: Arc<Client>,
}

impl SyncCommandState {
    /// Sends whatever the buffer holds.
    pub fn flush(&mut self) {
        flush_buffer(
            &mut self.clone_buffer,
            MSG_PACKED_CLONES,
            self.frame_index,
            &*self.client,
        );
    }

    /// Sends early if the buffer is close to the frame bound.
    pub fn maybe_flush(&mut self) {
        maybe_flush_buffer(
            &mut self.clone_buffer,
            MSG_PACKED_CLONES,
            self.frame_index,
            &*self.client,
        );
    }
}

/// One deferred write into a client's frame.
pub type SyncCommand = Box<dyn FnOnce(&mut SyncCommandState) + Send>;

/// Everything one client receives for one frame.
pub struct SyncCommandList {
    /// Frame the list was built for.
    pub frame_index: u64,
    /// Destination client.
    pub client: Arc<Client>,
    commands: Vec<SyncCommand>,
}

impl SyncCommandList {
    /// Creates an empty list.
    #[must_use]
    pub fn new(client: Arc<Client>, frame_index: u64) -> Self {
        Self {
            frame_index,
            client,
            commands: Vec::with_capacity(64),
        }
    }

    /// Appends a command.
    pub fn push(&mut self, command: SyncCommand) {
        self.commands.push(command);
    }

    /// Runs every command and flushes the tail of the frame.
    pub fn execute(self) {
        let mut state = SyncCommandState {
            clone_buffer: MessageBuffer::new(CLONE_BUFFER_BYTES),
            frame_index: self.frame_index,
            client: self.client,
        };

        for command in self.commands {
            command(&mut state);
        }

        state.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parallax_net::{decompress_body, ByteReader, PacketSink, Reliability};
    use parking_lot::Mutex;

    struct CollectSink {
        packets: Mutex<Vec<Vec<u8>>>,
    }

    impl PacketSink for CollectSink {
        fn send_packet(&self, _: u8, payload: &[u8], _: Reliability) {
            self.packets.lock().push(payload.to_vec());
        }
    }

    #[test]
    fn test_list_executes_in_order_and_flushes() {
        let sink = Arc::new(CollectSink { packets: Mutex::new(Vec::new()) });
        let client = Client::new(1, Some(0), "c", sink.clone());

        let mut list = SyncCommandList::new(client, 9);
        list.push(Box::new(|state| {
            state.clone_buffer.write(3, 5);
            state.clone_buffer.write(32, 123);
            state.clone_buffer.write(32, 0);
        }));
        list.push(Box::new(|state| {
            state.clone_buffer.write(3, 3);
            state.clone_buffer.write(13, 77);
        }));

        list.execute();

        let packets = sink.packets.lock();
        assert_eq!(packets.len(), 1);

        let mut reader = ByteReader::new(&packets[0]);
        assert_eq!(reader.read_u32(), Some(MSG_PACKED_CLONES));
        assert_eq!(reader.read_u64(), Some(9));

        let body = decompress_body(reader.read_rest()).unwrap();
        let mut bits = MessageBuffer::from_bytes(&body);
        assert_eq!(bits.read(3), Some(5));
        assert_eq!(bits.read(32), Some(123));
        assert_eq!(bits.read(32), Some(0));
        assert_eq!(bits.read(3), Some(3));
        assert_eq!(bits.read(13), Some(77));
        assert_eq!(bits.read(3), Some(7));
    }
}
