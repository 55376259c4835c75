use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::protocol::{FrameMatcher, MavMessage, MessageId, SystemId};

use crate::prelude::*;

struct MatcherEntry {
    id: u64,
    system_id: Option<SystemId>,
    matcher: FrameMatcher,
    // Taken on first fulfillment; the entry itself stays until its scope
    // exits.
    slot: Option<oneshot::Sender<MavMessage>>,
}

#[derive(Default)]
struct MatcherState {
    next_id: u64,
    by_type: HashMap<MessageId, Vec<MatcherEntry>>,
}

/// Type-indexed multimap of pending reply correlations.
///
/// Every inbound message is checked against the entries registered for its
/// type; each matching entry is fulfilled at most once. Entries are scoped:
/// they are installed by [`MatcherTable::expect`] and removed when the
/// returned [`PacketExpectation`] goes out of scope, fulfilled or not.
#[derive(Default)]
pub(crate) struct MatcherTable {
    state: Mutex<MatcherState>,
}

impl MatcherTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Installs a matcher for one expected packet.
    pub(crate) fn expect(
        self: &Arc<Self>,
        message_id: MessageId,
        matcher: FrameMatcher,
        system_id: Option<SystemId>,
    ) -> PacketExpectation {
        let (slot, receiver) = oneshot::channel();

        let id = {
            let mut state = self.state.lock().expect("poisoned matcher table");
            let id = state.next_id;
            state.next_id += 1;
            state.by_type.entry(message_id).or_default().push(MatcherEntry {
                id,
                system_id,
                matcher,
                slot: Some(slot),
            });
            id
        };

        PacketExpectation {
            table: self.clone(),
            message_id,
            id,
            receiver,
        }
    }

    /// Fulfills every pending matcher the message satisfies.
    ///
    /// Matchers are evaluated in installation order, so when two messages
    /// satisfy the same matcher, the slot resolves to the earlier one.
    pub(crate) fn resolve(&self, message: &MavMessage) {
        let mut state = self.state.lock().expect("poisoned matcher table");
        let Some(entries) = state.by_type.get_mut(&message.message_id()) else {
            return;
        };

        for entry in entries.iter_mut() {
            if let Some(system_id) = entry.system_id {
                if message.system_id() != system_id {
                    continue;
                }
            }
            if !entry.matcher.matches(message) {
                continue;
            }
            if let Some(slot) = entry.slot.take() {
                // The receiving scope may already be gone; that's fine.
                let _ = slot.send(message.clone());
            }
        }
    }

    /// Cancels every pending matcher; waiting callers observe
    /// [`NetworkError::MatcherCancelled`].
    pub(crate) fn cancel_all(&self) {
        let mut state = self.state.lock().expect("poisoned matcher table");
        state.by_type.clear();
    }

    fn remove(&self, message_id: MessageId, entry_id: u64) {
        let mut state = self.state.lock().expect("poisoned matcher table");
        if let Some(entries) = state.by_type.get_mut(&message_id) {
            entries.retain(|entry| entry.id != entry_id);
            if entries.is_empty() {
                state.by_type.remove(&message_id);
            }
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.state
            .lock()
            .expect("poisoned matcher table")
            .by_type
            .values()
            .map(Vec::len)
            .sum()
    }
}

/// Scope of one expected packet.
///
/// Holds the receiving half of the completion slot; dropping the value
/// removes the matcher entry, whether or not it was fulfilled.
pub struct PacketExpectation {
    table: Arc<MatcherTable>,
    message_id: MessageId,
    id: u64,
    receiver: oneshot::Receiver<MavMessage>,
}

impl PacketExpectation {
    /// Waits until a matching packet arrives.
    ///
    /// Fails with [`NetworkError::MatcherCancelled`] when the network shuts
    /// down first.
    pub async fn wait(&mut self) -> Result<MavMessage> {
        (&mut self.receiver)
            .await
            .map_err(|_| NetworkError::MatcherCancelled.into())
    }
}

#[cfg(test)]
impl PacketExpectation {
    /// `true` while nothing has resolved this expectation yet.
    pub(crate) fn receiver_is_empty(&mut self) -> bool {
        matches!(
            self.receiver.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        )
    }
}

impl Drop for PacketExpectation {
    fn drop(&mut self) {
        self.table.remove(self.message_id, self.id);
    }
}

#[cfg(test)]
mod matcher_table_tests {
    use super::*;

    use crate::protocol::dialect::enums::{MavCmd, MavResult};
    use crate::protocol::dialect::messages::CommandAck;
    use crate::protocol::dialect::Ardupilotmega;
    use crate::protocol::FieldValue;

    const COMMAND_ACK: MessageId = 77;

    fn command_ack(system_id: SystemId, command: MavCmd) -> MavMessage {
        MavMessage::new(
            system_id,
            1,
            Ardupilotmega::CommandAck(CommandAck {
                command,
                result: MavResult::Accepted,
                ..Default::default()
            }),
        )
    }

    #[tokio::test]
    async fn matching_message_resolves_the_slot() {
        let table = Arc::new(MatcherTable::new());
        let mut expectation = table.expect(
            COMMAND_ACK,
            FrameMatcher::field("command", MavCmd::ComponentArmDisarm as u32),
            Some(7),
        );

        table.resolve(&command_ack(7, MavCmd::ComponentArmDisarm));

        let message = expectation.wait().await.unwrap();
        assert_eq!(message.system_id(), 7);
        assert_eq!(table.pending_count(), 1);

        drop(expectation);
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn source_filter_rejects_other_systems() {
        let table = Arc::new(MatcherTable::new());
        let mut expectation = table.expect(
            COMMAND_ACK,
            FrameMatcher::field("command", MavCmd::ComponentArmDisarm as u32),
            Some(7),
        );

        table.resolve(&command_ack(9, MavCmd::ComponentArmDisarm));
        table.resolve(&command_ack(7, MavCmd::ComponentArmDisarm));

        let message = expectation.wait().await.unwrap();
        assert_eq!(message.system_id(), 7);
    }

    #[tokio::test]
    async fn slot_is_fulfilled_at_most_once() {
        let table = Arc::new(MatcherTable::new());
        let mut expectation = table.expect(COMMAND_ACK, FrameMatcher::Any, None);

        table.resolve(&command_ack(7, MavCmd::ComponentArmDisarm));
        // A second matching message is a no-op for the same entry.
        table.resolve(&command_ack(8, MavCmd::NavTakeoff));

        let message = expectation.wait().await.unwrap();
        assert_eq!(message.system_id(), 7);
        assert_eq!(
            message.field("command").unwrap(),
            FieldValue::from(MavCmd::ComponentArmDisarm as u32)
        );
    }

    #[tokio::test]
    async fn first_matching_message_wins() {
        let table = Arc::new(MatcherTable::new());
        let mut expectation = table.expect(COMMAND_ACK, FrameMatcher::Any, Some(7));

        table.resolve(&command_ack(7, MavCmd::NavTakeoff));
        table.resolve(&command_ack(7, MavCmd::NavLand));

        let message = expectation.wait().await.unwrap();
        assert_eq!(
            message.field("command").unwrap(),
            FieldValue::from(MavCmd::NavTakeoff as u32)
        );
    }

    #[tokio::test]
    async fn scope_exit_removes_exactly_one_entry() {
        let table = Arc::new(MatcherTable::new());
        let first = table.expect(COMMAND_ACK, FrameMatcher::Any, None);
        let second = table.expect(COMMAND_ACK, FrameMatcher::Any, None);
        assert_eq!(table.pending_count(), 2);

        drop(first);
        assert_eq!(table.pending_count(), 1);
        drop(second);
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_matchers() {
        let table = Arc::new(MatcherTable::new());
        let mut expectation = table.expect(COMMAND_ACK, FrameMatcher::Any, None);

        table.cancel_all();

        let result = expectation.wait().await;
        assert!(matches!(
            result,
            Err(Error::Net(NetworkError::MatcherCancelled))
        ));
    }
}
