//! Correlation of notifications to outstanding commands.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::ProvisionError;
use crate::protocol::STATUS_OK;
use crate::protocol::frame::{self, FrameError, Notification};

/// Identifies the command a notification answers: the notify
/// characteristic it arrives on plus the command code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub notify: Uuid,
    pub command: u8,
}

impl CorrelationKey {
    pub fn new(notify: Uuid, command: u8) -> Self {
        Self { notify, command }
    }
}

/// Reply to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    /// Whether the device reported success.
    pub status: bool,
    pub data: Vec<u8>,
}

impl CommandResponse {
    pub fn ok(data: Vec<u8>) -> Self {
        Self { status: true, data }
    }
}

pub type Completion = oneshot::Sender<Result<CommandResponse, ProvisionError>>;

/// A command waiting for its reply.
#[derive(Debug)]
pub struct PendingCommand {
    pub key: CorrelationKey,
    /// Registration sequence number, distinguishes reuses of the same key.
    pub id: u64,
    pub fragmented: bool,
    pub deadline: Instant,
    pub accumulated: Vec<u8>,
    /// Index the next fragment must carry.
    pub next_index: u8,
    completion: Completion,
}

impl PendingCommand {
    pub fn new(key: CorrelationKey, fragmented: bool, deadline: Instant, completion: Completion) -> Self {
        Self {
            key,
            id: 0,
            fragmented,
            deadline,
            accumulated: Vec::new(),
            next_index: 0,
            completion,
        }
    }

    pub fn command(&self) -> u8 {
        self.key.command
    }

    fn complete(self, result: Result<CommandResponse, ProvisionError>) {
        // The caller may have given up already.
        let _ = self.completion.send(result);
    }
}

/// What happened to a dispatched notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The notification completed its command.
    Completed,
    /// A fragment was buffered; more are expected.
    Buffered,
    /// No command was waiting for it.
    Stray,
    /// The frame could not be decoded.
    Malformed,
    /// A repeated fragment was ignored, or a missing one failed the command.
    OutOfOrder,
    /// The command's deadline had already passed.
    Expired,
}

/// Outstanding commands, at most one per key.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: HashMap<CorrelationKey, PendingCommand>,
    next_id: u64,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, key: &CorrelationKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Register a command, returning its registration id.
    ///
    /// Fails with `InProgress` when the key is already taken; the existing
    /// entry is left untouched.
    pub fn register(&mut self, mut pending: PendingCommand) -> Result<u64, ProvisionError> {
        if self.pending.contains_key(&pending.key) {
            return Err(ProvisionError::InProgress {
                command: pending.command(),
            });
        }
        self.next_id += 1;
        pending.id = self.next_id;
        let id = pending.id;
        self.pending.insert(pending.key, pending);
        Ok(id)
    }

    /// Remove the entry for `key` if it is still registration `id`.
    pub fn remove(&mut self, key: &CorrelationKey, id: u64) -> Option<PendingCommand> {
        match self.pending.get(key) {
            Some(p) if p.id == id => self.pending.remove(key),
            _ => None,
        }
    }

    /// Route one notification to the command waiting for it.
    pub fn dispatch(&mut self, notify: Uuid, bytes: &[u8], exec_marker: u8, now: Instant) -> Dispatch {
        let notification = match frame::decode_notification(bytes, exec_marker) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, value = %frame::to_hex(bytes), "Dropping malformed notification");
                return Dispatch::Malformed;
            }
        };

        let key = CorrelationKey::new(notify, notification.command());
        let Some(pending) = self.pending.get_mut(&key) else {
            debug!(
                code = format!("0x{:02X}", key.command),
                value = %frame::to_hex(bytes),
                "Dropping stray notification"
            );
            return Dispatch::Stray;
        };
        if pending.deadline <= now {
            debug!(code = format!("0x{:02X}", key.command), "Notification after deadline");
            return Dispatch::Expired;
        }

        let response = match notification {
            Notification::ExecResult { status, payload, .. } => CommandResponse {
                status: status == STATUS_OK,
                data: payload.to_vec(),
            },
            Notification::Data { payload, .. } if pending.fragmented => {
                let fragment = match frame::decode_fragment(payload) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(error = %e, "Dropping malformed fragment");
                        return Dispatch::Malformed;
                    }
                };
                trace!(
                    code = format!("0x{:02X}", key.command),
                    index = fragment.index,
                    total = fragment.total,
                    "Fragment"
                );
                if fragment.index < pending.next_index {
                    debug!(index = fragment.index, "Ignoring repeated fragment");
                    return Dispatch::OutOfOrder;
                }
                if fragment.index > pending.next_index {
                    let gap = FrameError::FragmentGap {
                        expected: pending.next_index,
                        actual: fragment.index,
                    };
                    warn!(error = %gap, "Fragment missing, failing command");
                    if let Some(pending) = self.pending.remove(&key) {
                        pending.complete(Err(gap.into()));
                    }
                    return Dispatch::OutOfOrder;
                }
                pending.accumulated.extend_from_slice(fragment.data);
                pending.next_index = pending.next_index.wrapping_add(1);
                if !fragment.is_terminal() {
                    return Dispatch::Buffered;
                }
                CommandResponse::ok(std::mem::take(&mut pending.accumulated))
            }
            Notification::Data { payload, .. } => CommandResponse::ok(payload.to_vec()),
        };

        if let Some(pending) = self.pending.remove(&key) {
            pending.complete(Ok(response));
        }
        Dispatch::Completed
    }

    /// Fail every outstanding command and empty the table.
    pub fn fail_all(&mut self, error: impl Fn() -> ProvisionError) {
        for (_, pending) in self.pending.drain() {
            pending.complete(Err(error()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::constants::BASE_NOTIFY_UUID;
    use crate::protocol::frame::{encode_exec_result, encode_fragments};

    const EXEC: u8 = 0xFF;

    fn pending(command: u8, fragmented: bool) -> (PendingCommand, oneshot::Receiver<Result<CommandResponse, ProvisionError>>) {
        let (tx, rx) = oneshot::channel();
        let key = CorrelationKey::new(BASE_NOTIFY_UUID, command);
        let deadline = Instant::now() + Duration::from_secs(20);
        (PendingCommand::new(key, fragmented, deadline, tx), rx)
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut table = CorrelationTable::new();
        let (first, mut first_rx) = pending(0x01, false);
        let (second, _rx) = pending(0x01, false);
        table.register(first).unwrap();

        let err = table.register(second).unwrap_err();
        assert!(matches!(err, ProvisionError::InProgress { command: 0x01 }));
        assert_eq!(table.len(), 1);
        assert!(first_rx.try_recv().is_err());
    }

    #[test]
    fn test_exec_result_completes() {
        let mut table = CorrelationTable::new();
        let (cmd, mut rx) = pending(0x02, false);
        table.register(cmd).unwrap();

        let frame = encode_exec_result(EXEC, 0x02, 0x01, &[]);
        assert_eq!(table.dispatch(BASE_NOTIFY_UUID, &frame, EXEC, Instant::now()), Dispatch::Completed);
        assert!(table.is_empty());
        let response = rx.try_recv().unwrap().unwrap();
        assert!(!response.status);
    }

    #[test]
    fn test_fragments_complete_once_on_terminal() {
        let mut table = CorrelationTable::new();
        let (cmd, mut rx) = pending(0x2F, true);
        table.register(cmd).unwrap();

        let data: Vec<u8> = (0..40).collect();
        let frames = encode_fragments(0x2F, &data, 16).unwrap();
        let now = Instant::now();
        assert_eq!(table.dispatch(BASE_NOTIFY_UUID, &frames[0], EXEC, now), Dispatch::Buffered);
        assert_eq!(table.dispatch(BASE_NOTIFY_UUID, &frames[1], EXEC, now), Dispatch::Buffered);
        assert!(rx.try_recv().is_err());
        assert_eq!(table.dispatch(BASE_NOTIFY_UUID, &frames[2], EXEC, now), Dispatch::Completed);
        assert_eq!(rx.try_recv().unwrap().unwrap().data, data);

        // A repeated terminal fragment no longer has an owner.
        assert_eq!(table.dispatch(BASE_NOTIFY_UUID, &frames[2], EXEC, now), Dispatch::Stray);
    }

    #[test]
    fn test_repeated_fragment_ignored() {
        let mut table = CorrelationTable::new();
        let (cmd, mut rx) = pending(0x2F, true);
        table.register(cmd).unwrap();

        let data: Vec<u8> = (0..20).collect();
        let frames = encode_fragments(0x2F, &data, 10).unwrap();
        let now = Instant::now();
        assert_eq!(table.dispatch(BASE_NOTIFY_UUID, &frames[0], EXEC, now), Dispatch::Buffered);
        assert_eq!(table.dispatch(BASE_NOTIFY_UUID, &frames[0], EXEC, now), Dispatch::OutOfOrder);
        assert_eq!(table.dispatch(BASE_NOTIFY_UUID, &frames[1], EXEC, now), Dispatch::Completed);
        assert_eq!(rx.try_recv().unwrap().unwrap().data, data);
    }

    #[test]
    fn test_skipped_fragment_fails_command() {
        let mut table = CorrelationTable::new();
        let (cmd, mut rx) = pending(0x2F, true);
        table.register(cmd).unwrap();

        let frames = encode_fragments(0x2F, &[0u8; 30], 10).unwrap();
        let now = Instant::now();
        assert_eq!(table.dispatch(BASE_NOTIFY_UUID, &frames[0], EXEC, now), Dispatch::Buffered);
        assert_eq!(table.dispatch(BASE_NOTIFY_UUID, &frames[2], EXEC, now), Dispatch::OutOfOrder);
        assert!(table.is_empty());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(ProvisionError::Frame(FrameError::FragmentGap { expected: 1, actual: 2 }))
        ));
    }

    #[test]
    fn test_stray_and_malformed() {
        let mut table = CorrelationTable::new();
        let now = Instant::now();
        let frame = encode_exec_result(EXEC, 0x09, 0x00, &[]);
        assert_eq!(table.dispatch(BASE_NOTIFY_UUID, &frame, EXEC, now), Dispatch::Stray);
        assert_eq!(table.dispatch(BASE_NOTIFY_UUID, &[], EXEC, now), Dispatch::Malformed);
    }

    #[test]
    fn test_expired_entry_ignored() {
        let mut table = CorrelationTable::new();
        let (cmd, mut rx) = pending(0x01, false);
        let deadline = cmd.deadline;
        table.register(cmd).unwrap();

        let frame = encode_exec_result(EXEC, 0x01, 0x00, &[]);
        assert_eq!(table.dispatch(BASE_NOTIFY_UUID, &frame, EXEC, deadline), Dispatch::Expired);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_remove_checks_registration() {
        let mut table = CorrelationTable::new();
        let (cmd, _rx) = pending(0x01, false);
        let key = cmd.key;
        let id = table.register(cmd).unwrap();
        assert!(table.remove(&key, id + 1).is_none());
        assert!(table.remove(&key, id).is_some());
        assert!(!table.contains(&key));
    }

    #[test]
    fn test_fail_all() {
        let mut table = CorrelationTable::new();
        let (a, mut a_rx) = pending(0x01, false);
        let (b, mut b_rx) = pending(0x02, false);
        table.register(a).unwrap();
        table.register(b).unwrap();

        table.fail_all(|| ProvisionError::Disconnected);
        assert!(table.is_empty());
        assert!(matches!(a_rx.try_recv().unwrap(), Err(ProvisionError::Disconnected)));
        assert!(matches!(b_rx.try_recv().unwrap(), Err(ProvisionError::Disconnected)));
    }
}
