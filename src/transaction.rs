// src/transaction.rs
//
// Request/response correlation over the bus.
//
// Anyone on the RS-485 line can emit a frame at any time; this module
// turns that into synchronous transactions. A global async mutex keeps at
// most one send+wait in flight, which is also why a single pending-ack
// slot is enough: arm the slot, put the frame on the wire, wait for the
// resolver to complete it or for the deadline to pass.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::BridgeError;
use crate::protocol::{ParsedFrame, CMD_POLLING_EXTENDED, CMD_POLLING_RESPONSE};
use crate::serial_link::FrameSender;

/// Deadline for a matching reply to a command or polling request.
pub const COMMAND_ACK_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Matchers
// ============================================================================

/// Predicate for the inbound frame that completes a transaction.
/// Kept as data rather than closures so matching cannot fail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameMatcher {
    /// A polling reply; controllers answer with either the request opcode
    /// or the dedicated response opcode.
    PollingReply,
    /// An echo of a sent command: same opcode, same leading data bytes.
    Echo { command: u8, data_prefix: Vec<u8> },
}

impl FrameMatcher {
    /// Echo matcher for a just-built outbound frame, comparing the command
    /// byte and the first `prefix_len` data bytes that encode the intent.
    pub fn echo_of(frame: &[u8], prefix_len: usize) -> Self {
        Self::Echo {
            command: frame[2],
            data_prefix: frame[3..3 + prefix_len].to_vec(),
        }
    }

    pub fn matches(&self, frame: &ParsedFrame) -> bool {
        match self {
            Self::PollingReply => {
                frame.command == CMD_POLLING_EXTENDED || frame.command == CMD_POLLING_RESPONSE
            }
            Self::Echo {
                command,
                data_prefix,
            } => frame.command == *command && frame.data.starts_with(data_prefix),
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

struct PendingAck {
    address: u8,
    matcher: FrameMatcher,
    complete: oneshot::Sender<ParsedFrame>,
}

pub struct TransactionEngine {
    sender: Arc<dyn FrameSender>,
    /// Serializes all transactions: held from send until signal or timeout
    txn_lock: tokio::sync::Mutex<()>,
    slot: Mutex<Option<PendingAck>>,
}

impl TransactionEngine {
    pub fn new(sender: Arc<dyn FrameSender>) -> Self {
        Self {
            sender,
            txn_lock: tokio::sync::Mutex::new(()),
            slot: Mutex::new(None),
        }
    }

    /// Send a frame and wait for the first inbound frame from `address`
    /// accepted by `matcher`.
    pub async fn send_with_ack(
        &self,
        frame: &[u8],
        address: u8,
        matcher: FrameMatcher,
        timeout: Duration,
    ) -> Result<ParsedFrame, BridgeError> {
        let _txn = self.txn_lock.lock().await;

        let (complete, wait) = oneshot::channel();
        {
            let mut slot = self.slot.lock().expect("ack slot poisoned");
            *slot = Some(PendingAck {
                address,
                matcher,
                complete,
            });
        }

        let sender = self.sender.clone();
        let bytes = frame.to_vec();
        let sent = tokio::task::spawn_blocking(move || sender.send_frame(&bytes))
            .await
            .unwrap_or(false);
        if !sent {
            self.clear_slot();
            return Err(BridgeError::io("frame was not written to the bus"));
        }

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(reply)) => Ok(reply),
            _ => {
                self.clear_slot();
                Err(BridgeError::Timeout { address, timeout })
            }
        }
    }

    /// Offer an inbound frame to the pending transaction, if any.
    /// Called for every parsed frame before general dispatch; frames are
    /// always dispatched afterwards regardless of the outcome here.
    pub fn resolve(&self, frame: &ParsedFrame) {
        let mut slot = self.slot.lock().expect("ack slot poisoned");
        let matched = slot
            .as_ref()
            .map_or(false, |pending| {
                pending.address == frame.address && pending.matcher.matches(frame)
            });
        if matched {
            if let Some(pending) = slot.take() {
                debug!(
                    address = frame.address,
                    command = %format!("0x{:02X}", frame.command),
                    "transaction completed"
                );
                let _ = pending.complete.send(frame.clone());
            }
        }
    }

    fn clear_slot(&self) {
        self.slot.lock().expect("ack slot poisoned").take();
    }
}

// ============================================================================
// Tests
// ============================================================================
