//! Lifecycle callbacks around serialization, transport and deserialization.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use smbengine_codec::PlainMessage;

/// Points in a message's life a callback can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    /// Messages about to be encoded.
    PreSerialize,
    /// Plaintext bytes just encoded and signed.
    PostSerialize,
    /// Wire bytes (possibly encrypted) about to be written.
    PreSend,
    /// Wire bytes just written.
    PostSend,
    /// Wire bytes just read, before decryption.
    PreReceive,
    /// Plaintext bytes after decryption.
    PostReceive,
    /// Plaintext bytes about to be decoded.
    PreDeserialize,
    /// Messages just decoded.
    PostDeserialize,
}

/// What a callback sees for an event.
#[derive(Debug, Clone, Copy)]
pub enum HookPayload<'a> {
    /// Decoded messages.
    Messages(&'a [PlainMessage]),
    /// Raw bytes.
    Bytes(&'a [u8]),
}

/// A registered callback.
pub type HookFn = Arc<dyn Fn(HookEvent, HookPayload<'_>) + Send + Sync>;

/// Registered callbacks, keyed by event.
#[derive(Default)]
pub struct Hooks {
    table: RwLock<HashMap<HookEvent, Vec<HookFn>>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.read();
        f.debug_map().entries(table.iter().map(|(k, v)| (k, v.len()))).finish()
    }
}

impl Hooks {
    /// Adds `callback` for `event`.
    pub fn register(&self, event: HookEvent, callback: HookFn) {
        self.table.write().entry(event).or_default().push(callback);
    }

    /// Whether any callback listens for `event`.
    pub(crate) fn wants(&self, event: HookEvent) -> bool {
        self.table.read().get(&event).is_some_and(|list| !list.is_empty())
    }

    /// Invokes every callback for `event`. The table lock is not held while
    /// callbacks run, so a callback may register further callbacks.
    pub(crate) fn fire(&self, event: HookEvent, payload: HookPayload<'_>) {
        let callbacks = match self.table.read().get(&event) {
            Some(list) if !list.is_empty() => list.clone(),
            _ => return,
        };
        for callback in callbacks {
            callback(event, payload);
        }
    }
}
