//! Decode-time type registries.
//!
//! Each registry maps a wire discriminator to the decode routine of one
//! concrete type. Registries are built once, in a fixed order, by an explicit
//! builder and then only queried. Decoding peeks the discriminator without
//! consuming it, looks up the routine, and lets that routine consume the body.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use tracing::trace;

use crate::cursor::ReadCursor;
use crate::error::{CodecError, CodecResult, RegistryFamily};
use crate::frame::FrameContext;

/// Decode routine stored in a registry.
pub type DecodeFn<T> = fn(&mut ReadCursor<'_>, &FrameContext) -> CodecResult<T>;

/// Discriminator-keyed table of decode routines producing a `T`.
pub struct TypeRegistry<K, T> {
    family: RegistryFamily,
    entries: HashMap<K, DecodeFn<T>>,
}

impl<K, T> TypeRegistry<K, T>
where
    K: Copy + Eq + Hash + Debug,
{
    /// Starts building a registry for `family`.
    pub fn builder(family: RegistryFamily) -> RegistryBuilder<K, T> {
        RegistryBuilder {
            registry: TypeRegistry {
                family,
                entries: HashMap::new(),
            },
        }
    }

    /// Which family this registry serves.
    pub fn family(&self) -> RegistryFamily {
        self.family
    }

    /// Whether a routine is registered under `key`.
    pub fn contains(&self, key: K) -> bool {
        self.entries.contains_key(&key)
    }

    /// Number of registered discriminators.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up the routine for `key`.
    pub fn lookup(&self, key: K) -> CodecResult<DecodeFn<T>> {
        self.entries
            .get(&key)
            .copied()
            .ok_or_else(|| CodecError::UnknownDiscriminator {
                family: self.family,
                key: format!("{key:?}"),
            })
    }

    /// Looks up `key` and decodes the body at the cursor with it.
    pub fn decode(&self, key: K, cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<T> {
        let decode = self.lookup(key)?;
        trace!(family = ?self.family, key = ?key, offset = cursor.offset(), "registry dispatch");
        decode(cursor, ctx)
    }
}

/// Builder returned by [`TypeRegistry::builder`].
pub struct RegistryBuilder<K, T> {
    registry: TypeRegistry<K, T>,
}

impl<K, T> RegistryBuilder<K, T>
where
    K: Copy + Eq + Hash + Debug,
{
    /// Registers `decode` under `key`. Keys are unique; registering one twice
    /// is a programming error caught in debug builds and ignored otherwise.
    pub fn register(mut self, key: K, decode: DecodeFn<T>) -> Self {
        let previous = self.registry.entries.insert(key, decode);
        debug_assert!(previous.is_none(), "duplicate registry key {key:?}");
        self
    }

    /// Finishes the registry.
    pub fn build(self) -> TypeRegistry<K, T> {
        self.registry
    }
}
