//! Resolution of user addresses into canonical futex [`Key`]s.

#![deny(unsafe_code)]

use crate::error::Error;
use crate::memory::{AddressSpace, SpaceId};

/// Sharing scope requested for a futex address.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum Scope {
    /// The word is only used by tasks of one address space.
    #[default]
    Private,
    /// The word may be mapped into several address spaces.
    Shared,
}

/// Canonical identity of a futex word.
///
/// Two addresses mapping the same word of a shared object resolve to equal keys; addresses of
/// different spaces never alias under [`Scope::Private`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Key {
    /// A word private to one address space.
    Private {
        /// Owning address space.
        space: SpaceId,
        /// Address of the word.
        address: usize,
    },
    /// A word inside a shared memory object.
    Shared {
        /// Identity of the object; never reused.
        object: u64,
        /// Byte offset of the word in the object.
        offset: usize,
    },
}

/// Resolves `address` in `space` into a [`Key`].
///
/// A [`Scope::Shared`] request on a private mapping yields a private key. Resolving a shared key
/// faults in the backing page.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if `address` is not 4-byte aligned, and [`Error::Fault`] if
/// a shared request names an unmapped address.
///
/// # Examples
///
/// ```
/// use futex_engine::{AddressSpace, Key, MemoryObject, Scope, key};
///
/// let object = MemoryObject::new(4096);
/// let first = AddressSpace::new();
/// let second = AddressSpace::new();
/// let a = first.map_shared(&object, 0, 4096).unwrap();
/// let b = second.map_shared(&object, 0, 4096).unwrap();
///
/// assert_eq!(
///     key::resolve(&first, a + 8, Scope::Shared),
///     key::resolve(&second, b + 8, Scope::Shared),
/// );
/// assert!(matches!(key::resolve(&first, a, Scope::Private), Ok(Key::Private { .. })));
/// ```
pub fn resolve(space: &AddressSpace, address: usize, scope: Scope) -> Result<Key, Error> {
    if address % align_of::<u32>() != 0 {
        return Err(Error::InvalidArgument);
    }
    let private = Key::Private {
        space: space.id(),
        address,
    };
    if scope == Scope::Private {
        return Ok(private);
    }
    let location = space.locate(address)?;
    if !location.shared {
        return Ok(private);
    }
    location
        .object
        .fault_in(location.offset)
        .ok_or(Error::Fault)?;
    Ok(Key::Shared {
        object: location.object.sequence(),
        offset: location.offset,
    })
}
