//! Entry and key model
//!
//! An entry is any cloneable, comparable value that can name its own key.
//! Keys resolve at compile time through [`Entry::key`]; there is no
//! string-keyed field lookup anywhere in the engine.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// Keyed map of entries held by a store
pub type EntryMap<E> = HashMap<<E as Entry>::Key, E>;

/// Key type of a registry
///
/// `hint_cmp` orders keys for the "nearest keys" diagnostic of a failed
/// lookup. It defaults to the natural ordering; string keys compare
/// case-insensitively.
pub trait RegistryKey: Clone + Eq + Hash + Ord + Debug + Display + Send + Sync + 'static {
    fn hint_cmp(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }
}

impl RegistryKey for String {
    fn hint_cmp(&self, other: &Self) -> Ordering {
        self.to_lowercase()
            .cmp(&other.to_lowercase())
            .then_with(|| self.cmp(other))
    }
}

macro_rules! natural_keys {
    ($($ty:ty),* $(,)?) => {
        $(impl RegistryKey for $ty {})*
    };
}

natural_keys!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, char);

/// A value stored in a registry
pub trait Entry: Clone + PartialEq + Debug + Send + Sync + 'static {
    type Key: RegistryKey;

    /// The unique key of this entry
    fn key(&self) -> Self::Key;
}

/// Find the keys adjacent to `missing` under [`RegistryKey::hint_cmp`]
///
/// Returns at most two keys: the greatest key ordered before `missing` and
/// the smallest key ordered after it.
pub fn neighbor_keys<'a, K, I>(missing: &K, keys: I) -> Vec<K>
where
    K: RegistryKey,
    I: IntoIterator<Item = &'a K>,
{
    let mut below: Option<&K> = None;
    let mut above: Option<&K> = None;

    for key in keys {
        match key.hint_cmp(missing) {
            Ordering::Less => {
                if below.map_or(true, |b| key.hint_cmp(b) == Ordering::Greater) {
                    below = Some(key);
                }
            }
            Ordering::Greater => {
                if above.map_or(true, |a| key.hint_cmp(a) == Ordering::Less) {
                    above = Some(key);
                }
            }
            // Only reachable for keys equal under the hint ordering but not
            // under Eq, e.g. differently cased strings.
            Ordering::Equal => {
                if below.is_none() {
                    below = Some(key);
                }
            }
        }
    }

    below.into_iter().chain(above).cloned().collect()
}
