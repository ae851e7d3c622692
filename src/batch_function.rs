use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use async_trait::async_trait;

use crate::{error::BoxError, identity::LoaderIdentity};

/// A `BatchFunction` defines the method through which a [`Loader`](crate::Loader) fetches
/// batched data from some resource. It receives every distinct key that was requested for its
/// identity since the previous dispatch tick, in request order, and is invoked at most once per
/// tick.
///
/// The returned [`Loaded`] is either aligned with the keys or keyed by them. Keys missing from a
/// keyed result resolve to `None`. An `Err` fails every key of the batch, but leaves the batches
/// of other identities dispatched in the same tick untouched.
///
/// Batch functions impose no timeout of their own; a slow source should bound its own calls.
#[async_trait(?Send)]
pub trait BatchFunction: 'static {
    type Key: 'static + Clone + Eq + Hash + Debug;
    type Value: 'static + Clone + Debug;

    /// The identity of the bucket this function batches for. Two functions with equal
    /// identities share one batch buffer and result cache within a context.
    fn identity(&self) -> &LoaderIdentity;

    async fn load(&self, keys: &[Self::Key]) -> Result<Loaded<Self::Key, Self::Value>, BoxError>;
}

/// The result of one batch fetch.
#[derive(Debug, Clone)]
pub enum Loaded<K, V> {
    /// One entry per requested key, in request order.
    Aligned(Vec<Option<V>>),
    /// Key value pairs in any order. Unrequested keys are ignored; for repeated keys the first
    /// pair wins.
    Keyed(Vec<(K, V)>),
}

impl<K, V> From<Vec<(K, V)>> for Loaded<K, V> {
    fn from(pairs: Vec<(K, V)>) -> Self {
        Loaded::Keyed(pairs)
    }
}

impl<K, V> From<HashMap<K, V>> for Loaded<K, V> {
    fn from(map: HashMap<K, V>) -> Self {
        Loaded::Keyed(map.into_iter().collect())
    }
}

impl<K, V> Loaded<K, V>
where
    K: Eq + Hash + Debug,
{
    /// Lines the loaded values up with `keys`.
    ///
    /// Fails with the number of returned values when an aligned result has the wrong length.
    pub(crate) fn align(self, keys: &[K]) -> Result<Vec<Option<V>>, usize> {
        match self {
            Loaded::Aligned(values) if values.len() == keys.len() => Ok(values),
            Loaded::Aligned(values) => Err(values.len()),
            Loaded::Keyed(pairs) => {
                let mut by_key = HashMap::with_capacity(pairs.len());
                for (key, value) in pairs {
                    by_key.entry(key).or_insert(value);
                }
                let aligned = keys.iter().map(|key| by_key.remove(key)).collect::<Vec<_>>();
                if !by_key.is_empty() {
                    let unrequested = by_key.keys().collect::<Vec<_>>();
                    tracing::warn!(?unrequested, "batch returned keys that were not requested");
                }
                Ok(aligned)
            }
        }
    }
}
