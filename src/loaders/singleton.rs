use std::fmt::Debug;
use std::hash::Hash;
use std::rc::Rc;

use async_trait::async_trait;

use crate::{
    batch_function::{BatchFunction, Loaded},
    error::{BoxError, LoadError},
    identity::{LoaderIdentity, LoaderKind},
};

/// A source of records addressed by an external identifier.
#[async_trait(?Send)]
pub trait RecordSource: 'static {
    type Id: 'static + Clone + Eq + Hash + Debug;
    type Record: 'static + Clone + Debug;

    /// Looks up every id of `collection` in one call. Unknown ids are left out of the result.
    async fn load_records(&self, collection: &str, ids: &[Self::Id]) -> Result<Vec<(Self::Id, Self::Record)>, BoxError>;
}

/// Loads single records by id, such as media objects by their media id.
pub struct SingletonLoader<S> {
    source: Rc<S>,
    identity: LoaderIdentity,
}

impl<S: RecordSource> SingletonLoader<S> {
    pub fn new(source: Rc<S>, collection: &str) -> Result<Self, LoadError> {
        let identity = LoaderIdentity::unqualified(LoaderKind::Singleton, collection)?;
        Ok(Self { source, identity })
    }

    pub fn collection(&self) -> &str {
        self.identity.target()
    }
}

#[async_trait(?Send)]
impl<S: RecordSource> BatchFunction for SingletonLoader<S> {
    type Key = S::Id;
    type Value = S::Record;

    fn identity(&self) -> &LoaderIdentity {
        &self.identity
    }

    async fn load(&self, keys: &[S::Id]) -> Result<Loaded<S::Id, S::Record>, BoxError> {
        let records = self.source.load_records(self.collection(), keys).await?;
        Ok(Loaded::Keyed(records))
    }
}
