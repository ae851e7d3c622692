use std::fmt::Debug;
use std::hash::Hash;
use std::rc::Rc;

use async_trait::async_trait;

use crate::{
    batch_function::{BatchFunction, Loaded},
    error::{BoxError, LoadError},
    identity::{LoaderIdentity, LoaderKind},
};

/// A source that can load one named relation for many parents in a single query.
#[async_trait(?Send)]
pub trait RelationSource: 'static {
    type Parent: 'static + Clone + Eq + Hash + Debug;
    type Related: 'static + Clone + Debug;

    /// Loads `relation` of `model` for every parent. Parents without a related value are left
    /// out of the result.
    async fn load_relation(
        &self,
        model: &str,
        relation: &str,
        parents: &[Self::Parent],
    ) -> Result<Vec<(Self::Parent, Self::Related)>, BoxError>;
}

/// Loads a named relation of a model, batched by parent.
///
/// The identity is `relation:<model>[relation=<relation>]`, so every resolver asking for, say,
/// the assignment of a submission shares one batch.
pub struct RelationLoader<S> {
    source: Rc<S>,
    identity: LoaderIdentity,
}

impl<S: RelationSource> RelationLoader<S> {
    pub fn new(source: Rc<S>, model: &str, relation: &str) -> Result<Self, LoadError> {
        let identity = LoaderIdentity::canonicalize(LoaderKind::Relation, model, [("relation", relation)])?;
        Ok(Self { source, identity })
    }

    pub fn model(&self) -> &str {
        self.identity.target()
    }

    pub fn relation(&self) -> &str {
        self.identity.qualifier("relation").unwrap_or_default()
    }
}

#[async_trait(?Send)]
impl<S: RelationSource> BatchFunction for RelationLoader<S> {
    type Key = S::Parent;
    type Value = S::Related;

    fn identity(&self) -> &LoaderIdentity {
        &self.identity
    }

    async fn load(&self, keys: &[S::Parent]) -> Result<Loaded<S::Parent, S::Related>, BoxError> {
        let related = self.source.load_relation(self.model(), self.relation(), keys).await?;
        Ok(Loaded::Keyed(related))
    }
}
