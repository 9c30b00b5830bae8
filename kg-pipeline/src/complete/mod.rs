mod transe;

pub use transe::{TransEConfig, TransEModel};

use tracing::warn;

use crate::types::{AlignedEntity, Triple};

/// Infers plausible missing edges from the observed ones. The returned set
/// contains the observed triples plus the inferred ones.
pub trait KnowledgeCompleter: Send {
    fn describe(&self) -> &'static str;

    fn complete(&mut self, entities: &[AlignedEntity], observed: &[Triple]) -> Vec<Triple>;
}

pub fn completer_for(tag: &str, config: TransEConfig) -> Box<dyn KnowledgeCompleter> {
    match tag {
        "transe" => Box::new(TransEModel::new(config)),
        other => {
            warn!(tag = other, "unknown completion algorithm, using transe");
            Box::new(TransEModel::new(config))
        }
    }
}
