//! Quantity references used by formulas.
//!
//! A reference binds an alias used inside an equation to its target. References exist
//! in two states: a [`QuantityReference`] as read from the load source, naming its
//! target by id, and a [`Binding`] once all quantities exist and the id was resolved to
//! an arena index.

use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::quantity::QuantityIdx;

/// Target of a reference before resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ReferenceTarget {
    /// The simulation time pseudo-quantity.
    Time { time: bool },
    /// A quantity by id.
    Id { id: u64 },
}

/// Alias with its unresolved target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct QuantityReference {
    pub alias: String,
    #[serde(flatten)]
    pub target: ReferenceTarget,
}

impl QuantityReference {
    pub fn to_id(alias: impl Into<String>, id: u64) -> Self {
        Self {
            alias: alias.into(),
            target: ReferenceTarget::Id { id },
        }
    }

    pub fn to_time(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            target: ReferenceTarget::Time { time: true },
        }
    }

    /// Resolves the target id against the loaded quantities.
    ///
    /// # Arguments
    ///
    /// * `ids` - Quantity id to arena index map
    /// * `node` - Description of the referencing node, used in the error message
    pub fn resolve(
        &self,
        ids: &HashMap<u64, QuantityIdx>,
        node: &str,
    ) -> Result<Binding, ModelError> {
        let target = match self.target {
            ReferenceTarget::Time { .. } => BindingTarget::Time,
            ReferenceTarget::Id { id } => match ids.get(&id) {
                Some(idx) => BindingTarget::Quantity(*idx),
                None => {
                    return Err(ModelError::UnresolvedReference {
                        node: node.to_string(),
                        id,
                    })
                }
            },
        };

        Ok(Binding {
            alias: self.alias.clone(),
            target,
        })
    }
}

/// Target of a resolved reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingTarget {
    Time,
    Quantity(QuantityIdx),
}

/// Alias with its resolved target.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub alias: String,
    pub target: BindingTarget,
}

impl Binding {
    pub fn quantity(&self) -> Option<QuantityIdx> {
        match self.target {
            BindingTarget::Quantity(idx) => Some(idx),
            BindingTarget::Time => None,
        }
    }

    pub fn is_time(&self) -> bool {
        self.target == BindingTarget::Time
    }
}
