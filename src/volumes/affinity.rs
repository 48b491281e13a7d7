//! Node Affinity
//!
//! A published local volume is usable from exactly one node. The predicate
//! is kept typed here and only rendered into the cluster's selector form at
//! the edge, so nothing broader than "this one node" can be expressed.

use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{
    Node, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, VolumeNodeAffinity,
};
use serde::Serialize;
use std::collections::BTreeMap;

/// Default node label identifying a node
pub const DEFAULT_NODE_LABEL_KEY: &str = "kubernetes.io/hostname";

const OPERATOR_IN: &str = "In";

/// "node label `key` In [`value`]"
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeAffinity {
    key: String,
    value: String,
}

impl NodeAffinity {
    /// Pin to the node carrying `labels`, read from its `key` label
    pub fn for_node(node: &str, labels: &BTreeMap<String, String>, key: &str) -> Result<Self> {
        match labels.get(key) {
            Some(value) if !value.is_empty() => Ok(Self {
                key: key.to_string(),
                value: value.clone(),
            }),
            _ => Err(Error::MissingNodeLabel {
                node: node.to_string(),
                key: key.to_string(),
            }),
        }
    }

    /// Pin to a cluster node object
    pub fn from_node(node: &Node, key: &str) -> Result<Self> {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        let empty = BTreeMap::new();
        let labels = node.metadata.labels.as_ref().unwrap_or(&empty);
        Self::for_node(name, labels, key)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Whether a node with these labels satisfies the predicate
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        labels.get(&self.key) == Some(&self.value)
    }

    /// Render as a single-term, single-requirement selector
    pub fn to_volume_node_affinity(&self) -> VolumeNodeAffinity {
        VolumeNodeAffinity {
            required: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: self.key.clone(),
                        operator: OPERATOR_IN.to_string(),
                        values: Some(vec![self.value.clone()]),
                    }]),
                    match_fields: None,
                }],
            }),
        }
    }

    /// Parse a published selector back; anything that could admit more than
    /// one node value is rejected
    pub fn from_volume_node_affinity(affinity: &VolumeNodeAffinity) -> Result<Self> {
        let selector = affinity
            .required
            .as_ref()
            .ok_or_else(|| Error::InvalidAffinity("no required node selector".into()))?;

        let term = match selector.node_selector_terms.as_slice() {
            [term] => term,
            terms => {
                return Err(Error::InvalidAffinity(format!(
                    "expected one selector term, found {}",
                    terms.len()
                )))
            }
        };

        if term.match_fields.as_ref().is_some_and(|f| !f.is_empty()) {
            return Err(Error::InvalidAffinity("field selectors are not supported".into()));
        }

        let requirement = match term.match_expressions.as_deref() {
            Some([requirement]) => requirement,
            _ => {
                return Err(Error::InvalidAffinity(
                    "expected exactly one match expression".into(),
                ))
            }
        };

        if requirement.operator != OPERATOR_IN {
            return Err(Error::InvalidAffinity(format!(
                "unsupported operator {}",
                requirement.operator
            )));
        }

        match requirement.values.as_deref() {
            Some([value]) if !value.is_empty() => Ok(Self {
                key: requirement.key.clone(),
                value: value.clone(),
            }),
            _ => Err(Error::InvalidAffinity(format!(
                "expected exactly one value for {}",
                requirement.key
            ))),
        }
    }
}

impl std::fmt::Display for NodeAffinity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} In [{}]", self.key, self.value)
    }
}
