//! Variation hierarchy
//!
//! An immutable view of every variation property, the forest of values each
//! property owns and the per-service-type priority table. Once built it is
//! pure computation: rank, order, parent lookups and best-match resolution.
//!
//! Rank encoding: properties relevant to a service type are laid out from the
//! least to the most important one. Each property reserves a budget of
//! `1 + max_depth` bits; a property's offset is the sum of the budgets laid out
//! before it. An assigned value contributes `2^offset + depth`, so a match on a
//! more important property always outranks any combination of matches on less
//! important ones, and a deeper value outranks its ancestors.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use tessera_common::{ANY_VARIATION_VALUE, Result, TesseraError};
use tessera_persistence::{
    PersistenceTransaction, ServiceTypePropertyRecord, ServiceTypeRecord, VariationPropertyRecord,
    VariationPropertyValueRecord,
};

/// Largest bit offset a rank may use
const MAX_RANK_OFFSET: u32 = 62;

/// A variation property with the shape of its value forest
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyNode {
    pub id: i64,
    pub name: String,
    /// Depth of the deepest value; top-level values have depth 1
    pub max_depth: u32,
    /// Top-level value ids in traversal order
    pub roots: Vec<i64>,
}

/// One value of a property
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueNode {
    pub id: i64,
    pub property_id: i64,
    pub value: String,
    pub parent_id: Option<i64>,
    /// Distance from the top of the forest; top-level values have depth 1
    pub depth: u32,
    /// Pre-order traversal index within the property, starting at 1
    pub order: u32,
    pub children: Vec<i64>,
}

/// A property as seen by one service type
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedProperty {
    pub property_id: i64,
    pub name: String,
    /// Lower numbers are more important
    pub priority: i32,
    /// Bit offset of this property's rank contribution
    pub offset: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTypeNode {
    pub id: i64,
    pub name: String,
    /// Relevant properties, most important first
    pub properties: Vec<RankedProperty>,
}

/// Raw rows a hierarchy is built from
#[derive(Clone, Debug, Default)]
pub struct HierarchyData {
    pub properties: Vec<VariationPropertyRecord>,
    pub values: Vec<VariationPropertyValueRecord>,
    pub service_types: Vec<ServiceTypeRecord>,
    pub service_type_properties: Vec<ServiceTypePropertyRecord>,
}

impl HierarchyData {
    pub async fn load(tx: &dyn PersistenceTransaction) -> Result<Self> {
        Ok(Self {
            properties: tx.property_list().await?,
            values: tx.property_value_list().await?,
            service_types: tx.service_type_list().await?,
            service_type_properties: tx.service_type_property_list().await?,
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct VariationHierarchy {
    properties: HashMap<i64, PropertyNode>,
    values: HashMap<i64, ValueNode>,
    values_by_text: HashMap<(i64, String), i64>,
    service_types: HashMap<i64, ServiceTypeNode>,
}

impl VariationHierarchy {
    /// Load every variation row through `tx` and build the hierarchy
    pub async fn load(tx: &dyn PersistenceTransaction) -> Result<Self> {
        Self::build(HierarchyData::load(tx).await?)
    }

    pub fn build(data: HierarchyData) -> Result<Self> {
        let mut properties: HashMap<i64, PropertyNode> = data
            .properties
            .into_iter()
            .map(|p| {
                (
                    p.id,
                    PropertyNode {
                        id: p.id,
                        name: p.name,
                        max_depth: 0,
                        roots: Vec::new(),
                    },
                )
            })
            .collect();

        let mut values: HashMap<i64, ValueNode> = HashMap::with_capacity(data.values.len());
        let mut sort_keys: HashMap<i64, (i32, i64)> = HashMap::with_capacity(data.values.len());
        for v in data.values {
            if !properties.contains_key(&v.property_id) {
                return Err(TesseraError::UnknownError(format!(
                    "variation value {} belongs to unknown property {}",
                    v.id, v.property_id
                )));
            }
            sort_keys.insert(v.id, (v.sort_order, v.id));
            values.insert(
                v.id,
                ValueNode {
                    id: v.id,
                    property_id: v.property_id,
                    value: v.value,
                    parent_id: v.parent_id,
                    depth: 0,
                    order: 0,
                    children: Vec::new(),
                },
            );
        }

        // Wire parents to children
        let mut ids: Vec<i64> = values.keys().copied().collect();
        ids.sort_by_key(|id| sort_keys[id]);
        for id in &ids {
            let (property_id, parent_id) = {
                let node = &values[id];
                (node.property_id, node.parent_id)
            };
            match parent_id {
                Some(parent_id) => {
                    let parent = values.get_mut(&parent_id).ok_or_else(|| {
                        TesseraError::UnknownError(format!(
                            "variation value {} has unknown parent {}",
                            id, parent_id
                        ))
                    })?;
                    if parent.property_id != property_id {
                        return Err(TesseraError::UnknownError(format!(
                            "variation value {} and its parent {} belong to different properties",
                            id, parent_id
                        )));
                    }
                    parent.children.push(*id);
                }
                None => {
                    if let Some(property) = properties.get_mut(&property_id) {
                        property.roots.push(*id);
                    }
                }
            }
        }

        // Pre-order walk per property assigns depth and order
        let mut visited = 0usize;
        for property in properties.values_mut() {
            let mut order = 0u32;
            let mut stack: Vec<(i64, u32)> = property.roots.iter().rev().map(|id| (*id, 1)).collect();
            while let Some((id, depth)) = stack.pop() {
                let Some(node) = values.get_mut(&id) else {
                    continue;
                };
                order += 1;
                visited += 1;
                node.depth = depth;
                node.order = order;
                property.max_depth = property.max_depth.max(depth);
                stack.extend(node.children.iter().rev().map(|child| (*child, depth + 1)));
            }
        }
        if visited != values.len() {
            return Err(TesseraError::UnknownError(
                "variation values contain a parent cycle".to_string(),
            ));
        }

        let mut service_types: HashMap<i64, ServiceTypeNode> = data
            .service_types
            .into_iter()
            .map(|t| {
                (
                    t.id,
                    ServiceTypeNode {
                        id: t.id,
                        name: t.name,
                        properties: Vec::new(),
                    },
                )
            })
            .collect();

        let mut links = data.service_type_properties;
        // Least important first so offsets accumulate upward
        links.sort_by_key(|l| (std::cmp::Reverse(l.priority), std::cmp::Reverse(l.property_id)));
        let mut offsets: HashMap<i64, u32> = HashMap::new();
        for link in links {
            let property = properties.get(&link.property_id).ok_or_else(|| {
                TesseraError::UnknownError(format!(
                    "service type {} references unknown property {}",
                    link.service_type_id, link.property_id
                ))
            })?;
            let service_type = service_types.get_mut(&link.service_type_id).ok_or_else(|| {
                TesseraError::UnknownError(format!(
                    "unknown service type {} in property priorities",
                    link.service_type_id
                ))
            })?;
            let offset = offsets.entry(link.service_type_id).or_insert(0);
            if *offset > MAX_RANK_OFFSET {
                return Err(TesseraError::UnknownError(format!(
                    "service type {} needs more than {} rank bits",
                    service_type.name, MAX_RANK_OFFSET
                )));
            }
            service_type.properties.push(RankedProperty {
                property_id: property.id,
                name: property.name.clone(),
                priority: link.priority,
                offset: *offset,
            });
            *offset += 1 + property.max_depth;
        }
        for service_type in service_types.values_mut() {
            service_type.properties.reverse();
        }

        let values_by_text = values
            .values()
            .map(|v| ((v.property_id, v.value.clone()), v.id))
            .collect();

        Ok(Self {
            properties,
            values,
            values_by_text,
            service_types,
        })
    }

    fn service_type(&self, service_type_id: i64) -> Result<&ServiceTypeNode> {
        self.service_types.get(&service_type_id).ok_or_else(|| {
            TesseraError::UnknownError(format!("unknown service type {}", service_type_id))
        })
    }

    fn value(&self, value_id: i64) -> Result<&ValueNode> {
        self.values.get(&value_id).ok_or_else(|| {
            TesseraError::InvalidOperation(format!("unknown variation value {}", value_id))
        })
    }

    pub fn property(&self, property_id: i64) -> Option<&PropertyNode> {
        self.properties.get(&property_id)
    }

    pub fn value_node(&self, value_id: i64) -> Option<&ValueNode> {
        self.values.get(&value_id)
    }

    pub fn property_nodes(&self) -> impl Iterator<Item = &PropertyNode> {
        self.properties.values()
    }

    pub fn service_type_nodes(&self) -> impl Iterator<Item = &ServiceTypeNode> {
        self.service_types.values()
    }

    /// Properties relevant to a service type, most important first
    pub fn get_properties(&self, service_type_id: i64) -> Result<&[RankedProperty]> {
        Ok(&self.service_type(service_type_id)?.properties)
    }

    /// Resolve `{property id: value text}` into value ids.
    ///
    /// Empty texts and `any` leave the property unconstrained. The result is
    /// sorted ascending.
    pub fn variation_map_to_ids(
        &self,
        service_type_id: i64,
        variation: &HashMap<i64, String>,
    ) -> Result<Vec<i64>> {
        let service_type = self.service_type(service_type_id)?;
        let mut ids = BTreeSet::new();
        for (property_id, text) in variation {
            if text.is_empty() || text.eq_ignore_ascii_case(ANY_VARIATION_VALUE) {
                continue;
            }
            if !service_type
                .properties
                .iter()
                .any(|p| p.property_id == *property_id)
            {
                return Err(TesseraError::InvalidOperation(format!(
                    "property {} is not relevant to service type {}",
                    property_id, service_type.name
                )));
            }
            let id = self
                .values_by_text
                .get(&(*property_id, text.clone()))
                .ok_or_else(|| {
                    TesseraError::InvalidOperation(format!(
                        "unknown value '{}' for property {}",
                        text, property_id
                    ))
                })?;
            ids.insert(*id);
        }
        Ok(ids.into_iter().collect())
    }

    /// Assigned value per property, rejecting unknown ids and double assignments
    fn assignments(&self, variation: &[i64]) -> Result<HashMap<i64, &ValueNode>> {
        let mut assigned: HashMap<i64, &ValueNode> = HashMap::with_capacity(variation.len());
        for id in variation {
            let node = self.value(*id)?;
            if let Some(other) = assigned.insert(node.property_id, node)
                && other.id != node.id
            {
                return Err(TesseraError::InvalidOperation(format!(
                    "variation assigns both {} and {} to property {}",
                    other.id, node.id, node.property_id
                )));
            }
        }
        Ok(assigned)
    }

    /// Specificity score of a variation for a service type
    pub fn get_rank(&self, service_type_id: i64, variation: &[i64]) -> Result<u64> {
        let service_type = self.service_type(service_type_id)?;
        let assigned = self.assignments(variation)?;
        Ok(service_type
            .properties
            .iter()
            .filter_map(|p| {
                assigned
                    .get(&p.property_id)
                    .map(|node| (1u64 << p.offset) + u64::from(node.depth))
            })
            .sum())
    }

    /// Pre-order index of the assigned value per relevant property, 0 when unassigned
    pub fn get_order(&self, service_type_id: i64, variation: &[i64]) -> Result<Vec<u32>> {
        let service_type = self.service_type(service_type_id)?;
        let assigned = self.assignments(variation)?;
        Ok(service_type
            .properties
            .iter()
            .map(|p| assigned.get(&p.property_id).map_or(0, |node| node.order))
            .collect())
    }

    /// Ancestor texts of a value, nearest parent first, up to the top-level value
    pub fn get_parents(&self, property_id: i64, value: &str) -> Vec<String> {
        let mut parents = Vec::new();
        let Some(mut current) = self
            .values_by_text
            .get(&(property_id, value.to_string()))
            .and_then(|id| self.values.get(id))
        else {
            return parents;
        };
        while let Some(parent) = current.parent_id.and_then(|id| self.values.get(&id)) {
            parents.push(parent.value.clone());
            current = parent;
        }
        parents
    }

    /// Whether a runtime value satisfies an assigned one: equal, or descended from it
    pub fn matches(&self, property_id: i64, assigned: &str, runtime: &str) -> bool {
        assigned == runtime
            || self
                .get_parents(property_id, runtime)
                .iter()
                .any(|p| p == assigned)
    }

    /// Render a context as `(property name, value)` pairs ordered by property name
    pub fn describe_context(&self, variation: &[i64]) -> Result<Vec<(String, String)>> {
        let mut described = variation
            .iter()
            .map(|id| {
                let node = self.value(*id)?;
                let property = self.properties.get(&node.property_id).ok_or_else(|| {
                    TesseraError::UnknownError(format!("unknown property {}", node.property_id))
                })?;
                Ok((property.name.clone(), node.value.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        described.sort();
        Ok(described)
    }

    /// Pick the candidate that best matches a runtime context.
    ///
    /// A candidate matches when each of its assigned values is satisfied by the
    /// runtime value of that property. Highest rank wins; equal ranks fall back
    /// to the lower order vector, then to the earlier candidate.
    pub fn best_match<'a, T>(
        &self,
        service_type_id: i64,
        runtime: &HashMap<i64, String>,
        candidates: &'a [(Vec<i64>, T)],
    ) -> Result<Option<&'a T>> {
        let mut best: Option<(u64, Vec<u32>, &'a T)> = None;
        for (variation, item) in candidates {
            let mut satisfied = true;
            for id in variation {
                let node = self.value(*id)?;
                let matched = runtime
                    .get(&node.property_id)
                    .is_some_and(|text| self.matches(node.property_id, &node.value, text));
                if !matched {
                    satisfied = false;
                    break;
                }
            }
            if !satisfied {
                continue;
            }

            let rank = self.get_rank(service_type_id, variation)?;
            let order = self.get_order(service_type_id, variation)?;
            let better = match &best {
                None => true,
                Some((best_rank, best_order, _)) => {
                    rank > *best_rank || (rank == *best_rank && order < *best_order)
                }
            };
            if better {
                best = Some((rank, order, item));
            }
        }
        Ok(best.map(|(_, _, item)| item))
    }
}
