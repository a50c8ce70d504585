//! Grouping and aggregation.
//!
//! Records are reduced into [`GroupRow`]s, one per distinct combination of grouping values, by
//! an [`Accumulator`] that counts rows and gathers collected fields. [`nested_merge`] then folds
//! those rows into a tree of [`GroupNode`]s: one level per grouping key, with counts rolled up
//! into branches and collected values unioned into sorted, duplicate free lists.
use std::collections::BTreeMap;

use serde_json::{Map, Value as Json};
use tracing::{trace, warn};

use crate::{
    error::Result,
    query::{sort_by_field, Sort},
    record::Record,
    value::Value,
};

pub const COUNT_KEY: &str = "_count";
pub const GROUP_COUNT_KEY: &str = "_group_count";
pub const SUBGROUP_KEY: &str = "_subgroup";

pub type Collected = BTreeMap<String, Vec<Value>>;

/// Running state of one group while rows are reduced into it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Accumulator {
    pub count: u64,
    pub collected: Collected,
}

impl Accumulator {
    /// Starts at a count of zero with an empty list for every collect field.
    pub fn new<S: AsRef<str>>(collect: &[S]) -> Self {
        Self {
            count: 0,
            collected: collect
                .iter()
                .map(|field| (field.as_ref().to_string(), Vec::new()))
                .collect(),
        }
    }

    pub fn reduce(&mut self, record: &Record) {
        self.count += 1;
        for (field, values) in self.collected.iter_mut() {
            if let Some(value) = record.get(field) {
                values.push(value.clone());
            }
        }
    }
}

/// A partially reduced group as produced by a storage group primitive.
///
/// `fields` holds the grouping values and any other scalar the storage computed. Collected lists
/// may contain duplicates.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GroupRow {
    pub fields: BTreeMap<String, Value>,
    pub count: u64,
    pub collected: Collected,
}

/// Groups `records` by `keys`, in order of first appearance.
///
/// Records lacking any of the keys are skipped.
pub fn reduce_rows<I, K, C>(keys: &[K], collect: &[C], records: I) -> Vec<GroupRow>
where
    I: IntoIterator<Item = Record>,
    K: AsRef<str>,
    C: AsRef<str>,
{
    let mut index: BTreeMap<Vec<Value>, usize> = BTreeMap::new();
    let mut groups: Vec<(Vec<Value>, Accumulator)> = Vec::new();

    for record in records {
        let values: Option<Vec<Value>> = keys
            .iter()
            .map(|key| record.get(key.as_ref()).cloned())
            .collect();
        let Some(values) = values else {
            warn!(record = ?record, "Skipping record without all grouping keys");
            continue;
        };
        let position = *index.entry(values.clone()).or_insert_with(|| {
            groups.push((values, Accumulator::new(collect)));
            groups.len() - 1
        });
        groups[position].1.reduce(&record);
    }

    groups
        .into_iter()
        .map(|(values, accumulator)| GroupRow {
            fields: keys
                .iter()
                .map(|key| key.as_ref().to_string())
                .zip(values)
                .collect(),
            count: accumulator.count,
            collected: accumulator.collected,
        })
        .collect()
}

/// One node of a grouped result.
#[derive(Clone, Debug, PartialEq)]
pub enum GroupNode {
    /// The innermost grouping level: the row's fields including its grouping value.
    Leaf {
        fields: BTreeMap<String, Value>,
        count: u64,
        collected: Collected,
    },
    /// An outer grouping level. Children are ordered by their grouping value.
    Branch {
        key: String,
        value: Value,
        children: Vec<GroupNode>,
        count: u64,
        group_count: usize,
        collected: Collected,
    },
}

impl GroupNode {
    pub fn count(&self) -> u64 {
        match self {
            GroupNode::Leaf { count, .. } | GroupNode::Branch { count, .. } => *count,
        }
    }

    pub fn collected(&self) -> &Collected {
        match self {
            GroupNode::Leaf { collected, .. } | GroupNode::Branch { collected, .. } => collected,
        }
    }

    pub fn children(&self) -> &[GroupNode] {
        match self {
            GroupNode::Leaf { .. } => &[],
            GroupNode::Branch { children, .. } => children,
        }
    }

    /// Scalar lookup, including the `_count` and `_group_count` pseudo fields.
    pub fn get(&self, key: &str) -> Option<Value> {
        match (self, key) {
            (_, COUNT_KEY) => Some(Value::from(self.count())),
            (GroupNode::Branch { group_count, .. }, GROUP_COUNT_KEY) => {
                Some(Value::from(*group_count))
            }
            _ => self.group_value(key).cloned(),
        }
    }

    fn group_value(&self, key: &str) -> Option<&Value> {
        match self {
            GroupNode::Leaf { fields, .. } => fields.get(key),
            GroupNode::Branch {
                key: branch_key,
                value,
                ..
            } if branch_key == key => Some(value),
            GroupNode::Branch { .. } => None,
        }
    }

    fn with_collected(mut self, incoming: &Collected) -> Self {
        let collected = match &mut self {
            GroupNode::Leaf { collected, .. } | GroupNode::Branch { collected, .. } => collected,
        };
        for (field, values) in incoming {
            let set = collected.entry(field.clone()).or_default();
            for value in values {
                if let Err(position) = set.binary_search(value) {
                    set.insert(position, value.clone());
                }
            }
        }
        self
    }

    pub fn to_json(&self) -> Json {
        let mut object = Map::new();
        match self {
            GroupNode::Leaf { fields, count, .. } => {
                for (key, value) in fields {
                    object.insert(key.clone(), value.to_json());
                }
                object.insert(COUNT_KEY.to_string(), Json::from(*count));
            }
            GroupNode::Branch {
                key,
                value,
                children,
                count,
                group_count,
                ..
            } => {
                object.insert(key.clone(), value.to_json());
                object.insert(
                    SUBGROUP_KEY.to_string(),
                    Json::Array(children.iter().map(GroupNode::to_json).collect()),
                );
                object.insert(COUNT_KEY.to_string(), Json::from(*count));
                object.insert(GROUP_COUNT_KEY.to_string(), Json::from(*group_count));
            }
        }
        for (field, values) in self.collected() {
            object.insert(
                field.clone(),
                Json::Array(values.iter().map(Value::to_json).collect()),
            );
        }
        Json::Object(object)
    }
}

/// Folds reduced rows into a tree with one level per key.
///
/// Rows that share grouping values merge: leaf counts add up, branches recompute `_count` and
/// `_group_count` from their children. Collected values are unioned into the top-level group
/// as sorted sets; nodes inside `_subgroup` carry none.
pub fn nested_merge<K: AsRef<str>>(keys: &[K], rows: Vec<GroupRow>) -> Vec<GroupNode> {
    let keys: Vec<String> = keys.iter().map(|key| key.as_ref().to_string()).collect();
    rows.into_iter().fold(Vec::new(), |groups, row| {
        let GroupRow {
            fields,
            count,
            collected,
        } = row;
        merge(groups, &keys, fields, count, Some(&collected))
    })
}

fn merge(
    mut groups: Vec<GroupNode>,
    keys: &[String],
    mut fields: BTreeMap<String, Value>,
    count: u64,
    collected: Option<&Collected>,
) -> Vec<GroupNode> {
    let Some((key, rest)) = keys.split_first() else {
        return groups;
    };
    let Some(value) = fields.remove(key) else {
        warn!(key = %key, "Grouped row is missing a grouping key");
        return groups;
    };

    let (index, existing) = match groups
        .iter()
        .position(|group| group.group_value(key) == Some(&value))
    {
        Some(index) => (index, Some(groups.remove(index))),
        None => (groups.len(), None),
    };
    trace!(key = %key, value = ?value, found = existing.is_some(), "merging row");

    let node = if rest.is_empty() {
        merge_leaf(existing, key, value, fields, count)
    } else {
        merge_branch(existing, key, value, rest, fields, count)
    };
    let node = match collected {
        Some(collected) => node.with_collected(collected),
        None => node,
    };
    groups.insert(index, node);
    groups
}

fn merge_leaf(
    existing: Option<GroupNode>,
    key: &str,
    value: Value,
    mut fields: BTreeMap<String, Value>,
    count: u64,
) -> GroupNode {
    match existing {
        Some(GroupNode::Leaf {
            fields,
            count: existing_count,
            collected,
        }) => GroupNode::Leaf {
            fields,
            count: existing_count + count,
            collected,
        },
        _ => {
            fields.insert(key.to_string(), value);
            GroupNode::Leaf {
                fields,
                count,
                collected: Collected::new(),
            }
        }
    }
}

fn merge_branch(
    existing: Option<GroupNode>,
    key: &str,
    value: Value,
    rest: &[String],
    fields: BTreeMap<String, Value>,
    count: u64,
) -> GroupNode {
    let (children, branch_collected) = match existing {
        Some(GroupNode::Branch {
            children,
            collected,
            ..
        }) => (children, collected),
        _ => (Vec::new(), Collected::new()),
    };

    let mut children = merge(children, rest, fields, count, None);
    let child_key = &rest[0];
    children.sort_by(|a, b| a.group_value(child_key).cmp(&b.group_value(child_key)));

    GroupNode::Branch {
        key: key.to_string(),
        value,
        count: children.iter().map(GroupNode::count).sum(),
        group_count: children.len(),
        children,
        collected: branch_collected,
    }
}

/// Sorts top-level groups only. Stable, so merge order breaks ties.
pub fn sort_groups(groups: Vec<GroupNode>, sort: &Sort) -> Result<Vec<GroupNode>> {
    sort_by_field(groups, sort, |group| group.get(&sort.key))
}

/// Merges rows, then applies the optional sort and limit to the top level.
pub fn aggregate<K: AsRef<str>>(
    keys: &[K],
    rows: Vec<GroupRow>,
    sort: Option<&Sort>,
    limit: Option<usize>,
) -> Result<Vec<GroupNode>> {
    let mut groups = nested_merge(keys, rows);
    if let Some(sort) = sort {
        groups = sort_groups(groups, sort)?;
    }
    if let Some(limit) = limit.filter(|&limit| limit > 0) {
        groups.truncate(limit);
    }
    Ok(groups)
}
