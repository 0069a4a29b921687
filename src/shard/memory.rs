//! In-memory shard.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{FtgsError, Result};
use crate::ftgs::types::{FieldKind, FieldSpec, Term};
use crate::shard::{COUNT_METRIC, IntValueLookup, Shard, SliceCursor, TermCursor};

/// Serializable column-wise description of a shard: one value per document
/// for every field.
///
/// ```json
/// {
///   "name": "shard-2024-01-01",
///   "int_fields": { "clicks": [3, 0, 7] },
///   "string_fields": { "country": ["us", "de", "us"] }
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardData {
    pub name: String,
    #[serde(default)]
    pub int_fields: BTreeMap<String, Vec<i64>>,
    #[serde(default)]
    pub string_fields: BTreeMap<String, Vec<String>>,
}

/// Values of one int column, doubling as a metric.
#[derive(Debug)]
struct ColumnLookup {
    values: Vec<i64>,
    min: i64,
    max: i64,
}

impl IntValueLookup for ColumnLookup {
    fn min(&self) -> i64 {
        self.min
    }

    fn max(&self) -> i64 {
        self.max
    }

    fn lookup(&self, docs: &[u32], values: &mut [i64]) {
        for (value, &doc) in values.iter_mut().zip(docs) {
            *value = self.values[doc as usize];
        }
    }

    fn memory_used(&self) -> usize {
        self.values.capacity() * 8
    }
}

#[derive(Debug)]
struct ConstantLookup(i64);

impl IntValueLookup for ConstantLookup {
    fn min(&self) -> i64 {
        self.0
    }

    fn max(&self) -> i64 {
        self.0
    }

    fn lookup(&self, docs: &[u32], values: &mut [i64]) {
        values[..docs.len()].fill(self.0);
    }

    fn memory_used(&self) -> usize {
        0
    }
}

#[derive(Debug)]
struct FieldData {
    kind: FieldKind,
    terms: Arc<[(Term, Vec<u32>)]>,
}

/// A shard held entirely in memory: an inverted term index per field and
/// the int columns as metrics. The built-in metric `count()` is 1 for every
/// document.
#[derive(Debug)]
pub struct MemoryShard {
    name: String,
    num_docs: u32,
    fields: AHashMap<String, FieldData>,
    field_order: Vec<FieldSpec>,
    metrics: AHashMap<String, Arc<dyn IntValueLookup>>,
}

impl MemoryShard {
    pub fn builder<S: Into<String>>(name: S, num_docs: u32) -> MemoryShardBuilder {
        MemoryShardBuilder {
            name: name.into(),
            num_docs,
            fields: Vec::new(),
            metrics: Vec::new(),
        }
    }

    /// Build a shard from its column-wise description.
    pub fn from_data(data: ShardData) -> Result<Self> {
        let num_docs = data
            .int_fields
            .values()
            .map(Vec::len)
            .chain(data.string_fields.values().map(Vec::len))
            .next()
            .unwrap_or(0);
        let num_docs = u32::try_from(num_docs)
            .map_err(|_| FtgsError::invalid_argument("shard has more than u32::MAX documents"))?;

        let mut builder = MemoryShard::builder(data.name, num_docs);
        for (field, values) in data.int_fields {
            builder = builder.int_column(field, values);
        }
        for (field, values) in data.string_fields {
            builder = builder.string_column(field, values);
        }
        builder.build()
    }

    /// Load a shard from a JSON file holding a [`ShardData`].
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let data: ShardData = serde_json::from_reader(BufReader::new(file))?;
        Self::from_data(data)
    }

    fn field(&self, field: &str, kind: FieldKind) -> Result<&FieldData> {
        match self.fields.get(field) {
            Some(data) if data.kind == kind => Ok(data),
            Some(_) => Err(FtgsError::invalid_argument(format!(
                "field {field} of shard {} is not {kind:?}",
                self.name
            ))),
            None => Err(FtgsError::not_found(format!(
                "field {field} in shard {}",
                self.name
            ))),
        }
    }
}

impl Shard for MemoryShard {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_docs(&self) -> u32 {
        self.num_docs
    }

    fn fields(&self) -> Vec<FieldSpec> {
        self.field_order.clone()
    }

    fn field_kind(&self, field: &str) -> Option<FieldKind> {
        self.fields.get(field).map(|f| f.kind)
    }

    fn int_terms(&self, field: &str) -> Result<Box<dyn TermCursor>> {
        let data = self.field(field, FieldKind::Int)?;
        Ok(Box::new(SliceCursor::new(Arc::clone(&data.terms))))
    }

    fn string_terms(&self, field: &str) -> Result<Box<dyn TermCursor>> {
        let data = self.field(field, FieldKind::Str)?;
        Ok(Box::new(SliceCursor::new(Arc::clone(&data.terms))))
    }

    fn metric(&self, name: &str) -> Result<Arc<dyn IntValueLookup>> {
        if name == COUNT_METRIC {
            return Ok(Arc::new(ConstantLookup(1)));
        }
        self.metrics
            .get(name)
            .cloned()
            .ok_or_else(|| FtgsError::not_found(format!("metric {name} in shard {}", self.name)))
    }
}

enum PendingField {
    IntColumn(Vec<i64>),
    StringColumn(Vec<String>),
    IntTerms(Vec<(i64, Vec<u32>)>),
    StringTerms(Vec<(String, Vec<u32>)>),
}

/// Builder for [`MemoryShard`].
pub struct MemoryShardBuilder {
    name: String,
    num_docs: u32,
    fields: Vec<(String, PendingField)>,
    metrics: Vec<(String, Vec<i64>)>,
}

impl MemoryShardBuilder {
    /// Single-valued int field; also registered as a metric.
    pub fn int_column<S: Into<String>>(mut self, field: S, values: Vec<i64>) -> Self {
        self.fields.push((field.into(), PendingField::IntColumn(values)));
        self
    }

    /// Single-valued string field.
    pub fn string_column<S: Into<String>, V: Into<String>>(
        mut self,
        field: S,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.fields.push((field.into(), PendingField::StringColumn(values)));
        self
    }

    /// Multi-valued int field given as term → documents.
    pub fn int_terms<S: Into<String>>(mut self, field: S, terms: Vec<(i64, Vec<u32>)>) -> Self {
        self.fields.push((field.into(), PendingField::IntTerms(terms)));
        self
    }

    /// Multi-valued string field given as term → documents.
    pub fn string_terms<S: Into<String>>(mut self, field: S, terms: Vec<(String, Vec<u32>)>) -> Self {
        self.fields.push((field.into(), PendingField::StringTerms(terms)));
        self
    }

    /// A metric that is not a field.
    pub fn metric<S: Into<String>>(mut self, name: S, values: Vec<i64>) -> Self {
        self.metrics.push((name.into(), values));
        self
    }

    pub fn build(self) -> Result<MemoryShard> {
        let num_docs = self.num_docs;
        let mut shard = MemoryShard {
            name: self.name,
            num_docs,
            fields: AHashMap::new(),
            field_order: Vec::new(),
            metrics: AHashMap::new(),
        };

        let check_len = |what: &str, len: usize| {
            if len == num_docs as usize {
                Ok(())
            } else {
                Err(FtgsError::invalid_argument(format!(
                    "{what} has {len} values for {num_docs} documents"
                )))
            }
        };

        for (name, pending) in self.fields {
            if shard.fields.contains_key(&name) {
                return Err(FtgsError::invalid_argument(format!("duplicate field {name}")));
            }
            let (kind, terms) = match pending {
                PendingField::IntColumn(values) => {
                    check_len(&name, values.len())?;
                    let terms = invert(values.iter().map(|&v| Term::Int(v)));
                    shard.metrics.insert(name.clone(), Arc::new(column(values)));
                    (FieldKind::Int, terms)
                }
                PendingField::StringColumn(values) => {
                    check_len(&name, values.len())?;
                    (FieldKind::Str, invert(values.iter().map(Term::str)))
                }
                PendingField::IntTerms(terms) => (
                    FieldKind::Int,
                    collect_terms(terms.into_iter().map(|(t, d)| (Term::Int(t), d)), num_docs)?,
                ),
                PendingField::StringTerms(terms) => (
                    FieldKind::Str,
                    collect_terms(terms.into_iter().map(|(t, d)| (Term::str(t), d)), num_docs)?,
                ),
            };
            shard.field_order.push(FieldSpec {
                name: name.clone(),
                kind,
            });
            shard.fields.insert(
                name,
                FieldData {
                    kind,
                    terms: terms.into(),
                },
            );
        }

        for (name, values) in self.metrics {
            check_len(&name, values.len())?;
            shard.metrics.insert(name, Arc::new(column(values)));
        }
        Ok(shard)
    }
}

fn column(values: Vec<i64>) -> ColumnLookup {
    let min = values.iter().copied().min().unwrap_or(0);
    let max = values.iter().copied().max().unwrap_or(0);
    ColumnLookup { values, min, max }
}

fn invert(values: impl Iterator<Item = Term>) -> Vec<(Term, Vec<u32>)> {
    let mut terms: BTreeMap<Term, Vec<u32>> = BTreeMap::new();
    for (doc, term) in values.enumerate() {
        terms.entry(term).or_default().push(doc as u32);
    }
    terms.into_iter().collect()
}

fn collect_terms(
    terms: impl Iterator<Item = (Term, Vec<u32>)>,
    num_docs: u32,
) -> Result<Vec<(Term, Vec<u32>)>> {
    let mut merged: BTreeMap<Term, Vec<u32>> = BTreeMap::new();
    for (term, docs) in terms {
        if let Some(&doc) = docs.iter().find(|&&d| d >= num_docs) {
            return Err(FtgsError::invalid_argument(format!(
                "doc {doc} of term {term} is outside 0..{num_docs}"
            )));
        }
        merged.entry(term).or_default().extend(docs);
    }
    Ok(merged
        .into_iter()
        .filter_map(|(term, mut docs)| {
            docs.sort_unstable();
            docs.dedup();
            (!docs.is_empty()).then_some((term, docs))
        })
        .collect())
}
