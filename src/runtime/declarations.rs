use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::dom::RegionId;
use crate::error::{BlockError, Result};

use super::Block;

/// Identity of a mounted block: one instance per element and block name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub root: RegionId,
    pub name: String,
}

impl BlockKey {
    pub fn new(root: impl Into<RegionId>, name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.root)
    }
}

/// One block entry of an element's declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSpec {
    pub key: BlockKey,
    pub params: Value,
}

impl BlockSpec {
    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn root(&self) -> &str {
        &self.key.root
    }

    /// Deserialize the parameters; absent parameters mean "all defaults".
    pub fn params<T: DeserializeOwned>(&self) -> Result<T> {
        let params = match &self.params {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(params)
            .map_err(|err| BlockError::declaration(self.name(), err.to_string()))
    }
}

/// Parse an element declaration such as
/// `{"paste3": {"channel": "comments"}, "paginator": {"channel1": "comments"}}`.
///
/// Entries keep their written order, which is also their mount order.
pub fn parse_declaration(root: &str, declaration: &str) -> Result<Vec<BlockSpec>> {
    let value: Value = serde_json::from_str(declaration)?;
    let Value::Object(entries) = value else {
        return Err(BlockError::declaration(root, "declaration must be a JSON object"));
    };
    entries
        .into_iter()
        .map(|(name, params)| {
            if !(params.is_object() || params.is_null()) {
                return Err(BlockError::declaration(&name, "parameters must be an object"));
            }
            Ok(BlockSpec {
                key: BlockKey::new(root, name),
                params,
            })
        })
        .collect()
}

pub type BlockFactory = Arc<dyn Fn(&BlockSpec) -> Result<Box<dyn Block>> + Send + Sync>;

/// Block names the host knows how to construct.
#[derive(Clone, Default)]
pub struct BlockRegistry {
    factories: BTreeMap<String, BlockFactory>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_factory<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&BlockSpec) -> Result<Box<dyn Block>> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&BlockSpec) -> Result<Box<dyn Block>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn build(&self, spec: &BlockSpec) -> Result<Box<dyn Block>> {
        let factory = self
            .factories
            .get(spec.name())
            .ok_or_else(|| BlockError::UnknownBlock(spec.name().to_string()))?;
        factory(spec)
    }
}

impl fmt::Debug for BlockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}
