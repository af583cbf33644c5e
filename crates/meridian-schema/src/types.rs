//! Declaration types handed over by the metadata document parser

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier of a backing platform (e.g. `ple`, `tdmi`, `myslice`).
pub type PlatformId = String;

/// Primitive kind of a scalar field.
///
/// Unknown primitive names are kept as `Other` so that extension types
/// survive ingestion. Two scalar kinds are compatible only when equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ScalarType {
    Bool,
    Int,
    Unsigned,
    Float,
    Double,
    String,
    Text,
    Inet,
    Timestamp,
    Interval,
    /// Value restricted to a declared enumeration
    Enum(String),
    Other(String),
}

impl ScalarType {
    pub fn enumeration(name: impl Into<String>) -> Self {
        ScalarType::Enum(name.into())
    }

    pub fn enum_name(&self) -> Option<&str> {
        match self {
            ScalarType::Enum(name) => Some(name),
            _ => None,
        }
    }
}

impl From<&str> for ScalarType {
    fn from(name: &str) -> Self {
        match name {
            "bool" | "boolean" => ScalarType::Bool,
            "int" | "integer" => ScalarType::Int,
            "unsigned" => ScalarType::Unsigned,
            "float" => ScalarType::Float,
            "double" => ScalarType::Double,
            "string" => ScalarType::String,
            "text" => ScalarType::Text,
            "inet" => ScalarType::Inet,
            "timestamp" => ScalarType::Timestamp,
            "interval" => ScalarType::Interval,
            other => match other.strip_prefix("enum:") {
                Some(name) => ScalarType::Enum(name.to_string()),
                None => ScalarType::Other(other.to_string()),
            },
        }
    }
}

impl From<String> for ScalarType {
    fn from(name: String) -> Self {
        ScalarType::from(name.as_str())
    }
}

impl From<ScalarType> for String {
    fn from(ty: ScalarType) -> Self {
        ty.to_string()
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarType::Bool => f.write_str("bool"),
            ScalarType::Int => f.write_str("int"),
            ScalarType::Unsigned => f.write_str("unsigned"),
            ScalarType::Float => f.write_str("float"),
            ScalarType::Double => f.write_str("double"),
            ScalarType::String => f.write_str("string"),
            ScalarType::Text => f.write_str("text"),
            ScalarType::Inet => f.write_str("inet"),
            ScalarType::Timestamp => f.write_str("timestamp"),
            ScalarType::Interval => f.write_str("interval"),
            ScalarType::Enum(name) => write!(f, "enum:{}", name),
            ScalarType::Other(name) => f.write_str(name),
        }
    }
}

/// What a field holds: a value, or a reference to one or many instances of another type
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Scalar(ScalarType),
    Reference(String),
    ReferenceList(String),
}

impl FieldKind {
    /// Target type name for reference kinds
    pub fn target(&self) -> Option<&str> {
        match self {
            FieldKind::Scalar(_) => None,
            FieldKind::Reference(target) | FieldKind::ReferenceList(target) => Some(target),
        }
    }

    pub fn cardinality(&self) -> Option<Cardinality> {
        match self {
            FieldKind::Scalar(_) => None,
            FieldKind::Reference(_) => Some(Cardinality::One),
            FieldKind::ReferenceList(_) => Some(Cardinality::Many),
        }
    }

    pub fn is_reference(&self) -> bool {
        !matches!(self, FieldKind::Scalar(_))
    }

    /// Same kind with the reference target renamed
    pub fn with_target(&self, target: impl Into<String>) -> FieldKind {
        match self {
            FieldKind::Scalar(ty) => FieldKind::Scalar(ty.clone()),
            FieldKind::Reference(_) => FieldKind::Reference(target.into()),
            FieldKind::ReferenceList(_) => FieldKind::ReferenceList(target.into()),
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Scalar(ty) => write!(f, "{}", ty),
            FieldKind::Reference(target) => write!(f, "{}", target),
            FieldKind::ReferenceList(target) => write!(f, "{}[]", target),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutability {
    /// Declared `const`
    Immutable,
    Mutable,
}

impl Default for Mutability {
    fn default() -> Self {
        Mutability::Mutable
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default)]
    pub mutability: Mutability,
    /// Derived or platform-internal, never requested by a query
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_local: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldDecl {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            mutability: Mutability::Mutable,
            is_local: false,
            description: None,
        }
    }

    pub fn scalar(name: impl Into<String>, ty: ScalarType) -> Self {
        Self::new(name, FieldKind::Scalar(ty))
    }

    pub fn reference(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Reference(target.into()))
    }

    pub fn reference_list(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, FieldKind::ReferenceList(target.into()))
    }

    pub fn immutable(mut self) -> Self {
        self.mutability = Mutability::Immutable;
        self
    }

    pub fn local(mut self) -> Self {
        self.is_local = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A query primitive a platform can natively execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Retrieve,
    Join,
    Selection,
    Projection,
    #[serde(alias = "fullquery")]
    FullQuery,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Retrieve,
        Capability::Join,
        Capability::Selection,
        Capability::Projection,
        Capability::FullQuery,
    ];
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown capability: {0}")]
pub struct ParseCapabilityError(pub String);

impl FromStr for Capability {
    type Err = ParseCapabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "retrieve" => Ok(Capability::Retrieve),
            "join" => Ok(Capability::Join),
            "selection" => Ok(Capability::Selection),
            "projection" => Ok(Capability::Projection),
            "fullquery" | "full_query" => Ok(Capability::FullQuery),
            _ => Err(ParseCapabilityError(s.to_string())),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Retrieve => "retrieve",
            Capability::Join => "join",
            Capability::Selection => "selection",
            Capability::Projection => "projection",
            Capability::FullQuery => "fullquery",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn insert(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    pub fn union(&self, other: &CapabilitySet) -> CapabilitySet {
        CapabilitySet(self.0.union(&other.0).copied().collect())
    }

    pub fn intersection(&self, other: &CapabilitySet) -> CapabilitySet {
        CapabilitySet(self.0.intersection(&other.0).copied().collect())
    }

    pub fn is_superset(&self, other: &CapabilitySet) -> bool {
        self.0.is_superset(&other.0)
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        CapabilitySet(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[Capability; N]> for CapabilitySet {
    fn from(caps: [Capability; N]) -> Self {
        caps.into_iter().collect()
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.0.iter().map(|c| c.to_string()).collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}

/// One platform's declaration of one entity type, for one schema version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDecl {
    pub type_name: String,
    #[serde(default)]
    pub fields: Vec<FieldDecl>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub capabilities: CapabilitySet,
}

impl TypeDecl {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: Vec::new(),
            primary_key: Vec::new(),
            capabilities: CapabilitySet::new(),
        }
    }

    pub fn field(mut self, field: FieldDecl) -> Self {
        self.fields.push(field);
        self
    }

    pub fn key<I, S>(mut self, key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = key.into_iter().map(Into::into).collect();
        self
    }

    pub fn capabilities(mut self, caps: impl Into<CapabilitySet>) -> Self {
        self.capabilities = caps.into();
        self
    }

    pub fn find_field(&self, name: &str) -> Option<&FieldDecl> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Enumeration declared by a metadata document (e.g. `rm_type`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumDecl {
    pub name: String,
    pub values: Vec<String>,
}

impl EnumDecl {
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Everything one platform declares at load time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDocument {
    pub platform: PlatformId,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enums: Vec<EnumDecl>,
    #[serde(default)]
    pub types: Vec<TypeDecl>,
}

impl SchemaDocument {
    pub fn new(platform: impl Into<PlatformId>, version: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            version: version.into(),
            enums: Vec::new(),
            types: Vec::new(),
        }
    }

    pub fn with_type(mut self, decl: TypeDecl) -> Self {
        self.types.push(decl);
        self
    }

    pub fn with_enum(mut self, decl: EnumDecl) -> Self {
        self.enums.push(decl);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    One,
    Many,
}

/// Directed link between two types, derived from a reference field
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationshipEdge {
    pub from_type: String,
    pub to_type: String,
    pub via_field: String,
    pub cardinality: Cardinality,
    pub source_platform: PlatformId,
}
