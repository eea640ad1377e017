//! Collection schemas.
//!
//! A [`CollectionSpec`] names a document namespace, the facets indexed in
//! it and how each facet's values are normalized before they become part of
//! an index key. It also lists which body fields free-text search scans and
//! which roles may write.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use kiln_types::{Document, Principal, Role};

use crate::error::IndexError;

/// How a facet value is normalized before indexing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalize {
    /// Trimmed, otherwise verbatim.
    #[default]
    Exact,
    /// Trimmed and lowercased.
    Lowercase,
    /// Social handle: trimmed, leading `@` stripped, lowercased.
    Handle,
}

impl Normalize {
    /// Normalize one value. Returns `None` when nothing indexable remains.
    pub fn apply(self, value: &str) -> Option<String> {
        let trimmed = value.trim();
        let normalized = match self {
            Self::Exact => trimmed.to_owned(),
            Self::Lowercase => trimmed.to_lowercase(),
            Self::Handle => trimmed.trim_start_matches('@').trim().to_lowercase(),
        };
        (!normalized.is_empty()).then_some(normalized)
    }
}

/// One indexed facet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetSpec {
    /// Facet name. Must not contain `:`.
    pub name: String,
    /// Value normalization.
    #[serde(default)]
    pub normalize: Normalize,
}

/// Schema of one indexed collection.
///
/// The namespace is a single key segment: it must be non-empty and free of
/// `:`, otherwise one collection's keys would fall under another's prefix
/// (`doc:user:` also matches `doc:user:profile:…`). Deserialization and
/// [`IndexManager::new`](crate::IndexManager::new) both reject such schemas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCollectionSpec")]
pub struct CollectionSpec {
    /// Key namespace (`doc:{namespace}:{id}`).
    pub namespace: String,
    /// Declared facets.
    #[serde(default)]
    pub facets: Vec<FacetSpec>,
    /// Body fields scanned by free-text search.
    #[serde(default)]
    pub searchable: Vec<String>,
    /// Roles allowed to mutate. Empty means any role.
    #[serde(default)]
    pub writers: Vec<Role>,
}

/// Wire form of [`CollectionSpec`], validated on conversion.
#[derive(Deserialize)]
struct RawCollectionSpec {
    namespace: String,
    #[serde(default)]
    facets: Vec<FacetSpec>,
    #[serde(default)]
    searchable: Vec<String>,
    #[serde(default)]
    writers: Vec<Role>,
}

impl TryFrom<RawCollectionSpec> for CollectionSpec {
    type Error = IndexError;

    fn try_from(raw: RawCollectionSpec) -> Result<Self, Self::Error> {
        let spec = Self {
            namespace: raw.namespace,
            facets: raw.facets,
            searchable: raw.searchable,
            writers: raw.writers,
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// Normalized facet values of a document: facet name to distinct values.
pub type FacetValues = BTreeMap<String, BTreeSet<String>>;

/// A key segment must be non-empty and must not contain `:`.
fn is_segment(name: &str) -> bool {
    !name.is_empty() && !name.contains(':')
}

impl CollectionSpec {
    /// A collection with no declared facets.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            facets: Vec::new(),
            searchable: Vec::new(),
            writers: Vec::new(),
        }
    }

    /// Builder: declare a facet.
    #[must_use]
    pub fn facet(mut self, name: &str, normalize: Normalize) -> Self {
        self.facets.push(FacetSpec {
            name: name.to_owned(),
            normalize,
        });
        self
    }

    /// Builder: declare a searchable body field.
    #[must_use]
    pub fn searchable(mut self, field: &str) -> Self {
        self.searchable.push(field.to_owned());
        self
    }

    /// Builder: restrict writers.
    #[must_use]
    pub fn writers(mut self, roles: &[Role]) -> Self {
        self.writers = roles.to_vec();
        self
    }

    /// The campaign project collection.
    pub fn projects() -> Self {
        Self::new("project")
            .facet("stage", Normalize::Lowercase)
            .facet("priority", Normalize::Lowercase)
            .facet("assignee", Normalize::Handle)
            .facet("creator", Normalize::Handle)
            .facet("twitter", Normalize::Handle)
            .searchable("name")
            .searchable("description")
            .searchable("twitterHandle")
            .writers(&[Role::Admin, Role::Core, Role::Member])
    }

    /// Check that the namespace and every facet name are single key segments.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::InvalidSchema`] naming the offending segment.
    pub fn validate(&self) -> Result<(), IndexError> {
        if !is_segment(&self.namespace) {
            return Err(IndexError::InvalidSchema {
                namespace: self.namespace.clone(),
                reason: "namespace must be non-empty and contain no ':'".to_owned(),
            });
        }
        if let Some(facet) = self.facets.iter().find(|f| !is_segment(&f.name)) {
            return Err(IndexError::InvalidSchema {
                namespace: self.namespace.clone(),
                reason: format!("facet {:?} must be non-empty and contain no ':'", facet.name),
            });
        }
        Ok(())
    }

    /// Whether `facet` is declared in this schema.
    pub fn is_declared(&self, facet: &str) -> bool {
        self.facets.iter().any(|f| f.name == facet)
    }

    /// Normalization rule for `facet`; undeclared facets are [`Normalize::Exact`].
    pub fn rule(&self, facet: &str) -> Normalize {
        self.facets
            .iter()
            .find(|f| f.name == facet)
            .map_or(Normalize::Exact, |f| f.normalize)
    }

    /// Normalize a single value of `facet`.
    pub fn normalize(&self, facet: &str, value: &str) -> Option<String> {
        self.rule(facet).apply(value)
    }

    /// Normalize a raw facet map: values normalized, empties dropped,
    /// duplicates collapsed, facets left without values removed.
    pub fn normalize_facets(&self, raw: &BTreeMap<String, Vec<String>>) -> FacetValues {
        raw.iter()
            .filter(|(name, _)| is_segment(name))
            .filter_map(|(name, values)| {
                let rule = self.rule(name);
                let set: BTreeSet<String> = values.iter().filter_map(|v| rule.apply(v)).collect();
                (!set.is_empty()).then(|| (name.clone(), set))
            })
            .collect()
    }

    /// Check that `principal` may mutate this collection.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Unauthorized`] if the collection restricts
    /// writers and the principal's role is not among them.
    pub fn authorize(&self, principal: &Principal) -> Result<(), IndexError> {
        if principal.role == Role::System
            || self.writers.is_empty()
            || self.writers.contains(&principal.role)
        {
            return Ok(());
        }
        Err(IndexError::Unauthorized {
            principal: principal.id.clone(),
            role: principal.role,
            namespace: self.namespace.clone(),
        })
    }
}

/// Write normalized facet values back into the document's wire shape.
pub fn into_raw(values: &FacetValues) -> BTreeMap<String, Vec<String>> {
    values
        .iter()
        .map(|(name, set)| (name.clone(), set.iter().cloned().collect()))
        .collect()
}

/// Normalized facets of a stored document.
pub fn facets_of(spec: &CollectionSpec, doc: &Document) -> FacetValues {
    spec.normalize_facets(&doc.facets)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn handle_normalization() {
        assert_eq!(Normalize::Handle.apply(" @KolName "), Some("kolname".to_owned()));
        assert_eq!(Normalize::Handle.apply("@"), None);
        assert_eq!(Normalize::Lowercase.apply("Active"), Some("active".to_owned()));
        assert_eq!(Normalize::Exact.apply("   "), None);
    }

    #[test]
    fn normalize_facets_drops_empties_and_duplicates() {
        let spec = CollectionSpec::projects();
        let mut raw = BTreeMap::new();
        raw.insert("twitter".to_owned(), vec!["@Foo".to_owned(), "foo".to_owned()]);
        raw.insert("stage".to_owned(), vec![String::new()]);
        raw.insert("bad:name".to_owned(), vec!["x".to_owned()]);
        let values = spec.normalize_facets(&raw);
        assert_eq!(values.len(), 1);
        assert_eq!(values.get("twitter").map(BTreeSet::len), Some(1));
    }

    #[test]
    fn writers_are_enforced_except_for_system() {
        let spec = CollectionSpec::projects();
        assert!(spec.authorize(&Principal::new("u1", Role::Viewer)).is_err());
        assert!(spec.authorize(&Principal::new("u2", Role::Core)).is_ok());
        assert!(spec.authorize(&Principal::system()).is_ok());
        assert!(CollectionSpec::new("open").authorize(&Principal::new("u3", Role::Viewer)).is_ok());
    }

    #[test]
    fn namespaces_must_be_single_segments() {
        assert!(CollectionSpec::projects().validate().is_ok());
        for bad in ["", "user:profile"] {
            let err = CollectionSpec::new(bad).validate().unwrap_err();
            assert_eq!(err.class(), kiln_types::ErrorClass::PermanentFailure);
        }
        let bad_facet = CollectionSpec::new("user").facet("a:b", Normalize::Exact);
        assert!(bad_facet.validate().is_err());

        let json = r#"{"namespace":"user:profile"}"#;
        assert!(serde_json::from_str::<CollectionSpec>(json).is_err());
    }

    #[test]
    fn schema_deserializes_with_defaults() {
        let json = r#"{"namespace":"user","facets":[{"name":"role"}]}"#;
        let spec: Result<CollectionSpec, _> = serde_json::from_str(json);
        assert!(spec.is_ok_and(|s| s.rule("role") == Normalize::Exact && s.writers.is_empty()));
    }
}
