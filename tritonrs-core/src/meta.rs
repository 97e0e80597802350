use std::collections::HashSet;

use indexmap::IndexMap;

use crate::{value::Value, Error, Result};

/// Named kernel parameters resolved for a single launch.
///
/// Keeps the declared names in declaration order alongside the subset that
/// could be bound. Names that found no value are absent, not defaulted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataMapping {
    declared: Vec<String>,
    values: IndexMap<String, Value>,
}

impl MetadataMapping {
    pub fn declared(&self) -> &[String] {
        &self.declared
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn require(&self, name: &str) -> Result<&Value> {
        self.values.get(name).ok_or_else(|| Error::missing(name))
    }

    pub fn require_int(&self, name: &str) -> Result<i64> {
        let value = self.require(name)?;
        value.as_int().ok_or_else(|| {
            Error::InvalidBinding(format!(
                "metadata `{name}` must be an integer, got {}",
                value.type_name()
            ))
        })
    }

    /// An integer that is at least one, such as a tile size used as a divisor.
    pub fn require_positive(&self, name: &str) -> Result<u64> {
        let value = self.require_int(name)?;
        u64::try_from(value)
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| {
                Error::InvalidBinding(format!("metadata `{name}` must be positive, got {value}"))
            })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Bind declared names that are still absent to their entry in `fallback`.
    pub fn fill_unbound(&mut self, fallback: &IndexMap<String, Value>) {
        if fallback.is_empty() {
            return;
        }
        let mut values = IndexMap::with_capacity(self.declared.len());
        for name in &self.declared {
            let value = match self.values.swap_remove(name) {
                Some(value) => value,
                None => match fallback.get(name) {
                    Some(value) => value.clone(),
                    None => continue,
                },
            };
            values.insert(name.clone(), value);
        }
        self.values = values;
    }
}

/// Bind each declared name to a value.
///
/// Names are visited left to right. While positional values remain, the next
/// one is consumed for the current name; once they run out, the keyword table
/// is consulted. A keyword for a name that was already bound positionally is
/// ignored, and surplus positional values are left for the caller.
pub fn assemble<S: AsRef<str>>(
    declared: &[S],
    positional: &[Value],
    keyword: &IndexMap<String, Value>,
) -> Result<MetadataMapping> {
    let mut seen = HashSet::with_capacity(declared.len());
    for name in declared {
        if !seen.insert(name.as_ref()) {
            return Err(Error::InvalidBinding(format!(
                "parameter `{}` is declared more than once",
                name.as_ref()
            )));
        }
    }

    let mut args = positional.iter();
    let mut values = IndexMap::with_capacity(declared.len());
    for name in declared {
        let name = name.as_ref();
        if let Some(value) = args.next() {
            values.insert(name.to_string(), value.clone());
        } else if let Some(value) = keyword.get(name) {
            values.insert(name.to_string(), value.clone());
        }
    }

    Ok(MetadataMapping {
        declared: declared.iter().map(|n| n.as_ref().to_string()).collect(),
        values,
    })
}

/// Builds the ordered declared-name list at a wrapper call site.
#[derive(Debug, Clone, Default)]
pub struct MetaBuilder {
    names: Vec<String>,
}

impl MetaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.names.push(name.into());
        self
    }

    pub fn params<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn assemble(
        &self,
        positional: &[Value],
        keyword: &IndexMap<String, Value>,
    ) -> Result<MetadataMapping> {
        assemble(&self.names, positional, keyword)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kw(pairs: &[(&str, i64)]) -> IndexMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::Int(*v)))
            .collect()
    }

    #[test]
    fn test_positional_values_bind_before_keywords() {
        let meta = assemble(
            &["A", "B", "C"],
            &[Value::Int(1), Value::Int(2)],
            &kw(&[("C", 3), ("A", 99)]),
        )
        .unwrap();
        assert_eq!(meta.get("A"), Some(&Value::Int(1)));
        assert_eq!(meta.get("B"), Some(&Value::Int(2)));
        assert_eq!(meta.get("C"), Some(&Value::Int(3)));
        assert_eq!(meta.len(), 3);
    }

    #[test]
    fn test_unbound_names_are_absent() {
        let meta = assemble(&["A", "B"], &[], &kw(&[("B", 5)])).unwrap();
        assert!(!meta.contains("A"));
        assert_eq!(meta.get("B"), Some(&Value::Int(5)));
        assert_eq!(meta.declared(), &["A".to_string(), "B".to_string()]);
        assert!(matches!(
            meta.require("A"),
            Err(Error::MissingMetadata { name }) if name == "A"
        ));
    }

    #[test]
    fn test_surplus_positional_values_are_ignored() {
        let positional = vec![Value::Int(1), Value::Int(2), Value::Int(3)];
        let meta = assemble(&["A"], &positional, &IndexMap::new()).unwrap();
        assert_eq!(meta.len(), 1);
        assert_eq!(meta.get("A"), Some(&Value::Int(1)));
        assert_eq!(positional.len(), 3);
    }

    #[test]
    fn test_duplicate_declared_names_fail() {
        let err = assemble(&["A", "A"], &[Value::Int(1)], &IndexMap::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidBinding(_)));
    }

    #[test]
    fn test_fallback_fills_only_unbound_names() {
        let mut meta = assemble(&["A", "B", "C"], &[Value::Int(1)], &kw(&[("C", 3)])).unwrap();
        meta.fill_unbound(&kw(&[("A", 10), ("B", 20), ("D", 40)]));
        let bound: Vec<_> = meta.iter().map(|(k, v)| (k, v.as_int().unwrap())).collect();
        assert_eq!(bound, vec![("A", 1), ("B", 20), ("C", 3)]);
    }

    #[test]
    fn test_resolved_order_follows_declaration() {
        let meta = MetaBuilder::new()
            .params(["x", "y", "BLOCK"])
            .assemble(&[Value::from("a"), Value::from(2.5f64)], &kw(&[("BLOCK", 64)]))
            .unwrap();
        let names: Vec<_> = meta.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["x", "y", "BLOCK"]);
        assert_eq!(meta.require_int("BLOCK").unwrap(), 64);
        assert!(matches!(meta.require_int("x"), Err(Error::InvalidBinding(_))));
    }

    #[test]
    fn test_tile_sizes_must_be_positive() {
        let keywords = kw(&[("BLOCK", 128), ("ZERO", 0), ("NEG", -4)]);
        let meta = assemble(&["BLOCK", "ZERO", "NEG"], &[], &keywords).unwrap();
        assert_eq!(meta.require_positive("BLOCK").unwrap(), 128);
        assert!(matches!(meta.require_positive("ZERO"), Err(Error::InvalidBinding(_))));
        assert!(matches!(meta.require_positive("NEG"), Err(Error::InvalidBinding(_))));
        assert!(matches!(
            meta.require_positive("MISSING"),
            Err(Error::MissingMetadata { .. })
        ));
    }
}
