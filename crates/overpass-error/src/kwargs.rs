use std::collections::BTreeMap;
use std::fmt;

/// User-attached identifiers carried by a query for logging and telemetry.
///
/// Kept as a simple string map rather than an arbitrary value bag: the core
/// never inspects these values, it only threads them through errors and
/// `tracing` fields so operators can correlate a failure with the caller's
/// own request IDs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryContext {
    fields: BTreeMap<String, String>,
}

impl QueryContext {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy with `key` set to `value`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Looks up a field by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// True if no fields are set.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates over `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in self.iter() {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for QueryContext {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats_key_value_pairs_in_order() {
        let ctx = QueryContext::new().with("b", "2").with("a", "1");
        assert_eq!(ctx.to_string(), "a=1, b=2");
    }

    #[test]
    fn empty_context_displays_as_empty_string() {
        assert_eq!(QueryContext::new().to_string(), "");
    }
}
