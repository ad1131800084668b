use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::value::Value;

/// One sampled set of model parameter values.
///
/// Immutable once constructed; every point gets a fresh id so results of concurrently evaluated
/// points can be told apart.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ParameterPoint {
    #[serde(default = "Uuid::new_v4")]
    id: Uuid,
    model: String,
    values: Vec<(String, f64)>,
}

impl ParameterPoint {
    pub fn new<K: Into<String>>(
        model: impl Into<String>,
        values: impl IntoIterator<Item = (K, f64)>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            model: model.into(),
            values: values.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| *v)
    }

    /// Parameters in declaration order.
    pub fn values(&self) -> &[(String, f64)] {
        &self.values
    }

    pub fn to_value(&self) -> Value {
        Value::map(self.values.iter().map(|(k, v)| (k.clone(), *v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn points_get_distinct_ids() {
        let a = ParameterPoint::new("SingletDM", [("mS", 100.0)]);
        let b = ParameterPoint::new("SingletDM", [("mS", 100.0)]);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.get("mS"), Some(100.0));
        assert_eq!(a.get("lambda"), None);
    }

    #[test]
    fn values_keep_declaration_order() {
        let p = ParameterPoint::new("M", [("z", 1.0), ("a", 2.0)]);
        let names: Vec<_> = p.values().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["z", "a"]);
        assert_eq!(p.to_value().get("a").and_then(Value::as_number), Some(2.0));
    }
}
