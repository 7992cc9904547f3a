//! Monitored-layer resolution.
//!
//! `monitored_layers` accepts `"all"`, an explicit index list, or a bare count.
//! [`LayerSelector::resolve`] normalises all three into a [`LayerSelection`]
//! once at startup; nothing downstream sees the raw form.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{config_error, MoxeResult};

/// Raw `monitored_layers` value as written in the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawMonitoredLayers", into = "RawMonitoredLayers")]
pub enum MonitoredLayers {
    #[default]
    All,
    List(Vec<usize>),
    Count(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawMonitoredLayers {
    Keyword(String),
    List(Vec<usize>),
    Count(usize),
}

impl TryFrom<RawMonitoredLayers> for MonitoredLayers {
    type Error = String;

    fn try_from(raw: RawMonitoredLayers) -> Result<Self, Self::Error> {
        match raw {
            RawMonitoredLayers::Keyword(word) if word.eq_ignore_ascii_case("all") => {
                Ok(MonitoredLayers::All)
            }
            RawMonitoredLayers::Keyword(word) => Err(format!(
                "monitored_layers must be \"all\", a list of indices, or a count; got \"{}\"",
                word
            )),
            RawMonitoredLayers::List(list) => Ok(MonitoredLayers::List(list)),
            RawMonitoredLayers::Count(n) => Ok(MonitoredLayers::Count(n)),
        }
    }
}

impl From<MonitoredLayers> for RawMonitoredLayers {
    fn from(layers: MonitoredLayers) -> Self {
        match layers {
            MonitoredLayers::All => RawMonitoredLayers::Keyword("all".to_string()),
            MonitoredLayers::List(list) => RawMonitoredLayers::List(list),
            MonitoredLayers::Count(n) => RawMonitoredLayers::Count(n),
        }
    }
}

/// How a bare count `N` picks layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerCountPolicy {
    /// Layers `0..N`.
    #[default]
    First,
    /// `N` layers spread across the stack, starting at layer 0.
    EvenlySpaced,
    /// The final `N` layers.
    Last,
}

/// Sorted, deduplicated layer indices in `[0, num_layers)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerSelection {
    indices: Vec<usize>,
    num_layers: usize,
}

impl LayerSelection {
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn contains(&self, layer: usize) -> bool {
        self.indices.binary_search(&layer).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.indices.iter().copied()
    }
}

impl fmt::Display for LayerSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.indices.len() == self.num_layers {
            write!(f, "all {} layers", self.num_layers)
        } else {
            write!(f, "{:?} of {}", self.indices, self.num_layers)
        }
    }
}

pub struct LayerSelector;

impl LayerSelector {
    /// Resolve a `monitored_layers` value against a model depth.
    pub fn resolve(
        spec: &MonitoredLayers,
        policy: LayerCountPolicy,
        num_layers: usize,
    ) -> MoxeResult<LayerSelection> {
        if num_layers == 0 {
            return Err(config_error("num_layers must be greater than 0"));
        }

        let indices = match spec {
            MonitoredLayers::All => (0..num_layers).collect(),
            MonitoredLayers::List(list) => {
                if let Some(bad) = list.iter().find(|&&idx| idx >= num_layers) {
                    return Err(config_error(format!(
                        "monitored layer {} out of range for a {}-layer model",
                        bad, num_layers
                    )));
                }
                let mut indices = list.clone();
                indices.sort_unstable();
                indices.dedup();
                indices
            }
            MonitoredLayers::Count(n) => {
                let n = *n;
                if n == 0 || n > num_layers {
                    return Err(config_error(format!(
                        "monitored_layers count {} must be in [1, {}]",
                        n, num_layers
                    )));
                }
                match policy {
                    LayerCountPolicy::First => (0..n).collect(),
                    LayerCountPolicy::Last => (num_layers - n..num_layers).collect(),
                    LayerCountPolicy::EvenlySpaced => {
                        (0..n).map(|i| i * num_layers / n).collect()
                    }
                }
            }
        };

        Ok(LayerSelection {
            indices,
            num_layers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_expands_to_range() {
        let sel =
            LayerSelector::resolve(&MonitoredLayers::All, LayerCountPolicy::First, 12).unwrap();
        assert_eq!(sel.indices(), (0..12).collect::<Vec<_>>().as_slice());
        assert_eq!(sel.to_string(), "all 12 layers");
    }

    #[test]
    fn test_list_sorted_and_deduplicated() {
        let spec = MonitoredLayers::List(vec![11, 3, 7, 3]);
        let sel = LayerSelector::resolve(&spec, LayerCountPolicy::First, 12).unwrap();
        assert_eq!(sel.indices(), &[3, 7, 11]);
        assert!(sel.contains(7));
        assert!(!sel.contains(4));
    }

    #[test]
    fn test_list_out_of_range() {
        let spec = MonitoredLayers::List(vec![0, 12]);
        let err = LayerSelector::resolve(&spec, LayerCountPolicy::First, 12).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_count_policies() {
        let spec = MonitoredLayers::Count(4);
        let first = LayerSelector::resolve(&spec, LayerCountPolicy::First, 12).unwrap();
        assert_eq!(first.indices(), &[0, 1, 2, 3]);
        let last = LayerSelector::resolve(&spec, LayerCountPolicy::Last, 12).unwrap();
        assert_eq!(last.indices(), &[8, 9, 10, 11]);
        let spread = LayerSelector::resolve(&spec, LayerCountPolicy::EvenlySpaced, 12).unwrap();
        assert_eq!(spread.indices(), &[0, 3, 6, 9]);

        for count in [0, 13] {
            let spec = MonitoredLayers::Count(count);
            assert!(LayerSelector::resolve(&spec, LayerCountPolicy::First, 12).is_err());
        }
    }

    #[test]
    fn test_monitored_layers_serde_forms() {
        let all: MonitoredLayers = serde_json::from_str("\"all\"").unwrap();
        assert_eq!(all, MonitoredLayers::All);
        let list: MonitoredLayers = serde_json::from_str("[1, 2]").unwrap();
        assert_eq!(list, MonitoredLayers::List(vec![1, 2]));
        let count: MonitoredLayers = serde_json::from_str("3").unwrap();
        assert_eq!(count, MonitoredLayers::Count(3));
        assert!(serde_json::from_str::<MonitoredLayers>("\"some\"").is_err());

        assert_eq!(serde_json::to_string(&MonitoredLayers::All).unwrap(), "\"all\"");
    }
}
