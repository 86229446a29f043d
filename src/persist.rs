//! Именованный срез состояния "ключ-значение"

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::SimError;

/// Снимок состояния: упорядоченный набор именованных значений.
///
/// Конкретный формат на диске не фиксируется: снимок сам сериализуем,
/// так что подойдет любой формат serde, сохраняющий поля точно.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    values: BTreeMap<String, serde_json::Value>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Записать значение под ключом; прежнее значение замещается
    pub fn add_value<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), SimError> {
        let value = serde_json::to_value(value)?;
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    /// Прочитать значение по ключу
    pub fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<T, SimError> {
        let value = self
            .values
            .get(key)
            .ok_or_else(|| SimError::MissingSnapshotKey(key.to_string()))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Текстовое представление в формате RON
    pub fn to_ron(&self) -> Result<String, SimError> {
        Ok(ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?)
    }

    pub fn from_ron(text: &str) -> Result<Self, SimError> {
        Ok(ron::from_str(text)?)
    }
}
