//! Управление ресурсами симуляции

use std::collections::{HashMap, VecDeque};

use serde_json::json;
use tracing::debug;

use crate::model::EntityRef;
use crate::SimError;

struct Managed {
    entity: EntityRef,
    waiting: VecDeque<String>,
    total_requests: u64,
}

/// Менеджер ресурсов: координирует захват и освобождение сущностей.
///
/// Поля `free` и `current_holder` сущности снаружи только читаются;
/// меняет их исключительно менеджер.
pub struct ResourceManager {
    resources: HashMap<String, Managed>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            resources: HashMap::new(),
        }
    }

    /// Взять сущность под управление как ресурс
    pub async fn manage(&mut self, entity: EntityRef) -> Result<(), SimError> {
        let id = {
            let guard = entity.lock().await;
            match guard.id() {
                Some(id) => id.to_string(),
                None => return Err(SimError::from("resource entity has no identifier")),
            }
        };
        self.resources.insert(
            id.clone(),
            Managed {
                entity,
                waiting: VecDeque::new(),
                total_requests: 0,
            },
        );
        debug!("Ресурс '{}' взят под управление", id);
        Ok(())
    }

    pub fn is_managed(&self, resource_id: &str) -> bool {
        self.resources.contains_key(resource_id)
    }

    /// Попытка захватить ресурс. Возвращает `true`, если ресурс выдан
    /// немедленно, иначе запрос встает в очередь ожидания.
    pub async fn request(&mut self, resource_id: &str, requester_id: &str) -> bool {
        let Some(managed) = self.resources.get_mut(resource_id) else {
            return false;
        };
        managed.total_requests += 1;
        let mut entity = managed.entity.lock().await;
        if entity.free() {
            entity.set_free(false);
            entity.set_current_holder(Some(requester_id.to_string()));
            true
        } else {
            drop(entity);
            managed.waiting.push_back(requester_id.to_string());
            debug!("'{}' встал в очередь к '{}'", requester_id, resource_id);
            false
        }
    }

    /// Освободить ресурс; освобождение сразу перепроверяет очередь
    pub async fn release(&mut self, resource_id: &str) {
        if let Some(managed) = self.resources.get_mut(resource_id) {
            let mut entity = managed.entity.lock().await;
            entity.set_free(true);
            entity.set_current_holder(None);
        }
        self.update().await;
    }

    /// Перераздать свободные ресурсы ожидающим в порядке очереди
    pub async fn update(&mut self) {
        for (id, managed) in self.resources.iter_mut() {
            let mut entity = managed.entity.lock().await;
            if entity.free() {
                if let Some(next) = managed.waiting.pop_front() {
                    entity.set_free(false);
                    entity.set_current_holder(Some(next.clone()));
                    debug!("Ресурс '{}' выдан из очереди '{}'", id, next);
                }
            }
        }
    }

    pub fn queue_length(&self, resource_id: &str) -> usize {
        self.resources
            .get(resource_id)
            .map(|m| m.waiting.len())
            .unwrap_or(0)
    }

    /// Статистика по ресурсам
    pub async fn stats(&self) -> Vec<serde_json::Value> {
        let mut stats = Vec::with_capacity(self.resources.len());
        for (id, managed) in &self.resources {
            let entity = managed.entity.lock().await;
            stats.push(json!({
                "id": id,
                "name": entity.name(),
                "free": entity.free(),
                "current_holder": entity.current_holder(),
                "queue_length": managed.waiting.len(),
                "total_requests": managed.total_requests,
            }));
        }
        stats
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}
