//! Сущности и контракт одноразовой привязки к модели

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::Model;
use crate::SimError;

/// Общая ссылка на сущность
pub type EntityRef = Arc<Mutex<Entity>>;

/// Хук расширения, вызываемый после завершения привязки
pub type InitHook = Box<dyn FnMut(&mut Entity) + Send>;

/// Базовые параметры инициализации сущности.
///
/// Богатые наборы параметров внешних шаблонов сущностей добавляют свои
/// поля поверх; контракт привязки читает только эти два.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct EntityParams {
    pub id: Option<String>,
    pub entity_name: Option<String>,
}

impl EntityParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.entity_name = Some(name.to_string());
        self
    }
}

/// Объект симуляции.
///
/// Идентификатор и ссылка на модель назначаются не более одного раза:
/// либо при полном конструировании через `Entity::new`, либо позже,
/// единственным вызовом `Entity::initialize`. Модель хранится по имени,
/// без обратного указателя.
pub struct Entity {
    id: Option<String>,
    name: String,
    model: Option<String>,
    initialized: bool,
    free: bool,
    current_holder: Option<String>,
    on_initialized: Option<InitHook>,
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("model", &self.model)
            .field("initialized", &self.initialized)
            .field("free", &self.free)
            .field("current_holder", &self.current_holder)
            .field("on_initialized", &self.on_initialized.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl Entity {
    /// Несвязанная сущность; привязка откладывается до `initialize`
    pub fn bare() -> Self {
        Self {
            id: None,
            name: String::new(),
            model: None,
            initialized: false,
            free: true,
            current_holder: None,
            on_initialized: None,
        }
    }

    /// Сконструировать и сразу привязать к модели
    pub async fn new(model: &Model, params: &EntityParams) -> Result<EntityRef, SimError> {
        let this = Arc::new(Mutex::new(Entity::bare()));
        Entity::initialize(&this, model, params).await?;
        Ok(this)
    }

    /// Одноразовая отложенная привязка.
    ///
    /// Назначает идентификатор (явный или сгенерированный), имя (явное
    /// или равное идентификатору), регистрирует сущность в таблице
    /// модели и вызывает хук. Повторная привязка возвращает ошибку;
    /// существующая привязка при этом не меняется.
    pub async fn initialize(
        this: &EntityRef,
        model: &Model,
        params: &EntityParams,
    ) -> Result<(), SimError> {
        {
            let entity = this.lock().await;
            if entity.initialized || entity.model.is_some() {
                let who = entity
                    .id
                    .clone()
                    .unwrap_or_else(|| entity.name.clone());
                return Err(SimError::AlreadyBound(who));
            }
        }

        let id = match &params.id {
            Some(id) => id.clone(),
            None => model.next_entity_id().await,
        };
        // дубликат идентификатора отвергается до любых изменений сущности
        model.register_entity(&id, this.clone()).await?;

        let mut entity = this.lock().await;
        entity.id = Some(id.clone());
        entity.name = params.entity_name.clone().unwrap_or_else(|| id.clone());
        entity.model = Some(model.name().to_string());
        entity.initialized = true;
        if let Some(mut hook) = entity.on_initialized.take() {
            hook(&mut entity);
            entity.on_initialized = Some(hook);
        }
        debug!("Сущность '{}' привязана к модели '{}'", id, model.name());
        Ok(())
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Имя модели-владельца
    pub fn model_name(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    pub fn set_on_initialized(&mut self, hook: InitHook) {
        self.on_initialized = Some(hook);
    }

    /// Свободна ли сущность как ресурс; меняется только менеджером
    pub fn free(&self) -> bool {
        self.free
    }

    pub fn current_holder(&self) -> Option<&str> {
        self.current_holder.as_deref()
    }

    pub(crate) fn set_free(&mut self, free: bool) {
        self.free = free;
    }

    pub(crate) fn set_current_holder(&mut self, holder: Option<String>) {
        self.current_holder = holder;
    }
}
