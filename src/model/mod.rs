//! Модель: машина состояний прогона и реестр сущностей

mod entity;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::info;

pub use entity::{Entity, EntityParams, EntityRef, InitHook};

use crate::core::{Duration, EventRef, Scheduler, SimTime};
use crate::persist::Snapshot;
use crate::random::SeedSource;
use crate::resources::ResourceManager;
use crate::SimError;

/// Состояние прогона модели
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    NotStarted,
    Running,
    Paused,
    Stopped,
    Interrupted,
    TimeElapsed,
}

/// Модель: владеет планировщиком, продвигает время симуляции и ведет
/// таблицу сущностей по идентификатору.
///
/// Все поля разделяемые, поэтому клон модели служит дешевой ручкой на
/// то же состояние: удобно отдавать ее управляющей задаче для паузы
/// или прерывания на ходу.
#[derive(Clone)]
pub struct Model {
    name: String,
    scheduler: Scheduler,
    state: Arc<Mutex<RunState>>,
    end_time: Arc<Mutex<Option<SimTime>>>,
    entities: Arc<Mutex<HashMap<String, EntityRef>>>,
    entity_counter: Arc<Mutex<u64>>,
    seed_source: Arc<Mutex<SeedSource>>,
    resources: Arc<Mutex<ResourceManager>>,
}

impl Model {
    pub fn new(name: &str) -> Self {
        Self::with_seed_source(name, SeedSource::new())
    }

    /// Модель с базовым зерном для воспроизводимых прогонов
    pub fn with_base_seed(name: &str, base_seed: u64) -> Self {
        Self::with_seed_source(name, SeedSource::with_base_seed(base_seed))
    }

    fn with_seed_source(name: &str, seed_source: SeedSource) -> Self {
        Self {
            name: name.to_string(),
            scheduler: Scheduler::new(),
            state: Arc::new(Mutex::new(RunState::NotStarted)),
            end_time: Arc::new(Mutex::new(None)),
            entities: Arc::new(Mutex::new(HashMap::new())),
            entity_counter: Arc::new(Mutex::new(0)),
            seed_source: Arc::new(Mutex::new(seed_source)),
            resources: Arc::new(Mutex::new(ResourceManager::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub async fn now(&self) -> SimTime {
        self.scheduler.now().await
    }

    pub async fn state(&self) -> RunState {
        *self.state.lock().await
    }

    pub async fn set_end_time(&self, end: Option<SimTime>) {
        *self.end_time.lock().await = end;
    }

    /// Запросить паузу: текущий момент дообрабатывается целиком
    pub fn pause(&self) {
        self.scheduler.control().request_pause();
    }

    /// Запросить прерывание: проверяется между отдельными событиями
    pub fn interrupt(&self) {
        self.scheduler.control().request_interrupt();
    }

    /// Запросить остановку: оставшиеся события отбрасываются
    pub fn stop(&self) {
        self.scheduler.control().request_stop();
    }

    /// Запустить (или возобновить) прогон.
    ///
    /// Допустимо из NotStarted, Paused и Interrupted; из остальных
    /// состояний возвращается ошибка перехода. Цикл обрабатывает момент за
    /// моментом, пока не кончатся события, не истечет заданное время
    /// или не поступит запрос паузы, остановки либо прерывания.
    pub async fn start(&self) -> Result<RunState, SimError> {
        {
            let mut state = self.state.lock().await;
            match *state {
                RunState::NotStarted | RunState::Paused | RunState::Interrupted => {
                    info!("Модель '{}': запуск прогона из {:?}", self.name, *state);
                    *state = RunState::Running;
                }
                from => return Err(SimError::InvalidTransition { from }),
            }
        }
        let flags = self.scheduler.control();
        flags.clear();

        loop {
            if flags.stop_requested() {
                self.scheduler.clear_events().await;
                self.transition(RunState::Stopped).await;
                break;
            }
            if flags.pause_requested() {
                self.transition(RunState::Paused).await;
                break;
            }
            if !self.scheduler.has_events().await {
                // без событий прогон либо исчерпал время, либо окончен
                if let Some(end) = *self.end_time.lock().await {
                    self.advance_to(end).await;
                    self.transition(RunState::TimeElapsed).await;
                } else {
                    self.transition(RunState::Stopped).await;
                }
                break;
            }
            if let Some(end) = *self.end_time.lock().await {
                let beyond = match self.scheduler.next_event_time().await {
                    Some(next) => next > end,
                    // пустой кэш при непустой очереди: ждут только
                    // немедленные события текущего момента
                    None => false,
                };
                if beyond {
                    self.advance_to(end).await;
                    self.transition(RunState::TimeElapsed).await;
                    break;
                }
            }

            if let Err(e) = self.scheduler.process_next_point_in_time().await {
                self.transition(RunState::Stopped).await;
                return Err(e);
            }
            if flags.interrupt_requested() {
                self.transition(RunState::Interrupted).await;
                break;
            }

            tokio::task::yield_now().await;
        }

        let finished = self.state().await;
        info!(
            "Модель '{}': прогон завершен в состоянии {:?}, время {}",
            self.name,
            finished,
            self.now().await
        );
        Ok(finished)
    }

    /// Прогон до указанного времени симуляции
    pub async fn run_until(&self, end: SimTime) -> Result<RunState, SimError> {
        self.set_end_time(Some(end)).await;
        self.start().await
    }

    /// Прогон на указанную длительность от текущего времени
    pub async fn run_for(&self, duration: Duration) -> Result<RunState, SimError> {
        let end = self.now().await + duration;
        self.run_until(end).await
    }

    // часы не идут назад, даже если заданный конец уже в прошлом
    async fn advance_to(&self, end: SimTime) {
        if end > self.now().await {
            self.scheduler.set_now(end).await;
        }
    }

    async fn transition(&self, to: RunState) {
        let mut state = self.state.lock().await;
        if *state != to {
            info!("Модель '{}': {:?} -> {:?}", self.name, *state, to);
            *state = to;
        }
    }

    /// Зарегистрировать уже привязанную сущность по ее идентификатору
    pub async fn add_entity(&self, entity: EntityRef) -> Result<(), SimError> {
        let id = {
            let guard = entity.lock().await;
            match guard.id() {
                Some(id) => id.to_string(),
                None => return Err(SimError::from("entity has no identifier")),
            }
        };
        self.register_entity(&id, entity).await
    }

    pub(crate) async fn register_entity(
        &self,
        id: &str,
        entity: EntityRef,
    ) -> Result<(), SimError> {
        let mut entities = self.entities.lock().await;
        if entities.contains_key(id) {
            return Err(SimError::DuplicateEntity(id.to_string()));
        }
        entities.insert(id.to_string(), entity);
        Ok(())
    }

    pub async fn has_entity(&self, id: &str) -> bool {
        self.entities.lock().await.contains_key(id)
    }

    pub async fn get_entity(&self, id: &str) -> Option<EntityRef> {
        self.entities.lock().await.get(id).cloned()
    }

    /// Отобрать сущности, удовлетворяющие предикату
    pub async fn find_entities<F>(&self, predicate: F) -> Vec<EntityRef>
    where
        F: Fn(&Entity) -> bool,
    {
        let entities: Vec<EntityRef> = self.entities.lock().await.values().cloned().collect();
        let mut found = Vec::new();
        for entity in entities {
            if predicate(&*entity.lock().await) {
                found.push(entity.clone());
            }
        }
        found
    }

    pub async fn entity_count(&self) -> usize {
        self.entities.lock().await.len()
    }

    /// Сгенерировать свободный идентификатор сущности
    pub(crate) async fn next_entity_id(&self) -> String {
        let mut counter = self.entity_counter.lock().await;
        loop {
            *counter += 1;
            let id = format!("entity-{}", *counter);
            if !self.entities.lock().await.contains_key(&id) {
                return id;
            }
        }
    }

    /// Источник зерен случайности этой модели
    pub fn seed_source(&self) -> Arc<Mutex<SeedSource>> {
        self.seed_source.clone()
    }

    /// Зерно для потребителя случайности по его идентификатору
    pub async fn random_seed_for(&self, seed_id: u64) -> Result<u64, SimError> {
        self.seed_source.lock().await.get_random_seed_for(seed_id)
    }

    /// Менеджер ресурсов по умолчанию
    pub fn resources(&self) -> Arc<Mutex<ResourceManager>> {
        self.resources.clone()
    }

    /// Вернуть модель в NotStarted для нового независимого прогона
    pub async fn reset(&self) {
        self.scheduler.reset().await;
        *self.state.lock().await = RunState::NotStarted;
        *self.end_time.lock().await = None;
        self.entities.lock().await.clear();
        *self.entity_counter.lock().await = 0;
        info!("Модель '{}' сброшена", self.name);
    }

    pub async fn get_stats(&self) -> serde_json::Value {
        let resources = self.resources.lock().await;
        json!({
            "name": self.name,
            "time": self.now().await.as_seconds(),
            "state": format!("{:?}", self.state().await),
            "entities": self.entity_count().await,
            "events_processed": self.scheduler.event_counter().await,
            "handlers_invoked": self.scheduler.handler_counter().await,
            "resources": resources.stats().await,
        })
    }

    /// Сохранить состояние модели вместе с планировщиком
    pub async fn save_state(&self, snapshot: &mut Snapshot) -> Result<(), SimError> {
        snapshot.add_value("model.name", &self.name)?;
        snapshot.add_value("model.state", &self.state().await)?;
        snapshot.add_value("model.end_time", &*self.end_time.lock().await)?;
        self.scheduler.save_state(snapshot).await
    }

    /// Восстановить состояние модели и планировщика из среза
    pub async fn restore_state(
        &self,
        snapshot: &Snapshot,
        registry: &HashMap<String, EventRef>,
    ) -> Result<(), SimError> {
        let state: RunState = snapshot.get_value("model.state")?;
        let end_time: Option<SimTime> = snapshot.get_value("model.end_time")?;
        self.scheduler.restore_state(snapshot, registry).await?;
        *self.state.lock().await = state;
        *self.end_time.lock().await = end_time;
        Ok(())
    }
}
