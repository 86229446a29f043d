//! Основное ядро обработки событий

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::event::{ContextCommand, EventContext, EventInstance, EventRef};
use super::priority::Priority;
use super::time::{Duration, SimTime};
use crate::persist::Snapshot;
use crate::SimError;

/// Фаза обработки текущего момента
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Batch,
    Immediate,
}

/// Флаги кооперативного управления прогоном.
///
/// Пауза и остановка проверяются между моментами времени, а прерывание
/// проверяется между отдельными событиями внутри момента.
#[derive(Debug, Default)]
pub struct ControlFlags {
    interrupt: AtomicBool,
    pause: AtomicBool,
    stop: AtomicBool,
}

impl ControlFlags {
    pub fn request_interrupt(&self) {
        self.interrupt.store(true, AtomicOrdering::SeqCst);
    }

    pub fn interrupt_requested(&self) -> bool {
        self.interrupt.load(AtomicOrdering::SeqCst)
    }

    pub fn request_pause(&self) {
        self.pause.store(true, AtomicOrdering::SeqCst);
    }

    pub fn pause_requested(&self) -> bool {
        self.pause.load(AtomicOrdering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, AtomicOrdering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(AtomicOrdering::SeqCst)
    }

    /// Сбросить все запросы; вызывается при запуске и возобновлении
    pub fn clear(&self) {
        self.interrupt.store(false, AtomicOrdering::SeqCst);
        self.pause.store(false, AtomicOrdering::SeqCst);
        self.stop.store(false, AtomicOrdering::SeqCst);
    }
}

/// Непрозрачный токен запланированного события, нужен для снятия
#[derive(Debug, Clone, Copy)]
pub struct EventToken {
    time: SimTime,
    priority: Priority,
}

impl EventToken {
    pub fn time(&self) -> SimTime {
        self.time
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }
}

struct QueueState {
    // время -> (приоритет -> экземпляр); порядок добавления в ключе
    // приоритета делает коллизии невозможными
    map: BTreeMap<SimTime, BTreeMap<Priority, EventInstance>>,
    immediate: BTreeMap<Priority, EventInstance>,
    order_counter: u64,
    next_event_time: Option<SimTime>,
    phase: Phase,
}

impl QueueState {
    fn new() -> Self {
        Self {
            map: BTreeMap::new(),
            immediate: BTreeMap::new(),
            order_counter: 0,
            next_event_time: None,
            phase: Phase::Idle,
        }
    }
}

#[derive(Default)]
struct Counters {
    events: u64,
    handlers: u64,
}

#[derive(Default)]
struct Tracking {
    current: Option<EventInstance>,
    last: Option<EventInstance>,
}

/// Планировщик событий.
///
/// Владеет очередью, упорядоченной по времени и приоритету, и
/// алгоритмом обработки очередного момента времени.
#[derive(Clone)]
pub struct Scheduler {
    current_time: Arc<Mutex<SimTime>>,
    queue: Arc<Mutex<QueueState>>,
    counters: Arc<Mutex<Counters>>,
    tracking: Arc<Mutex<Tracking>>,
    flags: Arc<ControlFlags>,
    logging: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            current_time: Arc::new(Mutex::new(SimTime::ZERO)),
            queue: Arc::new(Mutex::new(QueueState::new())),
            counters: Arc::new(Mutex::new(Counters::default())),
            tracking: Arc::new(Mutex::new(Tracking::default())),
            flags: Arc::new(ControlFlags::default()),
            logging: Arc::new(AtomicBool::new(true)),
        }
    }

    pub async fn now(&self) -> SimTime {
        *self.current_time.lock().await
    }

    pub(crate) async fn set_now(&self, time: SimTime) {
        *self.current_time.lock().await = time;
    }

    /// Общие флаги управления; модель разделяет их с планировщиком
    pub fn control(&self) -> Arc<ControlFlags> {
        self.flags.clone()
    }

    pub fn logging_enabled(&self) -> bool {
        self.logging.load(AtomicOrdering::SeqCst)
    }

    pub fn set_logging_enabled(&self, enabled: bool) {
        self.logging.store(enabled, AtomicOrdering::SeqCst);
    }

    /// Запланировать экземпляр на абсолютное время.
    ///
    /// Время обязано быть конечным и строго больше текущего; значение
    /// приоритета не может быть NaN. Возвращенный токен служит для
    /// последующего снятия события.
    pub async fn add(
        &self,
        time: SimTime,
        mut instance: EventInstance,
    ) -> Result<EventToken, SimError> {
        if !time.is_finite() {
            return Err(SimError::InvalidTime(time.as_seconds()));
        }
        if instance.priority().value().is_nan() {
            return Err(SimError::InvalidPriority);
        }
        let now = self.now().await;
        if time <= now {
            return Err(SimError::TimeNotInFuture {
                time: time.as_seconds(),
                now: now.as_seconds(),
            });
        }

        let mut queue = self.queue.lock().await;
        queue.order_counter += 1;
        instance.set_order(queue.order_counter);
        instance.set_time(time);
        let token = EventToken {
            time,
            priority: instance.priority(),
        };
        queue
            .map
            .entry(time)
            .or_default()
            .insert(instance.priority(), instance);
        queue.next_event_time = Some(match queue.next_event_time {
            Some(cached) if cached <= time => cached,
            _ => time,
        });

        debug!("Событие запланировано на время {}", time);
        Ok(token)
    }

    /// Запланировать экземпляр через задержку от текущего времени
    pub async fn add_after(
        &self,
        delay: Duration,
        instance: EventInstance,
    ) -> Result<EventToken, SimError> {
        let time = self.now().await + delay;
        self.add(time, instance).await
    }

    /// Немедленное событие: выполняется после основной партии текущего
    /// момента. Допустимо только изнутри обработки основной партии.
    pub async fn add_event_now(&self, mut instance: EventInstance) -> Result<(), SimError> {
        if instance.priority().value().is_nan() {
            return Err(SimError::InvalidPriority);
        }
        let now = self.now().await;
        let mut queue = self.queue.lock().await;
        match queue.phase {
            Phase::Idle => Err(SimError::ImmediateOutsideProcessing),
            Phase::Immediate => Err(SimError::ImmediateRecursion),
            Phase::Batch => {
                queue.order_counter += 1;
                instance.set_order(queue.order_counter);
                instance.set_time(now);
                queue.immediate.insert(instance.priority(), instance);
                Ok(())
            }
        }
    }

    /// Снять еще не обработанное событие.
    /// `false`, если его уже нет в очереди: это штатный исход.
    pub async fn remove(&self, token: &EventToken) -> bool {
        let mut queue = self.queue.lock().await;
        let removed = match queue.map.get_mut(&token.time) {
            Some(bucket) => {
                let removed = bucket.remove(&token.priority).is_some();
                if removed && bucket.is_empty() {
                    queue.map.remove(&token.time);
                }
                removed
            }
            None => false,
        };
        if removed {
            queue.next_event_time = queue.map.first_key_value().map(|(&t, _)| t);
        }
        removed
    }

    /// Обработать ближайший момент времени.
    ///
    /// Время симуляции прыгает к наименьшему ключу очереди; события
    /// этого момента вызываются по возрастанию приоритета. Перед каждым
    /// вызовом проверяется флаг прерывания: уже вызванные события из
    /// корзины удалены, невызванные остаются до возобновления прогона.
    pub async fn process_next_point_in_time(&self) -> Result<SimTime, SimError> {
        let current = self.now().await;
        let now = {
            let mut queue = self.queue.lock().await;
            let at = if !queue.immediate.is_empty() {
                // недообработанный момент после прерывания
                current
            } else if let Some((&time, _)) = queue.map.first_key_value() {
                time
            } else {
                return Err(SimError::EmptyQueue);
            };
            queue.phase = Phase::Batch;
            at
        };
        self.set_now(now).await;
        debug!("Обработка момента {}", now);

        let result = self.run_instant(now).await;

        {
            let mut queue = self.queue.lock().await;
            queue.phase = Phase::Idle;
            queue.next_event_time = queue.map.first_key_value().map(|(&t, _)| t);
        }
        result.map(|_| now)
    }

    async fn run_instant(&self, now: SimTime) -> Result<(), SimError> {
        // основная партия текущего момента
        loop {
            if self.flags.interrupt_requested() {
                return Ok(());
            }
            let next = {
                let mut queue = self.queue.lock().await;
                match queue.map.get_mut(&now) {
                    Some(bucket) => {
                        let popped = bucket.pop_first().map(|(_, instance)| instance);
                        if bucket.is_empty() {
                            queue.map.remove(&now);
                        }
                        popped
                    }
                    None => None,
                }
            };
            let Some(instance) = next else { break };
            self.raise_one(now, instance).await?;
        }

        // немедленные события после основной партии
        loop {
            if self.flags.interrupt_requested() {
                return Ok(());
            }
            let next = {
                let mut queue = self.queue.lock().await;
                if queue.immediate.is_empty() {
                    None
                } else {
                    queue.phase = Phase::Immediate;
                    queue.immediate.pop_first().map(|(_, instance)| instance)
                }
            };
            let Some(instance) = next else { break };
            self.raise_one(now, instance).await?;
        }
        Ok(())
    }

    async fn raise_one(&self, now: SimTime, instance: EventInstance) -> Result<(), SimError> {
        {
            self.tracking.lock().await.current = Some(instance.clone());
        }

        let mut ctx = EventContext::new(now, instance.name());
        let invoked = match instance.raise(&mut ctx).await {
            Ok(invoked) => invoked,
            Err(e) => {
                self.tracking.lock().await.current = None;
                return Err(e);
            }
        };

        {
            let mut counters = self.counters.lock().await;
            counters.events += 1;
            counters.handlers += invoked as u64;
        }
        {
            let mut tracking = self.tracking.lock().await;
            tracking.last = Some(instance.clone());
            tracking.current = None;
        }
        if self.logging_enabled() && instance.logged() {
            debug!("Обработано событие '{}' в {}", instance.name(), now);
        }

        self.apply_commands(now, ctx.take_commands()).await
    }

    async fn apply_commands(
        &self,
        now: SimTime,
        commands: Vec<ContextCommand>,
    ) -> Result<(), SimError> {
        for command in commands {
            match command {
                ContextCommand::ScheduleAt(time, instance) => {
                    self.add(time, instance).await?;
                }
                ContextCommand::ScheduleIn(delay, instance) => {
                    self.add(now + delay, instance).await?;
                }
                ContextCommand::ScheduleNow(instance) => {
                    self.add_event_now(instance).await?;
                }
                ContextCommand::Interrupt => self.flags.request_interrupt(),
                ContextCommand::Pause => self.flags.request_pause(),
                ContextCommand::Stop => self.flags.request_stop(),
            }
        }
        Ok(())
    }

    pub async fn has_events(&self) -> bool {
        let queue = self.queue.lock().await;
        !queue.map.is_empty() || !queue.immediate.is_empty()
    }

    pub async fn clear_events(&self) {
        let mut queue = self.queue.lock().await;
        queue.map.clear();
        queue.immediate.clear();
        queue.next_event_time = None;
        debug!("Очередь событий очищена");
    }

    /// Кэш времени ближайшего события; `None` означает пустую очередь
    pub async fn next_event_time(&self) -> Option<SimTime> {
        self.queue.lock().await.next_event_time
    }

    /// Ближайший по порядку обработки экземпляр, без снятия с очереди
    pub async fn next_scheduled_event(&self) -> Option<EventInstance> {
        let queue = self.queue.lock().await;
        queue
            .map
            .first_key_value()
            .and_then(|(_, bucket)| bucket.first_key_value())
            .map(|(_, instance)| instance.clone())
    }

    /// Событие, обработчики которого выполняются прямо сейчас
    pub async fn current_event(&self) -> Option<EventInstance> {
        self.tracking.lock().await.current.clone()
    }

    pub async fn last_processed_event(&self) -> Option<EventInstance> {
        self.tracking.lock().await.last.clone()
    }

    pub async fn event_counter(&self) -> u64 {
        self.counters.lock().await.events
    }

    pub async fn handler_counter(&self) -> u64 {
        self.counters.lock().await.handlers
    }

    /// Обнулить счетчики обработки, не трогая очередь
    pub async fn reset_event_counter(&self) {
        let mut counters = self.counters.lock().await;
        counters.events = 0;
        counters.handlers = 0;
    }

    /// Полный сброс для переиспользования между независимыми прогонами
    pub async fn reset(&self) {
        {
            let mut queue = self.queue.lock().await;
            queue.map.clear();
            queue.immediate.clear();
            queue.order_counter = 0;
            queue.next_event_time = None;
            queue.phase = Phase::Idle;
        }
        self.set_now(SimTime::ZERO).await;
        self.reset_event_counter().await;
        {
            let mut tracking = self.tracking.lock().await;
            tracking.current = None;
            tracking.last = None;
        }
        self.flags.clear();
        debug!("Планировщик сброшен");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize, Deserialize)]
struct QueuedInstance {
    time: SimTime,
    priority: Priority,
    event: String,
}

impl Scheduler {
    /// Сохранить состояние планировщика в срез "ключ-значение"
    pub async fn save_state(&self, snapshot: &mut Snapshot) -> Result<(), SimError> {
        {
            let queue = self.queue.lock().await;
            let queued: Vec<QueuedInstance> = queue
                .map
                .iter()
                .flat_map(|(&time, bucket)| {
                    bucket.values().map(move |instance| QueuedInstance {
                        time,
                        priority: instance.priority(),
                        event: instance.name().to_string(),
                    })
                })
                .collect();
            snapshot.add_value("scheduler.queue", &queued)?;
            snapshot.add_value("scheduler.next_event_time", &queue.next_event_time)?;
            snapshot.add_value("scheduler.order_counter", &queue.order_counter)?;
        }
        {
            let counters = self.counters.lock().await;
            snapshot.add_value("scheduler.event_counter", &counters.events)?;
            snapshot.add_value("scheduler.handler_counter", &counters.handlers)?;
        }
        snapshot.add_value("scheduler.logging", &self.logging_enabled())?;
        let now = self.now().await;
        snapshot.add_value("scheduler.now", &now)?;
        Ok(())
    }

    /// Восстановить состояние из среза. Экземпляры собираются заново по
    /// реестру шаблонов, так как обработчики не сериализуются.
    pub async fn restore_state(
        &self,
        snapshot: &Snapshot,
        registry: &HashMap<String, EventRef>,
    ) -> Result<(), SimError> {
        let queued: Vec<QueuedInstance> = snapshot.get_value("scheduler.queue")?;
        let next_event_time: Option<SimTime> = snapshot.get_value("scheduler.next_event_time")?;
        let order_counter: u64 = snapshot.get_value("scheduler.order_counter")?;
        let events: u64 = snapshot.get_value("scheduler.event_counter")?;
        let handlers: u64 = snapshot.get_value("scheduler.handler_counter")?;
        let logging: bool = snapshot.get_value("scheduler.logging")?;
        let now: SimTime = snapshot.get_value("scheduler.now")?;

        let mut map: BTreeMap<SimTime, BTreeMap<Priority, EventInstance>> = BTreeMap::new();
        for record in queued {
            let event = registry
                .get(&record.event)
                .ok_or_else(|| SimError::UnknownEvent(record.event.clone()))?;
            // клонирование приоритета сохраняет выданный порядок добавления
            let mut instance = EventInstance::of(event).await.with_priority(record.priority);
            instance.set_time(record.time);
            map.entry(record.time)
                .or_default()
                .insert(record.priority, instance);
        }

        {
            let mut queue = self.queue.lock().await;
            queue.map = map;
            queue.immediate.clear();
            queue.order_counter = order_counter;
            queue.next_event_time = next_event_time;
            queue.phase = Phase::Idle;
        }
        {
            let mut counters = self.counters.lock().await;
            counters.events = events;
            counters.handlers = handlers;
        }
        self.set_logging_enabled(logging);
        self.set_now(now).await;
        {
            let mut tracking = self.tracking.lock().await;
            tracking.current = None;
            tracking.last = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::Event;

    #[tokio::test]
    async fn add_rejects_past_and_nan_times() {
        let scheduler = Scheduler::new();
        let event = Event::shared("tick");

        let instance = EventInstance::of(&event).await;
        let err = scheduler.add(SimTime::ZERO, instance).await.unwrap_err();
        assert!(matches!(err, SimError::TimeNotInFuture { .. }));

        let instance = EventInstance::of(&event).await;
        let err = scheduler
            .add(SimTime::new(f64::NAN), instance)
            .await
            .unwrap_err();
        assert!(matches!(err, SimError::InvalidTime(_)));
    }

    #[tokio::test]
    async fn remove_is_benign_on_absent_token() {
        let scheduler = Scheduler::new();
        let event = Event::shared("tick");
        let instance = EventInstance::of(&event).await;

        let token = scheduler.add(SimTime::new(5.0), instance).await.unwrap();
        assert!(scheduler.remove(&token).await);
        assert!(!scheduler.remove(&token).await);
        assert_eq!(scheduler.next_event_time().await, None);
    }

    #[tokio::test]
    async fn immediate_event_outside_processing_is_fatal() {
        let scheduler = Scheduler::new();
        let event = Event::shared("tick");
        let instance = EventInstance::of(&event).await;

        let err = scheduler.add_event_now(instance).await.unwrap_err();
        assert!(matches!(err, SimError::ImmediateOutsideProcessing));
    }

    #[tokio::test]
    async fn next_event_time_tracks_the_minimum() {
        let scheduler = Scheduler::new();
        let event = Event::shared("tick");

        scheduler
            .add(SimTime::new(7.0), EventInstance::of(&event).await)
            .await
            .unwrap();
        assert_eq!(scheduler.next_event_time().await, Some(SimTime::new(7.0)));

        let token = scheduler
            .add(SimTime::new(3.0), EventInstance::of(&event).await)
            .await
            .unwrap();
        assert_eq!(scheduler.next_event_time().await, Some(SimTime::new(3.0)));

        scheduler.remove(&token).await;
        assert_eq!(scheduler.next_event_time().await, Some(SimTime::new(7.0)));
    }
}
