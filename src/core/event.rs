//! Система событий для симуляции

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::priority::Priority;
use super::time::{Duration, SimTime};
use crate::SimError;

/// Обработчик события. Ошибка обработчика не перехватывается
/// диспетчером и всплывает до цикла запуска.
pub type Handler = Box<dyn FnMut(&mut EventContext) -> anyhow::Result<()> + Send>;

/// Общая ссылка на шаблон события
pub type EventRef = Arc<Mutex<Event>>;

/// Токен обработчика, выданный `add_handler`. Замыкания анонимны,
/// поэтому удаление идет по токену.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

struct HandlerSlot {
    id: HandlerId,
    func: Handler,
}

/// Шаблон события: имя, приоритет по умолчанию и упорядоченный
/// набор обработчиков.
///
/// Из одного шаблона порождается произвольное число экземпляров
/// (`EventInstance`), каждый со своим временем и приоритетом.
pub struct Event {
    name: String,
    default_priority: Priority,
    logged: bool,
    handlers: BTreeMap<Priority, HandlerSlot>,
    handler_order: u64,
}

impl Event {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            default_priority: Priority::default(),
            logged: true,
            handlers: BTreeMap::new(),
            handler_order: 0,
        }
    }

    /// Создать шаблон сразу в общей обертке
    pub fn shared(name: &str) -> EventRef {
        Arc::new(Mutex::new(Event::new(name)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_priority(&self) -> Priority {
        self.default_priority
    }

    pub fn set_default_priority(&mut self, priority: Priority) {
        self.default_priority = priority;
    }

    /// Участвует ли событие в диагностическом логе
    pub fn logged(&self) -> bool {
        self.logged
    }

    pub fn set_logged(&mut self, logged: bool) {
        self.logged = logged;
    }

    /// Добавить обработчик с приоритетом по умолчанию.
    /// Обработчики без явного приоритета срабатывают в порядке добавления.
    pub fn add_handler(&mut self, handler: Handler) -> HandlerId {
        self.add_handler_with_priority(handler, Priority::default())
    }

    /// Добавить обработчик с явным приоритетом
    pub fn add_handler_with_priority(
        &mut self,
        handler: Handler,
        mut priority: Priority,
    ) -> HandlerId {
        self.handler_order += 1;
        priority.set_order(self.handler_order);
        let id = HandlerId(self.handler_order);
        self.handlers.insert(priority, HandlerSlot { id, func: handler });
        id
    }

    /// Убрать обработчик. `false`, если токен уже не привязан
    pub fn remove_handler(&mut self, id: HandlerId) -> bool {
        let key = self
            .handlers
            .iter()
            .find(|(_, slot)| slot.id == id)
            .map(|(priority, _)| *priority);
        match key {
            Some(priority) => self.handlers.remove(&priority).is_some(),
            None => false,
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Вызвать все обработчики в порядке возрастания приоритета.
    /// Возвращает число вызванных обработчиков.
    pub fn raise(&mut self, ctx: &mut EventContext) -> Result<usize, SimError> {
        let mut invoked = 0;
        for slot in self.handlers.values_mut() {
            (slot.func)(ctx).map_err(SimError::Handler)?;
            invoked += 1;
        }
        Ok(invoked)
    }
}

/// Один запланированный экземпляр события.
///
/// Несет собственное время и приоритет; имя и флаг логирования
/// кэшируются из шаблона при создании.
#[derive(Clone)]
pub struct EventInstance {
    event: EventRef,
    name: String,
    logged: bool,
    priority: Priority,
    time: SimTime,
}

impl EventInstance {
    /// Породить экземпляр из шаблона. Приоритет копируется из
    /// приоритета шаблона по умолчанию.
    pub async fn of(event: &EventRef) -> Self {
        let template = event.lock().await;
        Self {
            event: event.clone(),
            name: template.name().to_string(),
            logged: template.logged(),
            priority: template.default_priority(),
            time: SimTime::ZERO,
        }
    }

    /// Переопределить приоритет этого экземпляра
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn logged(&self) -> bool {
        self.logged
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn time(&self) -> SimTime {
        self.time
    }

    pub fn event(&self) -> &EventRef {
        &self.event
    }

    pub async fn handler_count(&self) -> usize {
        self.event.lock().await.handler_count()
    }

    pub(crate) fn set_time(&mut self, time: SimTime) {
        self.time = time;
    }

    pub(crate) fn set_order(&mut self, order: u64) {
        self.priority.set_order(order);
    }

    pub(crate) async fn raise(&self, ctx: &mut EventContext) -> Result<usize, SimError> {
        let mut template = self.event.lock().await;
        template.raise(ctx)
    }
}

/// Отложенная команда, собранная во время вызова обработчика
pub(crate) enum ContextCommand {
    ScheduleAt(SimTime, EventInstance),
    ScheduleIn(Duration, EventInstance),
    ScheduleNow(EventInstance),
    Interrupt,
    Pause,
    Stop,
}

/// Контекст, передаваемый обработчику при вызове.
///
/// Планирование из обработчика буферизуется и применяется
/// планировщиком после возврата из обработчика, поэтому обработчик
/// не держит блокировку очереди.
pub struct EventContext {
    now: SimTime,
    event_name: String,
    commands: Vec<ContextCommand>,
}

impl EventContext {
    pub(crate) fn new(now: SimTime, event_name: &str) -> Self {
        Self {
            now,
            event_name: event_name.to_string(),
            commands: Vec::new(),
        }
    }

    /// Текущее время симуляции
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Имя события, обработчик которого выполняется
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// Запланировать событие на абсолютное время (строго в будущем)
    pub fn schedule(&mut self, time: SimTime, instance: EventInstance) {
        self.commands.push(ContextCommand::ScheduleAt(time, instance));
    }

    /// Запланировать событие через указанную задержку
    pub fn schedule_in(&mut self, delay: Duration, instance: EventInstance) {
        self.commands.push(ContextCommand::ScheduleIn(delay, instance));
    }

    /// Запланировать немедленное событие на текущий момент.
    /// Недопустимо из обработчика немедленного события.
    pub fn schedule_now(&mut self, instance: EventInstance) {
        self.commands.push(ContextCommand::ScheduleNow(instance));
    }

    /// Запросить прерывание обработки (действует между событиями)
    pub fn request_interrupt(&mut self) {
        self.commands.push(ContextCommand::Interrupt);
    }

    /// Запросить паузу (действует между моментами времени)
    pub fn request_pause(&mut self) {
        self.commands.push(ContextCommand::Pause);
    }

    /// Запросить остановку прогона
    pub fn request_stop(&mut self) {
        self.commands.push(ContextCommand::Stop);
    }

    pub(crate) fn take_commands(&mut self) -> Vec<ContextCommand> {
        std::mem::take(&mut self.commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::priority::PriorityClass;

    #[tokio::test]
    async fn handlers_fire_in_attachment_order_by_default() {
        let event = Event::shared("arrival");
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            event.lock().await.add_handler(Box::new(move |_ctx| {
                order.lock().unwrap().push(tag);
                Ok(())
            }));
        }

        let mut ctx = EventContext::new(SimTime::ZERO, "arrival");
        let invoked = event.lock().await.raise(&mut ctx).unwrap();
        assert_eq!(invoked, 3);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn explicit_priority_reorders_handlers() {
        let event = Event::shared("arrival");
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        {
            let order = order.clone();
            event.lock().await.add_handler(Box::new(move |_ctx| {
                order.lock().unwrap().push("late");
                Ok(())
            }));
        }
        {
            let order = order.clone();
            event.lock().await.add_handler_with_priority(
                Box::new(move |_ctx| {
                    order.lock().unwrap().push("early");
                    Ok(())
                }),
                Priority::new(PriorityClass::SimWorldBeforeOthers, 0.0),
            );
        }

        let mut ctx = EventContext::new(SimTime::ZERO, "arrival");
        event.lock().await.raise(&mut ctx).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["early", "late"]);
    }

    #[tokio::test]
    async fn remove_handler_is_benign_when_absent() {
        let event = Event::shared("arrival");
        let id = event
            .lock()
            .await
            .add_handler(Box::new(|_ctx| Ok(())));

        assert!(event.lock().await.remove_handler(id));
        assert!(!event.lock().await.remove_handler(id));
        assert_eq!(event.lock().await.handler_count(), 0);
    }

    #[tokio::test]
    async fn handler_error_aborts_the_raise() {
        let event = Event::shared("arrival");
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        {
            let order = order.clone();
            event.lock().await.add_handler(Box::new(move |_ctx| {
                order.lock().unwrap().push("ran");
                anyhow::bail!("teller went home")
            }));
        }
        {
            let order = order.clone();
            event.lock().await.add_handler(Box::new(move |_ctx| {
                order.lock().unwrap().push("never");
                Ok(())
            }));
        }

        let mut ctx = EventContext::new(SimTime::ZERO, "arrival");
        let err = event.lock().await.raise(&mut ctx).unwrap_err();
        assert!(matches!(err, SimError::Handler(_)));
        assert_eq!(*order.lock().unwrap(), vec!["ran"]);
    }
}
